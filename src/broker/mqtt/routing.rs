//! Pure routing of MQTT event-loop events onto broker notifications

use crate::broker::{MessageMetadata, SessionEvent};
use rumqttc::{Event, Outgoing, Packet, Publish, SubscribeReasonCode};
use std::collections::VecDeque;

/// What an MQTT event means for the session and its consumer
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// CONNACK accepted
    SessionUp { session_present: bool },
    /// SUBACK granted the subscription
    SubscriptionGranted { packet_id: u16 },
    /// SUBACK refused at least one filter
    SubscriptionRefused { packet_id: u16, reason: String },
    /// UNSUBACK received
    Unsubscribed { packet_id: u16 },
    /// Our SUBSCRIBE went out
    SubscribeSent { packet_id: u16 },
    /// Our UNSUBSCRIBE went out
    UnsubscribeSent { packet_id: u16 },
    Delivery(Publish),
    /// Broker sent DISCONNECT
    BrokerDisconnect,
    /// Our own DISCONNECT went out
    ClientDisconnectSent,
    /// Pings, publish acks and similar
    Infrastructure(String),
    Outgoing,
}

pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(connack) => EventRoute::SessionUp {
                session_present: connack.session_present,
            },
            Packet::SubAck(suback) => {
                let refused = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    EventRoute::SubscriptionRefused {
                        packet_id: suback.pkid,
                        reason: "broker refused the subscription (queue missing or permission denied)"
                            .to_string(),
                    }
                } else {
                    EventRoute::SubscriptionGranted {
                        packet_id: suback.pkid,
                    }
                }
            }
            Packet::UnsubAck(unsuback) => EventRoute::Unsubscribed {
                packet_id: unsuback.pkid,
            },
            Packet::Publish(publish) => EventRoute::Delivery(publish.clone()),
            Packet::Disconnect => EventRoute::BrokerDisconnect,
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::ClientDisconnectSent,
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent { packet_id: *pkid },
        Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
            EventRoute::UnsubscribeSent { packet_id: *pkid }
        }
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}

/// What a SUBACK or UNSUBACK means once matched against our own requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Our SUBSCRIBE was granted
    Attached,
    AttachRefused(String),
    /// Our UNSUBSCRIBE was confirmed; the consumer already stopped
    Detached,
    /// The broker dropped an attached subscription without being asked
    Dropped(String),
    /// Acknowledges nothing we are waiting for
    Unmatched,
}

/// Tracks the one queue subscription of a session.
///
/// A resumed persistent session replays stored deliveries right after CONNACK,
/// before the SUBACK arrives. Those are held here and released in order once the
/// subscription is attached, so the consumer sees them while `Active`.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    pending_subscribe: Option<u16>,
    pending_unsubscribe: Option<u16>,
    attached: bool,
    held: VecDeque<Publish>,
}

impl SubscriptionTracker {
    pub fn subscribe_sent(&mut self, packet_id: u16) {
        self.pending_subscribe = Some(packet_id);
    }

    pub fn unsubscribe_sent(&mut self, packet_id: u16) {
        self.pending_unsubscribe = Some(packet_id);
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Deliveries waiting for the subscription to attach
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Apply a SUBACK; `refusal` is set when the broker refused the filter
    pub fn suback(&mut self, packet_id: u16, refusal: Option<String>) -> SubscriptionChange {
        if self.pending_subscribe == Some(packet_id) {
            self.pending_subscribe = None;
            return match refusal {
                None => {
                    self.attached = true;
                    SubscriptionChange::Attached
                }
                Some(reason) => SubscriptionChange::AttachRefused(reason),
            };
        }

        match refusal {
            Some(reason) if self.attached => {
                self.attached = false;
                SubscriptionChange::Dropped(reason)
            }
            _ => SubscriptionChange::Unmatched,
        }
    }

    pub fn unsuback(&mut self, packet_id: u16) -> SubscriptionChange {
        if self.pending_unsubscribe == Some(packet_id) {
            self.pending_unsubscribe = None;
            self.attached = false;
            SubscriptionChange::Detached
        } else if self.attached {
            self.attached = false;
            SubscriptionChange::Dropped("broker removed the subscription".to_string())
        } else {
            SubscriptionChange::Unmatched
        }
    }

    /// Pass a delivery through once attached; hold it otherwise
    pub fn admit(&mut self, publish: Publish) -> Option<Publish> {
        if self.attached {
            Some(publish)
        } else {
            self.held.push_back(publish);
            None
        }
    }

    /// Held deliveries in arrival order
    pub fn release_held(&mut self) -> Vec<Publish> {
        self.held.drain(..).collect()
    }
}

/// Notification for a session that ended, depending on whether it was ever up
pub fn session_loss_event(was_up: bool, reason: String) -> SessionEvent {
    if was_up {
        SessionEvent::Disconnected(reason)
    } else {
        SessionEvent::ConnectFailed(reason)
    }
}

pub fn metadata_for(publish: &Publish) -> MessageMetadata {
    let mut metadata = MessageMetadata::new(publish.topic.clone());
    metadata.delivery_id = Some(u64::from(publish.pkid));
    metadata.redelivered = publish.dup;
    metadata
        .properties
        .insert("qos".to_string(), format!("{:?}", publish.qos));
    metadata
        .properties
        .insert("retain".to_string(), publish.retain.to_string());
    metadata
}
