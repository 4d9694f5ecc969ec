//! Impure I/O for the MQTT binding
//!
//! Owns the `rumqttc` client and event loop. The event loop runs on its own tokio
//! task and only ever forwards notifications through the [`EventSink`]; every
//! state decision is made by the lifecycle core that consumes them.
//!
//! Acknowledgments and the final DISCONNECT go through a second task that waits
//! for room in the client's bounded request channel, so a burst of deliveries
//! never loses a PUBACK and the DISCONNECT never overtakes one.

use super::options::{configure_mqtt_options, MqttSessionSettings};
use super::routing::{
    metadata_for, route_event, session_loss_event, EventRoute, SubscriptionChange,
    SubscriptionTracker,
};
use crate::broker::{
    AckMode, Acknowledger, BrokerError, BrokerSession, ConnectionParams, ConsumerEvent,
    ConsumerHandle, ConsumerProperties, EventSink, InboundMessage, SessionEvent, SessionFactory,
};
use rumqttc::{AsyncClient, EventLoop, Publish, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates MQTT sessions
#[derive(Debug, Clone, Default)]
pub struct MqttSessionFactory {
    settings: MqttSessionSettings,
}

impl MqttSessionFactory {
    pub fn new(settings: MqttSessionSettings) -> Self {
        Self { settings }
    }
}

impl SessionFactory for MqttSessionFactory {
    type Session = MqttSession;

    fn create_session(
        &mut self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<MqttSession, BrokerError> {
        let options = configure_mqtt_options(params, &self.settings)?;
        let (client, event_loop) = AsyncClient::new(options, self.settings.channel_capacity);

        Ok(MqttSession {
            client,
            event_loop: Some(event_loop),
            events,
            outbound: None,
            stop_tx: None,
            poll_handle: None,
        })
    }
}

/// One MQTT connection and its event-loop task
pub struct MqttSession {
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    events: EventSink,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    stop_tx: Option<watch::Sender<bool>>,
    poll_handle: Option<JoinHandle<()>>,
}

impl BrokerSession for MqttSession {
    type Consumer = MqttConsumer;

    fn connect(&mut self) -> Result<(), BrokerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::call_failed("session.connect", e))?;
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| BrokerError::rejected("session.connect", "event loop already started"))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        runtime.spawn(forward_outbound(
            self.client.clone(),
            outbound_rx,
            stop_rx.clone(),
        ));
        let handle = runtime.spawn(drive_event_loop(
            event_loop,
            outbound_tx.clone(),
            self.events.clone(),
            stop_rx,
        ));

        self.outbound = Some(outbound_tx);
        self.stop_tx = Some(stop_tx);
        self.poll_handle = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(BrokerError::rejected(
                "session.disconnect",
                "session was never connected",
            ));
        };
        outbound
            .send(Outbound::Disconnect)
            .map_err(|_| BrokerError::call_failed("session.disconnect", "event loop has stopped"))
    }

    fn dispose(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        // Detach; the task exits on the stop signal or on its own terminal event.
        self.poll_handle.take();
        self.outbound.take();
        self.event_loop.take();
    }

    fn create_consumer(
        &self,
        properties: &ConsumerProperties,
    ) -> Result<MqttConsumer, BrokerError> {
        if properties.ack_mode != AckMode::Client {
            return Err(BrokerError::InvalidParams(
                "the MQTT binding only supports client acknowledgment".to_string(),
            ));
        }
        if properties.queue_name.is_empty() {
            return Err(BrokerError::InvalidParams("queue name is empty".to_string()));
        }

        // Topics need no provisioning, so create_if_missing always holds.
        Ok(MqttConsumer {
            client: self.client.clone(),
            topic: properties.queue_name.clone(),
            disposed: false,
        })
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
    }
}

/// Subscription standing in for a durable queue attachment
pub struct MqttConsumer {
    client: AsyncClient,
    topic: String,
    disposed: bool,
}

impl MqttConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl ConsumerHandle for MqttConsumer {
    fn connect(&mut self) -> Result<(), BrokerError> {
        if self.disposed {
            return Err(BrokerError::rejected("consumer.connect", "consumer disposed"));
        }
        self.client
            .try_subscribe(self.topic.clone(), QoS::AtLeastOnce)
            .map_err(|e| BrokerError::call_failed("consumer.connect", e))
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        if self.disposed {
            return Err(BrokerError::rejected(
                "consumer.disconnect",
                "consumer disposed",
            ));
        }
        self.client
            .try_unsubscribe(self.topic.clone())
            .map_err(|e| BrokerError::call_failed("consumer.disconnect", e))
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

/// Requests that must reach the event loop in order
#[derive(Debug)]
enum Outbound {
    Ack(Publish),
    Disconnect,
}

/// Queues the PUBACK for one delivery
struct MqttAcknowledger {
    outbound: mpsc::UnboundedSender<Outbound>,
    publish: Publish,
}

impl Acknowledger for MqttAcknowledger {
    fn acknowledge(&mut self) -> Result<(), BrokerError> {
        self.outbound
            .send(Outbound::Ack(self.publish.clone()))
            .map_err(|_| BrokerError::call_failed("message.acknowledge", "event loop has stopped"))
    }
}

/// Hand queued acks and the DISCONNECT to the event loop, waiting for channel room
async fn forward_outbound(
    client: AsyncClient,
    mut requests: mpsc::UnboundedReceiver<Outbound>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let sent = match &request {
            Outbound::Ack(publish) => client.ack(publish).await,
            Outbound::Disconnect => client.disconnect().await,
        };
        if let Err(e) = sent {
            warn!("Event loop gone, dropping {:?}: {}", request, e);
            break;
        }
    }
}

fn forward_delivery(
    events: &EventSink,
    outbound: &mpsc::UnboundedSender<Outbound>,
    publish: Publish,
) {
    let metadata = metadata_for(&publish);
    let payload = publish.payload.clone();
    let acknowledger = MqttAcknowledger {
        outbound: outbound.clone(),
        publish,
    };
    events.consumer_event(ConsumerEvent::Message(InboundMessage::new(
        payload,
        metadata,
        Box::new(acknowledger),
    )));
}

/// Poll the event loop until the session ends or is disposed. Never reconnects.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: EventSink,
    mut stop_rx: watch::Receiver<bool>,
) {
    let session = events.session_id();
    let mut up = false;
    let mut subscription = SubscriptionTracker::default();
    debug!(%session, "MQTT event loop started");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(%session, "MQTT event loop stopped on dispose");
                    break;
                }
            }
            polled = event_loop.poll() => {
                let event = match polled {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(%session, up, "MQTT event loop error: {}", e);
                        events.session_event(session_loss_event(up, e.to_string()));
                        break;
                    }
                };

                match route_event(&event) {
                    EventRoute::SessionUp { session_present } => {
                        info!(%session, session_present, "MQTT session acknowledged by broker");
                        up = true;
                        events.session_event(SessionEvent::Up);
                    }
                    EventRoute::SubscribeSent { packet_id } => {
                        subscription.subscribe_sent(packet_id);
                    }
                    EventRoute::UnsubscribeSent { packet_id } => {
                        subscription.unsubscribe_sent(packet_id);
                    }
                    EventRoute::SubscriptionGranted { packet_id } => {
                        let change = subscription.suback(packet_id, None);
                        apply_subscription_change(&events, packet_id, change);
                        for publish in subscription.release_held() {
                            forward_delivery(&events, &outbound, publish);
                        }
                    }
                    EventRoute::SubscriptionRefused { packet_id, reason } => {
                        let change = subscription.suback(packet_id, Some(reason));
                        apply_subscription_change(&events, packet_id, change);
                    }
                    EventRoute::Unsubscribed { packet_id } => {
                        let change = subscription.unsuback(packet_id);
                        apply_subscription_change(&events, packet_id, change);
                    }
                    EventRoute::Delivery(publish) => {
                        match subscription.admit(publish) {
                            Some(publish) => forward_delivery(&events, &outbound, publish),
                            None => debug!(
                                %session,
                                held = subscription.held(),
                                "Holding delivery until the subscription is granted"
                            ),
                        }
                    }
                    EventRoute::BrokerDisconnect => {
                        events.session_event(session_loss_event(
                            up,
                            "broker closed the session".to_string(),
                        ));
                        break;
                    }
                    EventRoute::ClientDisconnectSent => {
                        events.session_event(SessionEvent::Disconnected(
                            "client disconnect completed".to_string(),
                        ));
                        break;
                    }
                    EventRoute::Infrastructure(description) => {
                        tracing::trace!(target: "mqtt_transport", %session, "MQTT event: {}", description);
                    }
                    EventRoute::Outgoing => {}
                }
            }
        }
    }

    debug!(%session, "MQTT event loop exited");
}

fn apply_subscription_change(events: &EventSink, packet_id: u16, change: SubscriptionChange) {
    let session = events.session_id();
    match change {
        SubscriptionChange::Attached => {
            debug!(%session, packet_id, "Subscription granted");
            events.consumer_event(ConsumerEvent::Up);
        }
        SubscriptionChange::AttachRefused(reason) => {
            debug!(%session, packet_id, "Subscription refused");
            events.consumer_event(ConsumerEvent::ConnectFailedError(reason));
        }
        SubscriptionChange::Detached => {
            debug!(%session, packet_id, "Unsubscribe confirmed");
        }
        SubscriptionChange::Dropped(reason) => {
            warn!(%session, packet_id, "Broker dropped the subscription: {}", reason);
            events.consumer_event(ConsumerEvent::DownError(reason));
        }
        SubscriptionChange::Unmatched => {
            debug!(%session, packet_id, "Ignoring unmatched subscription acknowledgment");
        }
    }
}
