//! Durable-queue attachment lifecycle
//!
//! `Idle -> Attaching -> Active`, `Attaching -> AttachFailed`, `Active -> Inactive`
//! on a broker-side drop, and back to `Idle` on an explicit stop.

use super::connection::ConnectionManager;
use super::handler::MessageHandler;
use super::Transition;
use crate::broker::{
    AckOutcome, BrokerError, BrokerSession, ConsumerEvent, ConsumerHandle, ConsumerProperties,
    InboundMessage, SessionFactory, SessionId,
};
use std::fmt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Idle,
    /// Attachment requested, waiting for the broker
    Attaching,
    /// Receiving deliveries
    Active,
    /// The broker refused the attachment
    AttachFailed,
    /// The broker dropped a previously active attachment
    Inactive,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Attaching => "attaching",
            ConsumerState::Active => "active",
            ConsumerState::AttachFailed => "attach-failed",
            ConsumerState::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Side effects of an attachment transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerCommand {
    /// Dispose the attachment handle
    DisposeAttachment,
    /// Run the full shutdown sequence and exit
    RequestShutdown,
}

/// Pure attachment transition. `None` means the event does not apply in `state`.
///
/// Deliveries never change state and are not handled here.
pub fn next_consumer_state(
    state: ConsumerState,
    event: &ConsumerEvent,
) -> Option<Transition<ConsumerState, ConsumerCommand>> {
    use ConsumerCommand::*;
    use ConsumerState::*;

    match (state, event) {
        (Attaching, ConsumerEvent::Up) => Some(Transition::to(Active)),
        (Attaching, ConsumerEvent::ConnectFailedError(_)) => Some(Transition::with(
            AttachFailed,
            vec![DisposeAttachment, RequestShutdown],
        )),
        (Active, ConsumerEvent::Down | ConsumerEvent::DownError(_)) => {
            Some(Transition::to(Inactive))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Attachment requested; `Up` or `ConnectFailedError` follows
    Requested,
    AlreadyActive,
    InProgress,
    /// The session is not connected; nothing was created
    NotConnected,
    /// Start is not valid from this state
    Rejected(ConsumerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Active attachment disconnected and disposed
    Stopped,
    /// Inactive attachment disposed
    Released,
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    /// The handler ran but the acknowledgment call failed
    AckFailed,
    /// Not attached; the delivery was neither handled nor acknowledged
    Ignored,
}

/// Owns the attachment to one named durable queue
pub struct QueueConsumer<C: ConsumerHandle> {
    queue_name: String,
    state: ConsumerState,
    handle: Option<C>,
    session: Option<SessionId>,
    deliveries: u64,
}

impl<C: ConsumerHandle> QueueConsumer<C> {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            state: ConsumerState::Idle,
            handle: None,
            session: None,
            deliveries: 0,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }

    pub fn has_attachment(&self) -> bool {
        self.handle.is_some()
    }

    /// Session the current attachment was created on
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Deliveries handed to the handler so far
    pub fn deliveries(&self) -> u64 {
        self.deliveries
    }

    /// Request attachment to the queue on `connection`'s session.
    ///
    /// Accepted from `Idle` and `Inactive` while the session is connected. Returns
    /// as soon as the request is issued. A synchronous broker failure is returned
    /// with the state unchanged.
    pub fn start<F>(&mut self, connection: &ConnectionManager<F>) -> Result<StartOutcome, BrokerError>
    where
        F: SessionFactory,
        F::Session: BrokerSession<Consumer = C>,
    {
        match self.state {
            ConsumerState::Active => {
                info!(queue = %self.queue_name, "Consumer already active");
                return Ok(StartOutcome::AlreadyActive);
            }
            ConsumerState::Attaching => {
                info!(queue = %self.queue_name, "Consumer attachment already in progress");
                return Ok(StartOutcome::InProgress);
            }
            ConsumerState::AttachFailed => {
                warn!(queue = %self.queue_name, state = %self.state, "Consumer cannot be restarted");
                return Ok(StartOutcome::Rejected(self.state));
            }
            ConsumerState::Idle | ConsumerState::Inactive => {}
        }

        let (Some(session), Some(session_id)) = (connection.session(), connection.session_id())
        else {
            warn!(
                queue = %self.queue_name,
                connection = %connection.state(),
                "Cannot start consumer: not connected to broker"
            );
            return Ok(StartOutcome::NotConnected);
        };

        self.release_handle();

        info!(queue = %self.queue_name, "Attaching to durable queue");
        let properties = ConsumerProperties::durable_queue(self.queue_name.clone());
        let mut handle = session.create_consumer(&properties).map_err(|e| {
            error!(
                state = %self.state,
                operation = "consumer.create",
                queue = %self.queue_name,
                error = %e,
                "Failed to create consumer"
            );
            e
        })?;

        if let Err(e) = handle.connect() {
            error!(
                state = %self.state,
                operation = "consumer.connect",
                queue = %self.queue_name,
                error = %e,
                "Failed to request consumer attachment"
            );
            handle.dispose();
            return Err(e);
        }

        self.handle = Some(handle);
        self.session = Some(session_id);
        self.transition(ConsumerState::Attaching);
        Ok(StartOutcome::Requested)
    }

    /// Detach from the queue.
    ///
    /// An active attachment is disconnected then disposed; an inactive one is only
    /// disposed. Broker call failures are logged and the attachment is released
    /// regardless.
    pub fn stop(&mut self) -> StopOutcome {
        match self.state {
            ConsumerState::Active => {
                info!(queue = %self.queue_name, "Stopping consumer");
                if let Some(handle) = self.handle.as_mut() {
                    if let Err(e) = handle.disconnect() {
                        error!(
                            state = %self.state,
                            operation = "consumer.disconnect",
                            queue = %self.queue_name,
                            error = %e,
                            "Failed to disconnect consumer"
                        );
                    }
                }
                self.detach();
                StopOutcome::Stopped
            }
            ConsumerState::Inactive => {
                self.detach();
                StopOutcome::Released
            }
            state => {
                info!(queue = %self.queue_name, %state, "Consumer not active, nothing to stop");
                StopOutcome::NotActive
            }
        }
    }

    /// The owning session is gone. The handle is dropped without further calls.
    pub fn session_lost(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(%session, queue = %self.queue_name, "Attachment invalidated by session loss");
        }
        self.handle = None;
        if !matches!(self.state, ConsumerState::Idle | ConsumerState::AttachFailed) {
            warn!(queue = %self.queue_name, state = %self.state, "Consumer lost its session");
            self.transition(ConsumerState::Idle);
        }
    }

    /// Apply an attachment notification. Disposal runs here; the returned commands
    /// are for the caller.
    pub fn handle_event(&mut self, session: SessionId, event: &ConsumerEvent) -> Vec<ConsumerCommand> {
        if self.session != Some(session) {
            debug!(%session, queue = %self.queue_name, "Ignoring notification for another attachment");
            return Vec::new();
        }

        let Some(transition) = next_consumer_state(self.state, event) else {
            warn!(queue = %self.queue_name, state = %self.state, ?event, "Ignoring consumer notification");
            return Vec::new();
        };

        match event {
            ConsumerEvent::Up => {
                info!(queue = %self.queue_name, ">>> Consumer attached, receiving messages <<<");
            }
            ConsumerEvent::ConnectFailedError(reason) => {
                error!(
                    queue = %self.queue_name,
                    "Consumer attachment failed: {} - queue missing or permission denied",
                    reason
                );
            }
            ConsumerEvent::Down => {
                warn!(queue = %self.queue_name, "Consumer closed by broker");
            }
            ConsumerEvent::DownError(reason) => {
                error!(queue = %self.queue_name, "Consumer dropped abnormally: {}", reason);
            }
            ConsumerEvent::Message(_) => {}
        }
        self.transition(transition.next);

        let mut forwarded = Vec::with_capacity(transition.commands.len());
        for command in transition.commands {
            match command {
                ConsumerCommand::DisposeAttachment => self.release_handle(),
                other => forwarded.push(other),
            }
        }
        forwarded
    }

    /// Hand one delivery to `handler`, then acknowledge it exactly once.
    ///
    /// The acknowledgment is sent even when the handler fails. Deliveries while not
    /// active are left unacknowledged for the broker to redeliver.
    pub fn deliver(
        &mut self,
        session: SessionId,
        mut message: InboundMessage,
        handler: &mut dyn MessageHandler,
    ) -> DeliveryOutcome {
        if self.state != ConsumerState::Active || self.session != Some(session) {
            warn!(
                queue = %self.queue_name,
                state = %self.state,
                correlation_id = %message.correlation_id(),
                "Dropping delivery received while not active"
            );
            return DeliveryOutcome::Ignored;
        }

        let span = crate::delivery_span!(
            queue = %self.queue_name,
            correlation_id = %message.correlation_id(),
            delivery_id = ?message.metadata().delivery_id
        );
        let _guard = span.enter();

        self.deliveries += 1;
        if let Err(e) = handler.handle(&message) {
            error!(error = %e, "Message handler failed, acknowledging anyway");
        }

        match message.acknowledge() {
            Ok(AckOutcome::Acknowledged) => {
                debug!("Message acknowledged");
                DeliveryOutcome::Acknowledged
            }
            Ok(AckOutcome::AlreadyAcknowledged) => DeliveryOutcome::Acknowledged,
            Err(e) => {
                error!(
                    state = %self.state,
                    operation = "message.acknowledge",
                    error = %e,
                    "Failed to acknowledge message, broker may redeliver"
                );
                DeliveryOutcome::AckFailed
            }
        }
    }

    /// Release the attachment and forget its session, so late notifications
    /// for it are ignored quietly
    fn detach(&mut self) {
        self.release_handle();
        self.session = None;
        self.transition(ConsumerState::Idle);
    }

    fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.dispose();
        }
    }

    fn transition(&mut self, to: ConsumerState) {
        if self.state != to {
            info!(queue = %self.queue_name, "Consumer state: {} -> {}", self.state, to);
            self.state = to;
        }
    }
}
