//! Broker-client contract
//!
//! The lifecycle core never talks to a wire protocol directly. It drives the
//! traits in this module, and receives every asynchronous notification through an
//! [`EventSink`] handed to the session at creation time. The [`mqtt`] module binds
//! the contract to a real broker; [`crate::testing::mocks`] binds it to a
//! recording test double.

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

pub mod message;
pub mod mqtt;

pub use message::{AckOutcome, Acknowledger, InboundMessage, MessageMetadata};

/// Parameters needed to open one broker session
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Endpoint URL, e.g. `tcp://broker:1883`
    pub url: String,
    /// Virtual host / message-VPN the session belongs to
    pub vpn: String,
    pub username: String,
    pub password: String,
}

impl ConnectionParams {
    pub fn new(
        url: impl Into<String>,
        vpn: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            vpn: vpn.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("url", &self.url)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Acknowledgment mode requested for a consumer attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The client confirms each delivery explicitly
    Client,
    /// The broker removes messages on delivery
    Auto,
}

/// Properties of a consumer attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerProperties {
    pub queue_name: String,
    pub ack_mode: AckMode,
    /// Provision the queue server-side instead of failing the attach
    pub create_if_missing: bool,
}

impl ConsumerProperties {
    /// Durable-queue attachment with client acknowledgment and on-demand provisioning
    pub fn durable_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ack_mode: AckMode::Client,
            create_if_missing: true,
        }
    }
}

/// Identifies one session instance; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker confirmed the session is live
    Up,
    /// The broker rejected or could not establish the session
    ConnectFailed(String),
    /// A previously live (or connecting) session dropped
    Disconnected(String),
}

/// Consumer-level notifications
#[derive(Debug)]
pub enum ConsumerEvent {
    /// Attachment confirmed; deliveries will follow
    Up,
    /// Attachment refused (queue missing, permission denied)
    ConnectFailedError(String),
    /// Broker closed the attachment cleanly
    Down,
    /// Attachment closed abnormally
    DownError(String),
    /// One delivery
    Message(InboundMessage),
}

#[derive(Debug)]
pub enum BrokerEventKind {
    Session(SessionEvent),
    Consumer(ConsumerEvent),
}

/// A notification tagged with the session that produced it
#[derive(Debug)]
pub struct BrokerEvent {
    pub session: SessionId,
    pub kind: BrokerEventKind,
}

/// Where a session and its consumer publish their notifications
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn session_event(&self, event: SessionEvent) {
        self.emit(BrokerEventKind::Session(event));
    }

    pub fn consumer_event(&self, event: ConsumerEvent) {
        self.emit(BrokerEventKind::Consumer(event));
    }

    fn emit(&self, kind: BrokerEventKind) {
        let event = BrokerEvent {
            session: self.session,
            kind,
        };
        // The receiver only goes away once the runtime has finished.
        if let Err(e) = self.tx.send(event) {
            trace!(session = %self.session, "Dropping broker event after runtime exit: {:?}", e.0.kind);
        }
    }
}

/// Synchronous broker-client failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),
    #[error("{operation} failed: {source}")]
    CallFailed {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

impl BrokerError {
    pub fn call_failed<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::CallFailed {
            operation,
            source: source.into(),
        }
    }

    pub fn rejected<S: Into<String>>(operation: &'static str, reason: S) -> Self {
        Self::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}

/// Creates sessions; the `Session.create` entry point of the broker client
pub trait SessionFactory {
    type Session: BrokerSession;

    /// Build a session for `params`. Notifications for it go to `events`.
    fn create_session(
        &mut self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<Self::Session, BrokerError>;
}

/// One logical broker connection. Every call is fire-and-forget; the outcome is
/// observed later through [`SessionEvent`]s.
pub trait BrokerSession {
    type Consumer: ConsumerHandle;

    fn connect(&mut self) -> Result<(), BrokerError>;

    fn disconnect(&mut self) -> Result<(), BrokerError>;

    /// Release the underlying transport. Must be safe to call on a dead session.
    fn dispose(&mut self);

    fn create_consumer(&self, properties: &ConsumerProperties)
        -> Result<Self::Consumer, BrokerError>;
}

/// The broker-side handle of a consumer attachment
pub trait ConsumerHandle {
    fn connect(&mut self) -> Result<(), BrokerError>;

    fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn dispose(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_params_debug_redacts_password() {
        let params = ConnectionParams::new("tcp://h:55555", "v1", "u", "hunter2");
        let debug = format!("{params:?}");
        assert!(debug.contains("tcp://h:55555"));
        assert!(debug.contains("v1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_durable_queue_properties() {
        let props = ConsumerProperties::durable_queue("Q.TEST");
        assert_eq!(props.queue_name, "Q.TEST");
        assert_eq!(props.ack_mode, AckMode::Client);
        assert!(props.create_if_missing);
    }

    #[test]
    fn test_event_sink_tags_events_with_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionId(7), tx);

        sink.session_event(SessionEvent::Up);
        sink.consumer_event(ConsumerEvent::Down);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.session, SessionId(7));
        assert!(matches!(
            first.kind,
            BrokerEventKind::Session(SessionEvent::Up)
        ));

        let second = rx.try_recv().unwrap();
        assert!(matches!(
            second.kind,
            BrokerEventKind::Consumer(ConsumerEvent::Down)
        ));
    }

    #[test]
    fn test_event_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(SessionId(1), tx);
        sink.session_event(SessionEvent::Disconnected("gone".to_string()));
    }

    #[test]
    fn test_broker_error_display() {
        let errors = vec![
            BrokerError::InvalidParams("bad url".to_string()),
            BrokerError::call_failed("session.connect", "socket closed"),
            BrokerError::rejected("consumer.connect", "request queue full"),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
        assert_eq!(
            BrokerError::call_failed("session.connect", "socket closed").to_string(),
            "session.connect failed: socket closed"
        );
    }
}
