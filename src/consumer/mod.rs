//! Connection and consumer lifecycle
//!
//! Two state machines driven by broker notifications:
//!
//! - [`connection`] - [`ConnectionManager`] owns the broker session
//! - [`queue`] - [`QueueConsumer`] owns the attachment to one durable queue
//!
//! Each state machine has a pure transition function returning the next state and
//! the side effects to run, so transition logic is testable without a broker.
//! [`runtime`] feeds notifications to both one at a time and executes the side
//! effects; [`shutdown`] sequences termination.

pub mod connection;
pub mod handler;
pub mod queue;
pub mod runtime;
pub mod shutdown;

pub use connection::{
    next_connection_state, ConnectOutcome, ConnectionCommand, ConnectionManager,
    ConnectionState, DisconnectOutcome,
};
pub use handler::{HandlerError, LoggingHandler, MessageHandler};
pub use queue::{
    next_consumer_state, ConsumerCommand, ConsumerState, DeliveryOutcome, QueueConsumer,
    StartOutcome, StopOutcome,
};
pub use runtime::{ConsumerOf, ConsumerRuntime, Control, ExitReason};
pub use shutdown::{ShutdownCoordinator, ShutdownStep, DEFAULT_GRACE_PERIOD};

/// Result of a pure transition: the state to move to and the effects to run, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S, C> {
    pub next: S,
    pub commands: Vec<C>,
}

impl<S, C> Transition<S, C> {
    pub fn to(next: S) -> Self {
        Self {
            next,
            commands: Vec::new(),
        }
    }

    pub fn with(next: S, commands: Vec<C>) -> Self {
        Self { next, commands }
    }
}
