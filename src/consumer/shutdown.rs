//! Ordered termination
//!
//! The consumer is always stopped before the session is disconnected. Acting on an
//! attachment whose session has begun teardown is undefined in the broker contract.

use super::connection::ConnectionState;
use super::queue::ConsumerState;
use std::time::Duration;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopConsumer,
    DisconnectSession,
    /// Let in-flight network teardown finish
    AwaitGrace(Duration),
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownCoordinator {
    grace_period: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Steps to run, in order, for the given states
    pub fn plan(&self, consumer: ConsumerState, connection: ConnectionState) -> Vec<ShutdownStep> {
        let mut steps = Vec::with_capacity(4);
        if matches!(consumer, ConsumerState::Active | ConsumerState::Inactive) {
            steps.push(ShutdownStep::StopConsumer);
        }
        if matches!(
            connection,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            steps.push(ShutdownStep::DisconnectSession);
        }
        steps.push(ShutdownStep::AwaitGrace(self.grace_period));
        steps.push(ShutdownStep::Terminate);
        steps
    }
}
