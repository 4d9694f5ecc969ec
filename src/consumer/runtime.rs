//! Single-threaded driver for the connection and consumer state machines
//!
//! Broker notifications arrive on one channel and are applied one at a time, so a
//! delivery is handled and acknowledged before the next notification is looked at.
//! The commands returned by the pure transitions are executed here.

use super::connection::{
    ConnectOutcome, ConnectionCommand, ConnectionManager, ConnectionState, DisconnectOutcome,
};
use super::handler::MessageHandler;
use super::queue::{ConsumerCommand, ConsumerState, QueueConsumer, StartOutcome, StopOutcome};
use super::shutdown::{ShutdownCoordinator, ShutdownStep};
use crate::broker::{
    BrokerError, BrokerEvent, BrokerEventKind, BrokerSession, ConnectionParams, ConsumerEvent,
    SessionFactory,
};
use crate::error::{ConsumerError, ConsumerResult};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consumer handle type produced by a session factory
pub type ConsumerOf<F> = <<F as SessionFactory>::Session as BrokerSession>::Consumer;

/// What the caller should do after a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// The shutdown sequence has run; terminate after the grace period
    Exit(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Termination signal
    Signal,
    /// The broker refused the queue attachment
    AttachFailed,
    /// Every notification sender is gone
    EventStreamClosed,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Signal => 0,
            ExitReason::AttachFailed | ExitReason::EventStreamClosed => 1,
        }
    }
}

pub struct ConsumerRuntime<F: SessionFactory, H: MessageHandler> {
    connection: ConnectionManager<F>,
    consumer: QueueConsumer<ConsumerOf<F>>,
    handler: H,
    coordinator: ShutdownCoordinator,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    shutting_down: bool,
}

impl<F: SessionFactory, H: MessageHandler> ConsumerRuntime<F, H> {
    pub fn new(
        factory: F,
        queue_name: impl Into<String>,
        handler: H,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            connection: ConnectionManager::new(factory, tx),
            consumer: QueueConsumer::new(queue_name),
            handler,
            coordinator,
            events,
            shutting_down: false,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<F> {
        &self.connection
    }

    pub fn consumer(&self) -> &QueueConsumer<ConsumerOf<F>> {
        &self.consumer
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer.state()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Begin the lifecycle: request a broker session. The consumer attaches once the
    /// session comes up.
    pub fn start(&mut self, params: &ConnectionParams) -> ConsumerResult<ConnectOutcome> {
        self.ensure_running("start")?;
        Ok(self.connection.connect(params)?)
    }

    pub fn start_consumer(&mut self) -> ConsumerResult<StartOutcome> {
        self.ensure_running("start consumer")?;
        Ok(self.consumer.start(&self.connection)?)
    }

    pub fn stop_consumer(&mut self) -> StopOutcome {
        self.consumer.stop()
    }

    /// Stop the consumer, then request session teardown
    pub fn disconnect(&mut self) -> Result<DisconnectOutcome, BrokerError> {
        self.consumer.stop();
        self.connection.disconnect()
    }

    fn ensure_running(&self, operation: &'static str) -> ConsumerResult<()> {
        if self.shutting_down {
            return Err(ConsumerError::invalid_state(operation, "shutting down"));
        }
        Ok(())
    }

    /// Apply one notification and run the resulting commands
    pub fn handle_event(&mut self, event: BrokerEvent) -> Control {
        let session = event.session;
        match event.kind {
            BrokerEventKind::Session(event) => {
                let commands = self.connection.handle_event(session, &event);
                for command in commands {
                    match command {
                        ConnectionCommand::StartConsumer if self.shutting_down => {
                            info!("Session came up during shutdown, not attaching consumer");
                        }
                        ConnectionCommand::StartConsumer => {
                            // Failures are logged by the consumer and leave it idle.
                            let _ = self.consumer.start(&self.connection);
                        }
                        ConnectionCommand::InvalidateConsumer => self.consumer.session_lost(),
                        ConnectionCommand::ReleaseSession => {}
                    }
                }
                Control::Continue
            }
            BrokerEventKind::Consumer(event) => {
                if !self.connection.is_current(session) {
                    debug!(%session, ?event, "Ignoring consumer notification from released session");
                    return Control::Continue;
                }

                match event {
                    ConsumerEvent::Message(message) => {
                        self.consumer.deliver(session, message, &mut self.handler);
                        Control::Continue
                    }
                    event => {
                        let commands = self.consumer.handle_event(session, &event);
                        if commands.contains(&ConsumerCommand::RequestShutdown) && !self.shutting_down
                        {
                            error!(
                                queue = %self.consumer.queue_name(),
                                "Queue attachment failed, shutting down"
                            );
                            self.shutdown();
                            return Control::Exit(ExitReason::AttachFailed);
                        }
                        Control::Continue
                    }
                }
            }
        }
    }

    /// Apply every notification already queued, stopping at the first exit request
    pub fn process_pending(&mut self) -> Control {
        while let Ok(event) = self.events.try_recv() {
            if let Control::Exit(reason) = self.handle_event(event) {
                return Control::Exit(reason);
            }
        }
        Control::Continue
    }

    /// Run the ordered teardown: stop the consumer, then disconnect the session.
    ///
    /// Returns the full plan, including the grace wait and termination left to the
    /// caller. Only the first call does anything.
    pub fn shutdown(&mut self) -> Vec<ShutdownStep> {
        if self.shutting_down {
            debug!("Shutdown already in progress");
            return Vec::new();
        }
        self.shutting_down = true;

        let plan = self
            .coordinator
            .plan(self.consumer.state(), self.connection.state());
        info!(
            consumer = %self.consumer.state(),
            connection = %self.connection.state(),
            steps = plan.len(),
            "Shutting down"
        );

        for step in &plan {
            match step {
                ShutdownStep::StopConsumer => {
                    self.consumer.stop();
                }
                ShutdownStep::DisconnectSession => {
                    // Already logged; teardown continues regardless.
                    let _ = self.connection.disconnect();
                }
                ShutdownStep::AwaitGrace(_) | ShutdownStep::Terminate => {}
            }
        }
        plan
    }

    /// Drive notifications until a shutdown signal or a fatal attach failure, run
    /// the ordered shutdown, then keep processing notifications for the grace
    /// period so in-flight teardown completes.
    pub async fn run<S>(&mut self, signal: S) -> ExitReason
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(signal);

        let reason = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Received shutdown signal");
                    self.shutdown();
                    break ExitReason::Signal;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Control::Exit(reason) = self.handle_event(event) {
                            break reason;
                        }
                    }
                    None => {
                        warn!("Broker notification channel closed");
                        self.shutdown();
                        break ExitReason::EventStreamClosed;
                    }
                },
            }
        };

        self.drain_during_grace().await;
        info!(?reason, "Consumer terminated");
        reason
    }

    async fn drain_during_grace(&mut self) {
        let grace = self.coordinator.grace_period();
        debug!(grace_ms = grace.as_millis() as u64, "Waiting for teardown to complete");
        let deadline = Instant::now() + grace;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{SessionEvent, SessionId};
    use crate::consumer::LoggingHandler;
    use crate::testing::mocks::{BrokerCall, MockBroker, MockSessionFactory};
    use std::time::Duration;

    fn runtime(broker: &MockBroker) -> ConsumerRuntime<MockSessionFactory, LoggingHandler> {
        ConsumerRuntime::new(
            broker.factory(),
            "Q.TEST",
            LoggingHandler,
            ShutdownCoordinator::new(Duration::from_millis(20)),
        )
    }

    fn params() -> ConnectionParams {
        ConnectionParams::new("tcp://h:55555", "v1", "u", "p")
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::Signal.exit_code(), 0);
        assert_eq!(ExitReason::AttachFailed.exit_code(), 1);
        assert_eq!(ExitReason::EventStreamClosed.exit_code(), 1);
    }

    #[test]
    fn test_session_up_attaches_consumer() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start(&params()).unwrap();

        broker.fire_session(SessionEvent::Up);
        assert_eq!(runtime.process_pending(), Control::Continue);
        assert_eq!(runtime.connection_state(), ConnectionState::Connected);
        assert_eq!(runtime.consumer_state(), ConsumerState::Attaching);
    }

    #[test]
    fn test_start_after_shutdown_is_rejected() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.shutdown();

        let error = runtime.start(&params()).unwrap_err();
        assert_eq!(error.to_string(), "Cannot start while shutting down");
        assert!(broker.calls().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);

        assert_eq!(runtime.shutdown().len(), 2);
        assert!(runtime.shutdown().is_empty());
        assert!(runtime.is_shutting_down());
    }

    #[test]
    fn test_session_up_during_shutdown_does_not_attach() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start(&params()).unwrap();
        runtime.shutdown();

        broker.fire_session(SessionEvent::Up);
        runtime.process_pending();
        assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
        assert_eq!(
            broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_))),
            0
        );
    }

    #[test]
    fn test_consumer_events_from_stale_session_are_ignored() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start(&params()).unwrap();
        broker.fire_session(SessionEvent::Up);
        runtime.process_pending();

        broker.fire_session(SessionEvent::Disconnected("reset".to_string()));
        runtime.process_pending();
        broker.fire_consumer_for(SessionId(1), ConsumerEvent::Up);
        runtime.process_pending();

        assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
        assert!(!runtime.consumer().has_attachment());
    }

    #[tokio::test]
    async fn test_run_exits_on_signal_after_grace() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start(&params()).unwrap();

        let started = Instant::now();
        let reason = runtime.run(async {}).await;
        assert_eq!(reason, ExitReason::Signal);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
