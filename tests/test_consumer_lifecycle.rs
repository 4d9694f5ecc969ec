//! Lifecycle tests against the recording mock broker
//!
//! Cover the end-to-end scenarios: connect and attach, attach failure, delivery and
//! acknowledgment, broker-side drop and restart, and disconnect while idle, plus
//! the ordering guarantees of shutdown.


use queue_consumer::broker::{ConsumerEvent, ConsumerProperties, SessionEvent, SessionId};
use queue_consumer::consumer::{
    ConnectOutcome, ConnectionState, ConsumerState, Control, DisconnectOutcome, ExitReason,
    ShutdownStep, StartOutcome,
};
use queue_consumer::testing::{BrokerCall, MockBroker};
use std::time::Duration;
use test_helpers::*;

#[test]
fn test_connect_then_attach_on_session_up() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");

    let outcome = runtime.start(&test_params()).unwrap();
    assert_eq!(outcome, ConnectOutcome::Requested(SessionId(1)));
    assert_eq!(runtime.connection_state(), ConnectionState::Connecting);
    assert_eq!(
        broker.calls()[0],
        BrokerCall::CreateSession {
            url: "tcp://h:55555".to_string(),
            vpn: "v1".to_string(),
            username: "u".to_string(),
        }
    );

    broker.fire_session(SessionEvent::Up);
    assert_eq!(runtime.process_pending(), Control::Continue);
    assert_eq!(runtime.connection_state(), ConnectionState::Connected);
    assert_eq!(runtime.consumer_state(), ConsumerState::Attaching);
    assert!(broker
        .calls()
        .contains(&BrokerCall::CreateConsumer(ConsumerProperties::durable_queue("Q.TEST"))));

    broker.fire_consumer(ConsumerEvent::Up);
    runtime.process_pending();
    assert_eq!(runtime.consumer_state(), ConsumerState::Active);
}

#[test]
fn test_attach_failure_runs_full_shutdown() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.MISSING");
    runtime.start(&test_params()).unwrap();
    broker.fire_session(SessionEvent::Up);
    runtime.process_pending();

    broker.fire_consumer(ConsumerEvent::ConnectFailedError(
        "queue Q.MISSING not found".to_string(),
    ));
    let control = runtime.process_pending();

    assert_eq!(control, Control::Exit(ExitReason::AttachFailed));
    assert_eq!(ExitReason::AttachFailed.exit_code(), 1);
    assert_eq!(runtime.consumer_state(), ConsumerState::AttachFailed);
    assert!(runtime.is_shutting_down());
    assert!(position(&broker, &BrokerCall::ConsumerDispose)
        < position(&broker, &BrokerCall::SessionDisconnect));
}

#[tokio::test]
async fn test_attach_failure_terminates_run_after_grace() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.MISSING");
    runtime.start(&test_params()).unwrap();

    broker.fire_session(SessionEvent::Up);
    broker.fire_consumer(ConsumerEvent::ConnectFailedError("no such queue".to_string()));
    broker.fire_session(SessionEvent::Disconnected(
        "client disconnect completed".to_string(),
    ));

    let reason = runtime.run(std::future::pending::<()>()).await;

    assert_eq!(reason, ExitReason::AttachFailed);
    // The disconnect completion was processed during the grace period.
    assert_eq!(runtime.connection_state(), ConnectionState::Disconnected);
    assert!(!runtime.connection().has_session());
    assert!(position(&broker, &BrokerCall::SessionDisconnect)
        < position(&broker, &BrokerCall::SessionDispose));
}

#[test]
fn test_delivery_is_handled_then_acknowledged_once() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    broker.deliver("hello");
    runtime.process_pending();

    assert_eq!(runtime.handler().payloads, vec!["hello".to_string()]);
    assert_eq!(broker.acknowledgments(), vec![b"hello".to_vec()]);
    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::Acknowledge(_))),
        1
    );
}

#[test]
fn test_broker_drop_leaves_process_running_and_allows_restart() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    broker.fire_consumer(ConsumerEvent::Down);
    assert_eq!(runtime.process_pending(), Control::Continue);
    assert_eq!(runtime.consumer_state(), ConsumerState::Inactive);
    assert!(!runtime.is_shutting_down());

    assert_eq!(runtime.start_consumer().unwrap(), StartOutcome::Requested);
    assert_eq!(runtime.consumer_state(), ConsumerState::Attaching);
    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_))),
        2
    );
}

#[test]
fn test_abnormal_drop_is_inactive() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    broker.fire_consumer(ConsumerEvent::DownError("transport reset".to_string()));
    assert_eq!(runtime.process_pending(), Control::Continue);
    assert_eq!(runtime.consumer_state(), ConsumerState::Inactive);
}

#[test]
fn test_disconnect_while_idle_reports_not_connected() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");

    assert_eq!(
        runtime.disconnect().unwrap(),
        DisconnectOutcome::NotConnected
    );
    assert_eq!(runtime.connection_state(), ConnectionState::Idle);
    assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
    assert!(broker.calls().is_empty());
}

#[test]
fn test_attachment_requires_connected_session() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");

    assert_eq!(runtime.start_consumer().unwrap(), StartOutcome::NotConnected);
    runtime.start(&test_params()).unwrap();
    assert_eq!(runtime.start_consumer().unwrap(), StartOutcome::NotConnected);

    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_))),
        0
    );
    assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
}

#[test]
fn test_at_most_one_attachment_per_session() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    assert_eq!(runtime.start_consumer().unwrap(), StartOutcome::AlreadyActive);
    // A duplicate session UP is not a transition and attaches nothing.
    broker.fire_session(SessionEvent::Up);
    runtime.process_pending();

    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_))),
        1
    );
    assert_eq!(runtime.consumer_state(), ConsumerState::Active);
}

#[test]
fn test_every_delivery_acknowledged_once_in_order_despite_handler_errors() {
    let broker = MockBroker::new();
    let mut runtime = runtime_with_handler(&broker, "Q.TEST", RecordingHandler::failing());
    activate(&broker, &mut runtime);

    for payload in ["first", "second", "third"] {
        broker.deliver(payload);
    }
    runtime.process_pending();

    assert_eq!(
        runtime.handler().payloads,
        vec!["first".to_string(), "second".to_string(), "third".to_string()]
    );
    assert_eq!(
        broker.acknowledgments(),
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
}

#[test]
fn test_acknowledge_failure_does_not_change_state() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);
    broker.fail_acknowledge(true);

    broker.deliver("hello");
    assert_eq!(runtime.process_pending(), Control::Continue);
    assert_eq!(runtime.consumer_state(), ConsumerState::Active);
    assert_eq!(runtime.handler().payloads.len(), 1);
}

#[test]
fn test_delivery_before_attach_is_left_unacknowledged() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    runtime.start(&test_params()).unwrap();
    broker.fire_session(SessionEvent::Up);
    broker.deliver("early");
    runtime.process_pending();

    assert!(runtime.handler().payloads.is_empty());
    assert!(broker.acknowledgments().is_empty());
}

#[test]
fn test_session_loss_releases_session_and_accepts_reconnect() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    broker.clear_calls();
    broker.fire_session(SessionEvent::Disconnected("network unreachable".to_string()));
    runtime.process_pending();

    assert_eq!(runtime.connection_state(), ConnectionState::Disconnected);
    assert_eq!(runtime.connection().session_id(), None);
    assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
    // The dead attachment is dropped without further calls on it.
    assert_eq!(broker.calls(), vec![BrokerCall::SessionDispose]);

    assert_eq!(
        runtime.start(&test_params()).unwrap(),
        ConnectOutcome::Requested(SessionId(2))
    );
}

#[test]
fn test_connect_failure_is_not_retried() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    runtime.start(&test_params()).unwrap();

    broker.fire_session(SessionEvent::ConnectFailed("bad credentials".to_string()));
    assert_eq!(runtime.process_pending(), Control::Continue);

    assert_eq!(runtime.connection_state(), ConnectionState::ConnectFailed);
    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::CreateSession { .. })),
        1
    );
    assert!(!runtime.is_shutting_down());
}

#[test]
fn test_synchronous_create_failure_is_recoverable() {
    let broker = MockBroker::new();
    broker.fail_session_create(true);
    let mut runtime = test_runtime(&broker, "Q.TEST");

    assert!(runtime.start(&test_params()).is_err());
    assert_eq!(runtime.connection_state(), ConnectionState::Idle);

    broker.fail_session_create(false);
    assert!(runtime.start(&test_params()).is_ok());
}

#[test]
fn test_shutdown_stops_consumer_before_disconnecting_session() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    let plan = runtime.shutdown();
    assert_eq!(
        plan,
        vec![
            ShutdownStep::StopConsumer,
            ShutdownStep::DisconnectSession,
            ShutdownStep::AwaitGrace(Duration::from_millis(10)),
            ShutdownStep::Terminate,
        ]
    );

    let disconnect_consumer = position(&broker, &BrokerCall::ConsumerDisconnect);
    let dispose_consumer = position(&broker, &BrokerCall::ConsumerDispose);
    let disconnect_session = position(&broker, &BrokerCall::SessionDisconnect);
    assert!(disconnect_consumer < dispose_consumer);
    assert!(dispose_consumer < disconnect_session);
    assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
}

#[test]
fn test_explicit_disconnect_stops_consumer_first() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    assert_eq!(runtime.disconnect().unwrap(), DisconnectOutcome::Requested);
    assert!(position(&broker, &BrokerCall::ConsumerDispose)
        < position(&broker, &BrokerCall::SessionDisconnect));
}

#[tokio::test]
async fn test_signal_runs_ordered_shutdown_and_exits_cleanly() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    activate(&broker, &mut runtime);

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let signal = async {
        let _ = signal_rx.await;
    };
    signal_tx.send(()).unwrap();

    let reason = runtime.run(signal).await;

    assert_eq!(reason, ExitReason::Signal);
    assert_eq!(reason.exit_code(), 0);
    assert!(position(&broker, &BrokerCall::ConsumerDisconnect)
        < position(&broker, &BrokerCall::SessionDisconnect));
}

#[tokio::test]
async fn test_run_processes_deliveries_until_signal() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    runtime.start(&test_params()).unwrap();

    broker.fire_session(SessionEvent::Up);
    broker.fire_consumer(ConsumerEvent::Up);
    broker.deliver("one");
    broker.deliver("two");

    let signal = tokio::time::sleep(Duration::from_millis(50));
    let reason = runtime.run(signal).await;

    assert_eq!(reason, ExitReason::Signal);
    assert_eq!(
        runtime.handler().payloads,
        vec!["one".to_string(), "two".to_string()]
    );
    assert_eq!(broker.acknowledgments().len(), 2);
}

#[test]
fn test_session_up_during_shutdown_does_not_attach() {
    let broker = MockBroker::new();
    let mut runtime = test_runtime(&broker, "Q.TEST");
    runtime.start(&test_params()).unwrap();
    runtime.shutdown();

    broker.fire_session(SessionEvent::Up);
    runtime.process_pending();

    assert_eq!(runtime.consumer_state(), ConsumerState::Idle);
    assert_eq!(
        broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_))),
        0
    );
}
