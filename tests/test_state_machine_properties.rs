//! Property tests driving the runtime with random notification sequences
//!
//! Whatever order the broker reports things in, the consumer is only attached on
//! a connected session and every handled delivery is acknowledged exactly once.


use proptest::prelude::*;
use queue_consumer::broker::{ConsumerEvent, SessionEvent};
use queue_consumer::consumer::{ConnectionState, ConsumerState};
use queue_consumer::testing::{BrokerCall, MockBroker};
use test_helpers::*;

#[derive(Debug, Clone)]
enum Action {
    Connect,
    SessionUp,
    SessionConnectFailed,
    SessionDisconnected,
    ConsumerUp,
    ConsumerAttachFailed,
    ConsumerDown,
    ConsumerDownError,
    Deliver(String),
    StartConsumer,
    StopConsumer,
    Disconnect,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Connect),
        Just(Action::SessionUp),
        Just(Action::SessionConnectFailed),
        Just(Action::SessionDisconnected),
        Just(Action::ConsumerUp),
        Just(Action::ConsumerAttachFailed),
        Just(Action::ConsumerDown),
        Just(Action::ConsumerDownError),
        "[a-z]{1,6}".prop_map(Action::Deliver),
        Just(Action::StartConsumer),
        Just(Action::StopConsumer),
        Just(Action::Disconnect),
    ]
}

fn apply(broker: &MockBroker, runtime: &mut TestRuntime, action: &Action) {
    let has_session = broker.latest_session().is_some();
    match action {
        Action::Connect => {
            let _ = runtime.start(&test_params());
        }
        Action::StartConsumer => {
            let _ = runtime.start_consumer();
        }
        Action::StopConsumer => {
            runtime.stop_consumer();
        }
        Action::Disconnect => {
            let _ = runtime.disconnect();
        }
        _ if !has_session => {}
        Action::SessionUp => broker.fire_session(SessionEvent::Up),
        Action::SessionConnectFailed => {
            broker.fire_session(SessionEvent::ConnectFailed("refused".to_string()))
        }
        Action::SessionDisconnected => {
            broker.fire_session(SessionEvent::Disconnected("reset".to_string()))
        }
        Action::ConsumerUp => broker.fire_consumer(ConsumerEvent::Up),
        Action::ConsumerAttachFailed => {
            broker.fire_consumer(ConsumerEvent::ConnectFailedError("missing".to_string()))
        }
        Action::ConsumerDown => broker.fire_consumer(ConsumerEvent::Down),
        Action::ConsumerDownError => {
            broker.fire_consumer(ConsumerEvent::DownError("abnormal".to_string()))
        }
        Action::Deliver(payload) => broker.deliver(payload.clone()),
    }
    runtime.process_pending();
}

proptest! {
    #[test]
    fn lifecycle_invariants_hold(actions in proptest::collection::vec(action(), 0..48)) {
        let broker = MockBroker::new();
        let mut runtime = test_runtime(&broker, "Q.TEST");

        for action in &actions {
            let attachments_before = broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_)));
            apply(&broker, &mut runtime, action);
            let attachments_after = broker.count(|c| matches!(c, BrokerCall::CreateConsumer(_)));

            // Attachments are only ever created on a connected session.
            if attachments_after > attachments_before {
                prop_assert_eq!(runtime.connection_state(), ConnectionState::Connected);
            }

            if runtime.consumer_state() == ConsumerState::Active {
                prop_assert_eq!(runtime.connection_state(), ConnectionState::Connected);
            }

            // A held attachment always belongs to the live session.
            if runtime.consumer().has_attachment() {
                prop_assert!(runtime.connection().has_session());
                prop_assert_eq!(runtime.consumer().session(), runtime.connection().session_id());
            }

            // Every handled delivery is acknowledged exactly once, in order.
            let handled: Vec<Vec<u8>> = runtime
                .handler()
                .payloads
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
            prop_assert_eq!(broker.acknowledgments(), handled);
        }
    }

    #[test]
    fn shutdown_orders_consumer_before_session(actions in proptest::collection::vec(action(), 0..32)) {
        let broker = MockBroker::new();
        let mut runtime = test_runtime(&broker, "Q.TEST");
        for action in &actions {
            apply(&broker, &mut runtime, action);
        }

        broker.clear_calls();
        runtime.shutdown();

        let calls = broker.calls();
        let consumer_call = calls.iter().position(|c| {
            matches!(c, BrokerCall::ConsumerDisconnect | BrokerCall::ConsumerDispose)
        });
        let session_call = calls.iter().position(|c| *c == BrokerCall::SessionDisconnect);
        if let (Some(consumer_call), Some(session_call)) = (consumer_call, session_call) {
            prop_assert!(consumer_call < session_call);
        }
        prop_assert!(runtime.is_shutting_down());
    }
}
