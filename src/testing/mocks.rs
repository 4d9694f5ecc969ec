//! Mock implementations for testing
//!
//! [`MockBroker`] is a recording broker client: every session, consumer and
//! acknowledgment call it receives is appended to one shared [`BrokerCall`] log so
//! tests can assert on call order. Notifications are fired explicitly by the test.

use crate::broker::{
    Acknowledger, BrokerError, BrokerSession, ConnectionParams, ConsumerEvent, ConsumerHandle,
    ConsumerProperties, EventSink, InboundMessage, MessageMetadata, SessionEvent, SessionFactory,
    SessionId,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};

/// One call made against the mock broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    CreateSession {
        url: String,
        vpn: String,
        username: String,
    },
    SessionConnect,
    SessionDisconnect,
    SessionDispose,
    CreateConsumer(ConsumerProperties),
    ConsumerConnect,
    ConsumerDisconnect,
    ConsumerDispose,
    /// Payload of the acknowledged delivery
    Acknowledge(Vec<u8>),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<BrokerCall>,
    sinks: Vec<EventSink>,
    fail_session_create: bool,
    fail_session_connect: bool,
    fail_session_disconnect: bool,
    fail_consumer_connect: bool,
    fail_consumer_disconnect: bool,
    fail_acknowledge: bool,
    next_delivery_id: u64,
}

/// Shared handle to the mock broker's state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: BrokerCall) {
        self.lock().calls.push(call);
    }

    /// Session factory whose sessions record into this broker
    pub fn factory(&self) -> MockSessionFactory {
        MockSessionFactory {
            broker: self.clone(),
        }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&BrokerCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| matches(*c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Payloads acknowledged so far, in order
    pub fn acknowledgments(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::Acknowledge(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_session_create(&self, fail: bool) {
        self.lock().fail_session_create = fail;
    }

    pub fn fail_session_connect(&self, fail: bool) {
        self.lock().fail_session_connect = fail;
    }

    pub fn fail_session_disconnect(&self, fail: bool) {
        self.lock().fail_session_disconnect = fail;
    }

    pub fn fail_consumer_connect(&self, fail: bool) {
        self.lock().fail_consumer_connect = fail;
    }

    pub fn fail_consumer_disconnect(&self, fail: bool) {
        self.lock().fail_consumer_disconnect = fail;
    }

    pub fn fail_acknowledge(&self, fail: bool) {
        self.lock().fail_acknowledge = fail;
    }

    /// Id of the most recently created session
    pub fn latest_session(&self) -> Option<SessionId> {
        self.lock().sinks.last().map(EventSink::session_id)
    }

    fn sink_for(&self, session: Option<SessionId>) -> Option<EventSink> {
        let state = self.lock();
        match session {
            Some(id) => state.sinks.iter().find(|s| s.session_id() == id).cloned(),
            None => state.sinks.last().cloned(),
        }
    }

    /// Fire a session notification on the most recent session.
    ///
    /// # Panics
    ///
    /// Panics if no session has been created yet.
    pub fn fire_session(&self, event: SessionEvent) {
        self.sink_for(None)
            .expect("no session has been created")
            .session_event(event);
    }

    /// Fire a consumer notification on the most recent session
    ///
    /// # Panics
    ///
    /// Panics if no session has been created yet.
    pub fn fire_consumer(&self, event: ConsumerEvent) {
        self.sink_for(None)
            .expect("no session has been created")
            .consumer_event(event);
    }

    /// Fire a consumer notification on a specific, possibly released, session
    ///
    /// # Panics
    ///
    /// Panics if `session` was never created.
    pub fn fire_consumer_for(&self, session: SessionId, event: ConsumerEvent) {
        self.sink_for(Some(session))
            .expect("unknown session")
            .consumer_event(event);
    }

    /// Build a delivery whose acknowledgment records into this broker
    pub fn message(&self, payload: impl Into<Bytes>) -> InboundMessage {
        let delivery_id = {
            let mut state = self.lock();
            state.next_delivery_id += 1;
            state.next_delivery_id
        };
        let payload = payload.into();
        let mut metadata = MessageMetadata::new("Q.TEST");
        metadata.delivery_id = Some(delivery_id);

        InboundMessage::new(
            payload.clone(),
            metadata,
            Box::new(MockAcknowledger {
                broker: self.clone(),
                payload,
            }),
        )
    }

    /// Deliver a message on the most recent session
    pub fn deliver(&self, payload: impl Into<Bytes>) {
        let message = self.message(payload);
        self.fire_consumer(ConsumerEvent::Message(message));
    }
}

#[derive(Debug, Clone)]
pub struct MockSessionFactory {
    broker: MockBroker,
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    fn create_session(
        &mut self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<MockSession, BrokerError> {
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::CreateSession {
            url: params.url.clone(),
            vpn: params.vpn.clone(),
            username: params.username.clone(),
        });
        if state.fail_session_create {
            return Err(BrokerError::InvalidParams("mock session creation failure".to_string()));
        }
        state.sinks.push(events);

        Ok(MockSession {
            broker: self.broker.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockSession {
    broker: MockBroker,
}

impl BrokerSession for MockSession {
    type Consumer = MockConsumer;

    fn connect(&mut self) -> Result<(), BrokerError> {
        self.broker.record(BrokerCall::SessionConnect);
        if self.broker.lock().fail_session_connect {
            return Err(BrokerError::call_failed("session.connect", "mock connect failure"));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.broker.record(BrokerCall::SessionDisconnect);
        if self.broker.lock().fail_session_disconnect {
            return Err(BrokerError::call_failed(
                "session.disconnect",
                "mock disconnect failure",
            ));
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.broker.record(BrokerCall::SessionDispose);
    }

    fn create_consumer(
        &self,
        properties: &ConsumerProperties,
    ) -> Result<MockConsumer, BrokerError> {
        self.broker
            .record(BrokerCall::CreateConsumer(properties.clone()));
        Ok(MockConsumer {
            broker: self.broker.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockConsumer {
    broker: MockBroker,
}

impl ConsumerHandle for MockConsumer {
    fn connect(&mut self) -> Result<(), BrokerError> {
        self.broker.record(BrokerCall::ConsumerConnect);
        if self.broker.lock().fail_consumer_connect {
            return Err(BrokerError::call_failed("consumer.connect", "mock attach failure"));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.broker.record(BrokerCall::ConsumerDisconnect);
        if self.broker.lock().fail_consumer_disconnect {
            return Err(BrokerError::call_failed(
                "consumer.disconnect",
                "mock detach failure",
            ));
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.broker.record(BrokerCall::ConsumerDispose);
    }
}

#[derive(Debug)]
pub struct MockAcknowledger {
    broker: MockBroker,
    payload: Bytes,
}

impl Acknowledger for MockAcknowledger {
    fn acknowledge(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if state.fail_acknowledge {
            return Err(BrokerError::call_failed(
                "message.acknowledge",
                "mock acknowledge failure",
            ));
        }
        state.calls.push(BrokerCall::Acknowledge(self.payload.to_vec()));
        Ok(())
    }
}
