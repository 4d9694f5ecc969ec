//! Queue Consumer - durable-queue consumer for message brokers
//!
//! Keeps one broker session, attaches to a single named durable queue, hands each
//! delivery to a pluggable handler and acknowledges it afterwards so the broker
//! removes it from the queue.
//!
//! # Overview
//!
//! - [`broker`] - the broker-client contract plus an MQTT binding over `rumqttc`
//! - [`consumer`] - connection and consumer state machines, ordered shutdown and
//!   the single-threaded runtime driving them
//! - [`config`] - TOML/JSON configuration with up-front validation
//! - [`observability`] - structured logging
//! - [`testing`] - a recording mock broker
//!
//! # Quick Start
//!
//! ```rust
//! use queue_consumer::broker::{ConnectionParams, SessionEvent};
//! use queue_consumer::consumer::{
//!     ConnectionState, ConsumerRuntime, ConsumerState, LoggingHandler, ShutdownCoordinator,
//! };
//! use queue_consumer::broker::ConsumerEvent;
//! use queue_consumer::testing::MockBroker;
//!
//! let broker = MockBroker::new();
//! let mut runtime = ConsumerRuntime::new(
//!     broker.factory(),
//!     "Q.TEST",
//!     LoggingHandler,
//!     ShutdownCoordinator::default(),
//! );
//!
//! runtime.start(&ConnectionParams::new("tcp://h:55555", "v1", "u", "p")).unwrap();
//! broker.fire_session(SessionEvent::Up);
//! broker.fire_consumer(ConsumerEvent::Up);
//! runtime.process_pending();
//!
//! assert_eq!(runtime.connection_state(), ConnectionState::Connected);
//! assert_eq!(runtime.consumer_state(), ConsumerState::Active);
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod observability;
pub mod testing;

pub use broker::{ConnectionParams, InboundMessage};
pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{
    ConnectionManager, ConsumerRuntime, MessageHandler, QueueConsumer, ShutdownCoordinator,
};
pub use error::{ConsumerError, ConsumerResult};
