//! MQTT binding of the broker-client contract
//!
//! A durable queue is modelled as a QoS 1 subscription inside a persistent
//! (non-clean) MQTT session with manual acknowledgments: deliveries stay on the
//! broker until the consumer sends the PUBACK.
//!
//! # Architecture
//!
//! - [`options`] - pure session option building from connection parameters
//! - [`routing`] - pure mapping of event-loop events onto notifications
//! - [`session`] - impure client handles and the event-loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use queue_consumer::broker::mqtt::MqttSessionFactory;
//! use queue_consumer::broker::{BrokerSession, ConnectionParams, EventSink, SessionFactory, SessionId};
//! use tokio::sync::mpsc;
//!
//! # tokio_test::block_on(async {
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let mut factory = MqttSessionFactory::default();
//! let params = ConnectionParams::new("tcp://localhost:1883", "default", "consumer", "secret");
//!
//! let mut session = factory.create_session(&params, EventSink::new(SessionId(1), tx))?;
//! session.connect()?;
//! let first_event = rx.recv().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod options;
pub mod routing;
pub mod session;

pub use options::{configure_mqtt_options, parse_endpoint, BrokerEndpoint, MqttSessionSettings};
pub use routing::EventRoute;
pub use session::{MqttConsumer, MqttSession, MqttSessionFactory};
