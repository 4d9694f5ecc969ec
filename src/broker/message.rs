//! Inbound deliveries and their one-shot acknowledgment

use super::BrokerError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Broker-side confirmation of a single delivery
pub trait Acknowledger: Send {
    fn acknowledge(&mut self) -> Result<(), BrokerError>;
}

/// Result of calling [`InboundMessage::acknowledge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// A previous call already acknowledged this delivery; nothing was sent
    AlreadyAcknowledged,
}

/// Broker-assigned fields of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Queue or topic the delivery came from
    pub destination: String,
    /// Broker delivery identifier, when the protocol has one
    pub delivery_id: Option<u64>,
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
    /// Any further protocol-specific fields
    pub properties: BTreeMap<String, String>,
}

impl MessageMetadata {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            delivery_id: None,
            redelivered: false,
            received_at: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    /// Multi-line human-readable dump of all fields
    pub fn dump(&self) -> String {
        let mut out = format!("Destination: {}\n", self.destination);
        if let Some(id) = self.delivery_id {
            out.push_str(&format!("Delivery Id: {id}\n"));
        }
        out.push_str(&format!("Redelivered: {}\n", self.redelivered));
        out.push_str(&format!("Received At: {}\n", self.received_at.to_rfc3339()));
        for (key, value) in &self.properties {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out
    }
}

/// One delivery. Immutable apart from its acknowledgment capability.
pub struct InboundMessage {
    correlation_id: Uuid,
    payload: Bytes,
    metadata: MessageMetadata,
    acknowledger: Box<dyn Acknowledger>,
    acknowledged: bool,
}

impl InboundMessage {
    pub fn new(
        payload: impl Into<Bytes>,
        metadata: MessageMetadata,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            payload: payload.into(),
            metadata,
            acknowledger,
            acknowledged: false,
        }
    }

    /// Locally generated id used to correlate log lines of one delivery
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Confirm the delivery so the broker removes it from the queue.
    ///
    /// Only the first successful call reaches the broker. A failed call leaves the
    /// message unacknowledged.
    pub fn acknowledge(&mut self) -> Result<AckOutcome, BrokerError> {
        if self.acknowledged {
            return Ok(AckOutcome::AlreadyAcknowledged);
        }
        self.acknowledger.acknowledge()?;
        self.acknowledged = true;
        Ok(AckOutcome::Acknowledged)
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("correlation_id", &self.correlation_id)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("acknowledged", &self.acknowledged)
            .finish()
    }
}
