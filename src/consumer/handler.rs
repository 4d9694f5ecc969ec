//! Pluggable per-delivery processing

use crate::broker::InboundMessage;
use tracing::info;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivery. Runs to completion before the next delivery; the
/// consumer acknowledges afterwards whatever the result.
pub trait MessageHandler {
    fn handle(&mut self, message: &InboundMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&InboundMessage) -> Result<(), HandlerError>,
{
    fn handle(&mut self, message: &InboundMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Default handler: logs payload and metadata
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle(&mut self, message: &InboundMessage) -> Result<(), HandlerError> {
        info!(
            destination = %message.metadata().destination,
            bytes = message.payload().len(),
            "Received message: {}",
            message.payload_lossy()
        );
        info!("Message metadata:\n{}", message.metadata().dump());
        Ok(())
    }
}
