//! Crate-level error type
//!
//! Component errors ([`ConfigError`], [`BrokerError`]) convert into
//! [`ConsumerError`] so the binary can propagate any of them with `?`.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for queue consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsumerError {
    /// Create invalid state error
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

/// Result type for queue consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;
