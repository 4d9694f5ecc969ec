//! Observability for the queue consumer
//!
//! Structured logging through `tracing`; every reported failure carries the state
//! at the time of the error and the operation attempted.

pub mod logging;

// Re-export for convenience
pub use logging::{
    init_default_logging, init_logging, init_logging_with_override, level_for_verbosity,
    parse_level, LogFormat,
};

// Span macros for structured logging
pub use logging::{broker_span, delivery_span, lifecycle_span};
