//! Testing utilities and mock implementations
//!
//! Lets the lifecycle be exercised without a running broker.

pub mod mocks;

pub use mocks::*;
