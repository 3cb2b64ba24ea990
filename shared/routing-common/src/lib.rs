//! Shared types and utilities for the notification routing engine
//!
//! This library provides the data model, validation rules, error taxonomy and
//! NATS subject names used by the routing core and its host-side adapters.

pub mod error;
pub mod subjects;
pub mod types;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utilities;

// Re-export commonly used types
pub use error::{RoutingError, RoutingResult};
pub use types::*;
pub use validation::*;
