//! Shared types for the transactional outbox crates.

pub mod correlation;
pub mod types;

pub use correlation::{CorrelationContext, TRACEPARENT_HEADER};
pub use types::OutboxEventId;
