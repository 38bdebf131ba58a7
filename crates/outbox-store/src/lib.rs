//! Outbox event storage for the transactional outbox.
//!
//! - [`OutboxEvent`] and the [`OutboxStatus`] state machine
//! - [`Transactional`] and [`OutboxStateStore`], the contract the coordinator
//!   and reconciler rely on
//! - [`InMemoryOutboxStore`] and [`PostgresOutboxStore`] implementations
//! - [`TopicRouter`] for destination lookup

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod routing;
pub mod store;

pub use common::{CorrelationContext, OutboxEventId};
pub use error::{OutboxStoreError, Result};
pub use event::{InvalidTransition, OutboxEvent, OutboxStatus, StatusUpdate};
pub use memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::PostgresOutboxStore;
pub use query::OutboxQuery;
pub use routing::{DEFAULT_TOPIC, TopicRouter};
pub use store::{OutboxStateStore, OutboxStateStoreExt, Transactional};
