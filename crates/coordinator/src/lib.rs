//! Transactional outbox.
//!
//! Business code raises [`DomainEvent`]s inside a [`UnitOfWork`]. Before the
//! host transaction commits, the [`TransactionalOutboxCoordinator`] writes
//! each event to the outbox on the same transaction; after the commit it
//! publishes the event through a [`broker::RetryingPublisher`] and records
//! PROCESSED or FAILED. Independently, the [`StatusReconciler`] applies
//! delivery confirmations read back from the broker.
//!
//! Delivery is at-least-once and consumers must deduplicate. An event whose
//! dispatch never ran (for example, the process stopped right after commit)
//! stays PENDING; it can be found with
//! [`outbox_store::OutboxQuery::stuck_pending`] and handed to
//! [`TransactionalOutboxCoordinator::dispatch`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod reconciler;
pub mod telemetry;
pub mod unit_of_work;

pub use config::{LogFormat, OutboxConfig, RetryBackoff};
pub use coordinator::{DispatchOutcome, DispatchReport, DomainEvent, TransactionalOutboxCoordinator};
pub use error::{OutboxError, ReconciliationError, Result};
pub use reconciler::{
    DEFAULT_CONFIRMATION_SUFFIX, ReconcileOutcome, ReconcileStats, StatusReconciler,
};
pub use unit_of_work::{AfterCommit, BeforeCommit, UnitOfWork};
