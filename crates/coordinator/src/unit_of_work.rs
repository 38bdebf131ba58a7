//! Host transaction with before- and after-commit hooks.
//!
//! Work registered with [`UnitOfWork::register_before_commit`] runs inside
//! the transaction and can veto the commit. Work registered with
//! [`UnitOfWork::register_after_commit`] runs only once the commit has
//! succeeded.

use async_trait::async_trait;
use outbox_store::Transactional;

use crate::error::{OutboxError, Result};

/// Work that runs inside the transaction just before it commits.
///
/// Returning an error rolls the transaction back.
#[async_trait]
pub trait BeforeCommit<Tx: Send>: Send + Sync {
    async fn before_commit(&self, tx: &mut Tx) -> Result<()>;
}

/// Work that runs after the transaction has committed.
///
/// Runs on the committing task and must not block; long-running work
/// should be handed off to a spawned task.
pub trait AfterCommit: Send {
    fn after_commit(self: Box<Self>);
}

impl<F> AfterCommit for F
where
    F: FnOnce() + Send,
{
    fn after_commit(self: Box<Self>) {
        (*self)()
    }
}

/// A transaction on `S` plus the hooks to run around its commit.
///
/// Dropping a unit of work without committing discards the transaction
/// and every registered hook.
pub struct UnitOfWork<S: Transactional> {
    store: S,
    tx: S::Tx,
    before_commit: Vec<Box<dyn BeforeCommit<S::Tx>>>,
    after_commit: Vec<Box<dyn AfterCommit>>,
}

impl<S: Transactional> UnitOfWork<S> {
    /// Opens a transaction on `store`.
    pub async fn begin(store: S) -> Result<Self> {
        let tx = store.begin().await.map_err(OutboxError::Transaction)?;
        Ok(Self {
            store,
            tx,
            before_commit: Vec::new(),
            after_commit: Vec::new(),
        })
    }

    /// The transaction handle, for the host's own writes.
    pub fn transaction(&mut self) -> &mut S::Tx {
        &mut self.tx
    }

    pub fn register_before_commit(&mut self, hook: impl BeforeCommit<S::Tx> + 'static) {
        self.before_commit.push(Box::new(hook));
    }

    pub fn register_after_commit(&mut self, hook: impl AfterCommit + 'static) {
        self.after_commit.push(Box::new(hook));
    }

    /// Number of hooks registered so far, as (before, after).
    pub fn hook_count(&self) -> (usize, usize) {
        (self.before_commit.len(), self.after_commit.len())
    }

    /// Runs before-commit hooks in registration order, commits, then runs
    /// after-commit hooks.
    ///
    /// The first failing before-commit hook rolls the transaction back and
    /// its error is returned. A failed commit returns
    /// [`OutboxError::Transaction`]. In both cases no after-commit hook runs.
    pub async fn commit(self) -> Result<()> {
        let UnitOfWork {
            store,
            mut tx,
            before_commit,
            after_commit,
        } = self;

        for hook in &before_commit {
            if let Err(e) = hook.before_commit(&mut tx).await {
                tracing::warn!(error = %e, "before-commit hook failed, rolling back");
                if let Err(rollback_err) = store.rollback(tx).await {
                    tracing::error!(error = %rollback_err, "rollback after hook failure also failed");
                }
                return Err(e);
            }
        }

        store.commit(tx).await.map_err(OutboxError::Transaction)?;

        for hook in after_commit {
            hook.after_commit();
        }
        Ok(())
    }

    /// Rolls the transaction back and discards every hook.
    pub async fn rollback(self) -> Result<()> {
        self.store
            .rollback(self.tx)
            .await
            .map_err(OutboxError::Transaction)
    }
}
