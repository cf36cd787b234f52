//! Explicit transaction context for commit-deferred work.

use crate::error::ClientError;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Work to run once the surrounding transaction commits.
pub type AfterCommit = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ClientError>> + Send>;

/// An active transaction that accepts commit callbacks.
///
/// Passing `None` where a `&dyn TransactionContext` is expected means there is
/// no active transaction.
pub trait TransactionContext: Send + Sync {
    /// Queue `callback` to run on commit. Rolled-back transactions never run
    /// their callbacks.
    fn register_after_commit(&self, callback: AfterCommit);
}

/// In-process transaction scope.
///
/// Callbacks run in registration order on [`commit`](Self::commit). Rolling
/// back, or dropping the scope without committing, discards them.
#[derive(Default)]
pub struct TransactionScope {
    callbacks: Mutex<Vec<AfterCommit>>,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks waiting for commit.
    pub fn pending(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every registered callback once, in order.
    ///
    /// The first failure is returned and the remaining callbacks are not run.
    pub async fn commit(self) -> Result<(), ClientError> {
        let callbacks = self
            .callbacks
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(callbacks = callbacks.len(), "Running after-commit callbacks");

        for callback in callbacks {
            callback().await?;
        }
        Ok(())
    }

    /// Discard every registered callback.
    pub fn rollback(self) {
        debug!(discarded = self.pending(), "Transaction rolled back");
    }
}

impl TransactionContext for TransactionScope {
    fn register_after_commit(&self, callback: AfterCommit) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("pending", &self.pending())
            .finish()
    }
}
