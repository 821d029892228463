//! Transaction & rollback manager.
//!
//! A top-level run owns the database transaction; a nested run owns a
//! savepoint inside its parent's transaction. Either way the scope is ended
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use sqlrest_domain::SharedTransaction;
use sqlrest_storage::{Database, StorageError, StorageResult};

/// What a transaction manager ends when the run completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionScope {
    /// The whole database transaction.
    Root,
    /// A named savepoint of an enclosing transaction.
    Savepoint(String),
}

/// How a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Owns one transactional scope of a batch run.
pub struct TransactionManager {
    transaction: SharedTransaction,
    scope: TransactionScope,
    finished: AtomicBool,
}

impl TransactionManager {
    /// Opens a new database transaction.
    pub async fn begin(database: &dyn Database) -> StorageResult<Self> {
        let transaction = database.begin().await?;
        Ok(Self::root(Arc::new(Mutex::new(transaction))))
    }

    /// Takes ownership of an already open transaction.
    pub fn root(transaction: SharedTransaction) -> Self {
        Self {
            transaction,
            scope: TransactionScope::Root,
            finished: AtomicBool::new(false),
        }
    }

    /// Opens a savepoint named `name` inside `transaction`.
    pub async fn savepoint(transaction: SharedTransaction, name: String) -> StorageResult<Self> {
        transaction.lock().await.savepoint(&name).await?;
        debug!(savepoint = %name, "savepoint opened");
        Ok(Self {
            transaction,
            scope: TransactionScope::Savepoint(name),
            finished: AtomicBool::new(false),
        })
    }

    pub fn transaction(&self) -> &SharedTransaction {
        &self.transaction
    }

    pub fn scope(&self) -> &TransactionScope {
        &self.scope
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Commits when `commit` is true, rolls back otherwise.
    ///
    /// A second call fails without touching the database.
    pub async fn finish(&self, commit: bool) -> StorageResult<TransactionOutcome> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(StorageError::TransactionError {
                message: "batch transaction already finished".to_string(),
            });
        }
        let mut transaction = self.transaction.lock().await;
        let outcome = match (&self.scope, commit) {
            (TransactionScope::Root, true) => {
                transaction.commit().await?;
                TransactionOutcome::Committed
            }
            (TransactionScope::Root, false) => {
                transaction.rollback().await?;
                TransactionOutcome::RolledBack
            }
            (TransactionScope::Savepoint(name), true) => {
                transaction.release_savepoint(name).await?;
                TransactionOutcome::Committed
            }
            (TransactionScope::Savepoint(name), false) => {
                transaction.rollback_to_savepoint(name).await?;
                TransactionOutcome::RolledBack
            }
        };
        debug!(scope = ?self.scope, outcome = ?outcome, "transaction scope finished");
        Ok(outcome)
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if !self.is_finished() {
            // The backend rolls back an abandoned transaction on drop.
            warn!(scope = ?self.scope, "batch transaction dropped without commit or rollback");
        }
    }
}
