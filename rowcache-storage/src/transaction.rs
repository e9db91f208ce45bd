//! Transaction coordination.

use tracing::{debug, error, warn};

use rowcache_core::StorageError;

use crate::executor::SqlExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction,
}

/// Owns the executor and tracks whether a transaction is open on it.
///
/// At most one transaction is active at a time. Starting a second one rolls
/// the first back and then panics: nested transactions indicate a caller bug
/// that must not be papered over.
pub struct TransactionCoordinator<X: SqlExecutor> {
    executor: X,
    state: TransactionState,
}

impl<X: SqlExecutor> TransactionCoordinator<X> {
    pub fn new(executor: X) -> Self {
        Self {
            executor,
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::InTransaction
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut X {
        &mut self.executor
    }

    /// # Panics
    ///
    /// Panics with "Transactions are duplicated." if a transaction is already
    /// active, after rolling it back.
    pub fn begin(&mut self) -> Result<(), StorageError> {
        if self.is_active() {
            if let Err(e) = self.rollback() {
                error!(error = %e, "rollback of duplicated transaction failed");
            }
            error!("start_transaction called while a transaction is active");
            panic!("Transactions are duplicated.");
        }
        self.executor.begin()?;
        self.state = TransactionState::InTransaction;
        debug!("transaction started");
        Ok(())
    }

    /// Commit. On failure the transaction is rolled back and the error
    /// returned; the coordinator is idle either way.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        if !self.is_active() {
            return Err(StorageError::TransactionFailed {
                reason: "commit without an active transaction".to_string(),
            });
        }
        match self.executor.commit() {
            Ok(()) => {
                self.state = TransactionState::Idle;
                debug!("transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "commit failed, rolling back");
                if let Err(rollback) = self.executor.rollback() {
                    error!(error = %rollback, "rollback after failed commit failed");
                }
                self.state = TransactionState::Idle;
                Err(e)
            }
        }
    }

    /// Roll back. A no-op when idle.
    pub fn rollback(&mut self) -> Result<(), StorageError> {
        if !self.is_active() {
            return Ok(());
        }
        self.state = TransactionState::Idle;
        self.executor.rollback()?;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Roll back anything still open and hand the executor back.
    pub fn close(mut self) -> Result<X, StorageError> {
        self.rollback()?;
        Ok(self.executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Row;
    use crate::sql::Statement;

    #[derive(Default)]
    struct Recording {
        calls: Vec<&'static str>,
        fail_commit: bool,
    }

    impl SqlExecutor for Recording {
        fn query(&mut self, _stmt: &Statement) -> Result<Vec<Row>, StorageError> {
            Ok(Vec::new())
        }

        fn execute(&mut self, _stmt: &Statement) -> Result<usize, StorageError> {
            Ok(0)
        }

        fn insert(&mut self, _stmt: &Statement) -> Result<Option<i64>, StorageError> {
            Ok(None)
        }

        fn begin(&mut self) -> Result<(), StorageError> {
            self.calls.push("begin");
            Ok(())
        }

        fn commit(&mut self) -> Result<(), StorageError> {
            self.calls.push("commit");
            if self.fail_commit {
                return Err(StorageError::TransactionFailed {
                    reason: "disk full".to_string(),
                });
            }
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), StorageError> {
            self.calls.push("rollback");
            Ok(())
        }
    }

    #[test]
    fn test_begin_commit() {
        let mut tx = TransactionCoordinator::new(Recording::default());
        tx.begin().unwrap();
        assert!(tx.is_active());
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Idle);
        assert_eq!(tx.executor().calls, vec!["begin", "commit"]);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let mut tx = TransactionCoordinator::new(Recording {
            fail_commit: true,
            ..Default::default()
        });
        tx.begin().unwrap();
        assert!(tx.commit().is_err());
        assert!(!tx.is_active());
        assert_eq!(tx.executor().calls, vec!["begin", "commit", "rollback"]);
    }

    #[test]
    fn test_commit_when_idle_is_an_error() {
        let mut tx = TransactionCoordinator::new(Recording::default());
        assert!(matches!(
            tx.commit().unwrap_err(),
            StorageError::TransactionFailed { .. }
        ));
        tx.rollback().unwrap();
        assert!(tx.executor().calls.is_empty());
    }

    #[test]
    fn test_close_rolls_back_open_transaction() {
        let mut tx = TransactionCoordinator::new(Recording::default());
        tx.begin().unwrap();
        let exec = tx.close().unwrap();
        assert_eq!(exec.calls, vec!["begin", "rollback"]);
    }

    #[test]
    #[should_panic(expected = "Transactions are duplicated.")]
    fn test_duplicate_begin_panics() {
        let mut tx = TransactionCoordinator::new(Recording::default());
        tx.begin().unwrap();
        let _ = tx.begin();
    }
}
