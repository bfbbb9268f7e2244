//! Atomic unit of work bound to the engine database.
//!
//! A [`UnitOfWork`] wraps one SQLite transaction together with a list of
//! hooks that run only once the transaction has committed. Delegates use the
//! hooks to publish effects (outgoing envelopes, events) that must never be
//! observed if the step is rolled back. Dropping a unit of work without
//! committing it rolls everything back and discards the hooks.

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::Result;

/// Effect deferred until after commit.
pub type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// A transaction plus its post-commit hooks.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
    hooks: Vec<CommitHook>,
}

impl<'conn> UnitOfWork<'conn> {
    /// Starts a write transaction.
    ///
    /// The database write lock is taken immediately and held until commit or
    /// rollback, so at most one unit of work writes at a time across every
    /// instance. A writer still waiting when the busy timeout expires fails
    /// here with a retryable error rather than halfway through a step.
    pub fn begin(conn: &'conn mut Connection) -> Result<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self {
            tx,
            hooks: Vec::new(),
        })
    }

    /// The connection the transaction runs on.
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Registers an effect to run after a successful commit.
    ///
    /// Hooks run in registration order.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Number of hooks registered so far.
    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Commits the transaction, then runs the hooks.
    pub fn commit(self) -> Result<()> {
        let Self { tx, hooks } = self;
        tx.commit()?;
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Rolls the transaction back and discards the hooks.
    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("pending_hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", []).unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_commit_persists_and_runs_hooks_in_order() {
        let mut conn = conn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut uow = UnitOfWork::begin(&mut conn).unwrap();
        uow.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();
        for i in 0..3 {
            let order = order.clone();
            uow.on_commit(move || order.lock().unwrap().push(i));
        }
        assert_eq!(uow.pending_hooks(), 3);
        uow.commit().unwrap();

        assert_eq!(count(&conn), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_rolls_back_and_skips_hooks() {
        let mut conn = conn();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let mut uow = UnitOfWork::begin(&mut conn).unwrap();
            uow.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();
            let ran = ran.clone();
            uow.on_commit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(count(&conn), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_writer_gets_retryable_busy_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Database::open(dir.path().join("engine.db"), Duration::ZERO).unwrap();
        let mut first = database.connect().unwrap();
        let mut second = database.connect().unwrap();

        let uow = UnitOfWork::begin(&mut first).unwrap();
        let err = UnitOfWork::begin(&mut second).unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");

        uow.commit().unwrap();
        UnitOfWork::begin(&mut second).unwrap().commit().unwrap();
    }

    #[test]
    fn test_explicit_rollback() {
        let mut conn = conn();
        let uow = UnitOfWork::begin(&mut conn).unwrap();
        uow.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();
        uow.rollback().unwrap();
        assert_eq!(count(&conn), 0);
    }
}
