//! Transaction state machine.
//!
//! A [`Transaction`] forwards query operations to its connection only while
//! its status is `Started`. After a commit, a rollback or
//! [`mark_for_rollback`](Transaction::mark_for_rollback) every operation fails
//! with [`DbError::TransactionClosed`].
//!
//! Scope exit decides the outcome: [`close`](Transaction::close) commits
//! unless the transaction was marked, [`abort`](Transaction::abort) always
//! rolls back. A transaction dropped without either is rolled back before the
//! connection's next operation.

use crate::db::connection::Connection;
use crate::db::cursor::CursorFactory;
use crate::db::transport::Transport;
use crate::error::{DbError, DbResult};
use crate::models::{CommandStatus, TransactionStatus};
use crate::query::Query;
use serde::de::DeserializeOwned;
use tracing::debug;

/// An open transaction on a [`Connection`].
pub struct Transaction<'c, T: Transport> {
    conn: &'c mut Connection<T>,
    status: TransactionStatus,
}

impl<T: Transport> std::fmt::Debug for Transaction<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("connection_id", &self.conn.id())
            .field("status", &self.status)
            .finish()
    }
}

impl<'c, T: Transport> Transaction<'c, T> {
    /// Wrap a connection on which `BEGIN` has already run.
    pub(crate) fn new(conn: &'c mut Connection<T>) -> Self {
        Self {
            conn,
            status: TransactionStatus::Started,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    fn check_status(&self) -> DbResult<()> {
        if self.status.is_active() {
            Ok(())
        } else {
            Err(DbError::transaction_closed(self.status))
        }
    }

    /// Execute a command and return its status, e.g. `UPDATE 1`.
    pub async fn execute<'q>(&mut self, query: impl Into<Query<'q>>) -> DbResult<CommandStatus> {
        self.check_status()?;
        self.conn.execute(query).await
    }

    /// Run a query and decode every row into `R`.
    pub async fn fetch<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<Vec<R>>
    where
        R: DeserializeOwned + 'static,
    {
        self.check_status()?;
        self.conn.fetch(query).await
    }

    /// Run a query and decode the first column of its first row into `R`.
    pub async fn fetchval<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<R>
    where
        R: DeserializeOwned + 'static,
    {
        self.check_status()?;
        self.conn.fetchval(query).await
    }

    pub async fn fetchval_at<'q, R>(
        &mut self,
        query: impl Into<Query<'q>>,
        column: usize,
    ) -> DbResult<R>
    where
        R: DeserializeOwned + 'static,
    {
        self.check_status()?;
        self.conn.fetchval_at(query, column).await
    }

    /// Run a query and decode its first row, `None` when there is none.
    pub async fn fetchrow<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<Option<R>>
    where
        R: DeserializeOwned + 'static,
    {
        self.check_status()?;
        self.conn.fetchrow(query).await
    }

    /// Open a server-side cursor over `query`.
    ///
    /// On a transaction that is no longer started, the factory fails with
    /// [`DbError::TransactionClosed`] when awaited or streamed.
    pub fn cursor<'q, R>(&mut self, query: impl Into<Query<'q>>) -> CursorFactory<'_, T, R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        match self.check_status() {
            Ok(()) => self.conn.cursor(query),
            Err(e) => {
                let timeout = self.conn.timeout();
                CursorFactory::new(self.conn, Err(e), timeout)
            }
        }
    }

    /// Mark the transaction so that scope exit rolls it back.
    ///
    /// No further operations are accepted. Fails with
    /// [`DbError::TransactionClosed`] unless the transaction is started.
    pub fn mark_for_rollback(&mut self) -> DbResult<()> {
        self.check_status()?;
        self.status = TransactionStatus::MarkedForRollback;
        debug!(connection_id = %self.conn.id(), "Transaction marked for rollback");
        Ok(())
    }

    /// Commit now.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.check_status()?;
        self.conn.transport_mut().commit().await?;
        self.status = TransactionStatus::Committed;
        debug!(connection_id = %self.conn.id(), "Transaction committed");
        Ok(())
    }

    /// Roll back now. Allowed while started or marked for rollback.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if self.status.is_terminal() {
            return Err(DbError::transaction_closed(self.status));
        }
        self.conn.transport_mut().rollback().await?;
        self.status = TransactionStatus::RolledBack;
        debug!(connection_id = %self.conn.id(), "Transaction rolled back");
        Ok(())
    }

    /// Clean scope exit: commit, or roll back if marked for rollback.
    ///
    /// A transaction already committed or rolled back is left as is.
    /// Returns the final status.
    pub async fn close(mut self) -> DbResult<TransactionStatus> {
        match self.status {
            TransactionStatus::Started => self.commit().await?,
            TransactionStatus::MarkedForRollback => self.rollback().await?,
            TransactionStatus::Committed | TransactionStatus::RolledBack => {}
        }
        Ok(self.status)
    }

    /// Scope exit on error: roll back unless already finished.
    pub async fn abort(mut self) -> DbResult<()> {
        if !self.status.is_terminal() {
            self.rollback().await?;
        }
        Ok(())
    }
}

impl<T: Transport> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        if !self.status.is_terminal() {
            debug!(
                connection_id = %self.conn.id(),
                status = %self.status,
                "Transaction dropped while open, rollback deferred"
            );
            self.conn.mark_pending_rollback();
        }
    }
}
