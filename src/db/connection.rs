//! Typed connection.
//!
//! Every query operation assembles its template first, so plain SQL strings
//! are rejected before anything reaches the server. Results are decoded with
//! [`RowDecoder`].

use crate::db::cursor::CursorFactory;
use crate::db::decoder::RowDecoder;
use crate::db::listener::{ListenerAdapter, ListenerRegistry, NotificationHandler, handler_key};
use crate::db::transaction::Transaction;
use crate::db::transport::{RawListener, Transport};
use crate::error::{DbError, DbResult};
use crate::models::CommandStatus;
use crate::query::{Query, QueryAssembler};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Generate a unique connection ID.
fn generate_connection_id() -> String {
    format!("conn_{}", uuid::Uuid::new_v4().simple())
}

/// One database connection with typed query operations.
///
/// Operations take `&mut self`: a connection runs one operation at a time.
pub struct Connection<T: Transport> {
    transport: T,
    assembler: Arc<QueryAssembler>,
    id: String,
    listeners: ListenerRegistry,
    timeout: Option<Duration>,
    /// Set when a transaction was dropped while open; settled before the next operation.
    pending_rollback: bool,
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("listeners", &self.listeners)
            .field("timeout", &self.timeout)
            .field("pending_rollback", &self.pending_rollback)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, assembler: Arc<QueryAssembler>) -> Self {
        Self {
            transport,
            assembler,
            id: generate_connection_id(),
            listeners: ListenerRegistry::default(),
            timeout: None,
            pending_rollback: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of `(handler, channel)` registrations.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Timeout applied to each query operation, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Execute a command and return its status, e.g. `UPDATE 1`.
    pub async fn execute<'q>(&mut self, query: impl Into<Query<'q>>) -> DbResult<CommandStatus> {
        let assembled = self.assembler.assemble(query)?;
        self.settle().await?;
        debug!(connection_id = %self.id, param_count = assembled.args.len(), "execute");
        self.transport
            .execute(&assembled.sql, &assembled.args, self.timeout)
            .await
    }

    /// Run a query and decode every row into `R`.
    pub async fn fetch<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<Vec<R>>
    where
        R: DeserializeOwned + 'static,
    {
        let assembled = self.assembler.assemble(query)?;
        self.settle().await?;
        debug!(connection_id = %self.id, param_count = assembled.args.len(), "fetch");
        let rows = self
            .transport
            .fetch(&assembled.sql, &assembled.args, self.timeout)
            .await?;
        RowDecoder::decode_rows(rows)
    }

    /// Run a query and decode the first column of its first row into `R`.
    ///
    /// With no rows the raw value is NULL, so `R` should be an `Option` when
    /// the result may be empty.
    pub async fn fetchval<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<R>
    where
        R: DeserializeOwned + 'static,
    {
        self.fetchval_at(query, 0).await
    }

    /// Like [`fetchval`](Self::fetchval) for the zero-based `column`.
    pub async fn fetchval_at<'q, R>(
        &mut self,
        query: impl Into<Query<'q>>,
        column: usize,
    ) -> DbResult<R>
    where
        R: DeserializeOwned + 'static,
    {
        let assembled = self.assembler.assemble(query)?;
        self.settle().await?;
        debug!(connection_id = %self.id, param_count = assembled.args.len(), column, "fetchval");
        let value = self
            .transport
            .fetchval(&assembled.sql, &assembled.args, column, self.timeout)
            .await?;
        RowDecoder::decode(&value)
    }

    /// Run a query and decode its first row, `None` when there is none.
    pub async fn fetchrow<'q, R>(&mut self, query: impl Into<Query<'q>>) -> DbResult<Option<R>>
    where
        R: DeserializeOwned + 'static,
    {
        let assembled = self.assembler.assemble(query)?;
        self.settle().await?;
        debug!(connection_id = %self.id, param_count = assembled.args.len(), "fetchrow");
        let row = self
            .transport
            .fetchrow(&assembled.sql, &assembled.args, self.timeout)
            .await?;
        row.map(RowDecoder::decode_row).transpose()
    }

    /// Open a server-side cursor over `query`.
    ///
    /// Await the factory for an interactive [`Cursor`](crate::db::Cursor), or
    /// call [`stream`](CursorFactory::stream) to iterate rows. PostgreSQL only
    /// allows cursors inside a transaction block.
    pub fn cursor<'q, R>(&mut self, query: impl Into<Query<'q>>) -> CursorFactory<'_, T, R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let assembled = self.assembler.assemble(query);
        let timeout = self.timeout;
        CursorFactory::new(self, assembled, timeout)
    }

    /// Subscribe `handler` to `channel`, decoding each payload into `P`.
    ///
    /// Registering the same handler on the same channel again replaces the
    /// earlier registration.
    pub async fn add_listener<P, H>(&mut self, channel: &str, handler: Arc<H>) -> DbResult<()>
    where
        P: DeserializeOwned + Send + 'static,
        H: NotificationHandler<P> + ?Sized + 'static,
    {
        let key = handler_key(&handler);
        let adapter: Arc<dyn RawListener> =
            Arc::new(ListenerAdapter::<P, H>::new(self.id.clone(), handler));

        if let Some(previous) = self.listeners.remove(key, channel) {
            self.transport.remove_listener(channel, &previous).await?;
        }
        self.transport
            .add_listener(channel, Arc::clone(&adapter))
            .await?;
        self.listeners.insert(key, channel, adapter);

        debug!(connection_id = %self.id, channel = %channel, "Listener added");
        Ok(())
    }

    /// Unsubscribe a handler previously added to `channel`.
    ///
    /// Fails with [`DbError::ListenerNotFound`] if the pair was never registered.
    pub async fn remove_listener<H>(&mut self, channel: &str, handler: &Arc<H>) -> DbResult<()>
    where
        H: ?Sized,
    {
        let key = handler_key(handler);
        let adapter = self
            .listeners
            .remove(key, channel)
            .ok_or_else(|| DbError::listener_not_found(channel))?;
        self.transport.remove_listener(channel, &adapter).await?;

        debug!(connection_id = %self.id, channel = %channel, "Listener removed");
        Ok(())
    }

    /// Start a transaction.
    ///
    /// The returned [`Transaction`] borrows the connection mutably, so only
    /// one can be open at a time. Finish it with
    /// [`close`](Transaction::close) or [`abort`](Transaction::abort);
    /// a transaction dropped while open is rolled back before the next
    /// operation on this connection.
    pub async fn begin(&mut self) -> DbResult<Transaction<'_, T>> {
        self.settle().await?;
        self.transport.begin().await?;
        debug!(connection_id = %self.id, "Transaction started");
        Ok(Transaction::new(self))
    }

    /// Run `f` inside a transaction.
    ///
    /// On `Ok` the transaction commits, or rolls back if `f` marked it for
    /// rollback. On `Err` it rolls back and the original error is returned
    /// unchanged; a failing rollback is only logged.
    ///
    /// ```no_run
    /// # async fn demo(conn: &mut pgtemplate::PgConnection) -> pgtemplate::DbResult<()> {
    /// use pgtemplate::sql;
    ///
    /// let id = 1;
    /// conn.transaction(async |tx| {
    ///     tx.execute(sql!("UPDATE students SET gpa = 1 WHERE id = " {id})).await?;
    ///     Ok::<_, pgtemplate::DbError>(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<R, E, F>(&mut self, f: F) -> Result<R, E>
    where
        F: AsyncFnOnce(&mut Transaction<'_, T>) -> Result<R, E>,
        E: From<DbError>,
        T: 'static,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.close().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.abort().await {
                    warn!(error = %rollback_error, "Rollback after failed transaction failed");
                }
                Err(e)
            }
        }
    }

    /// Hand back the transport, rolling back a dropped transaction and
    /// unregistering every listener first.
    pub(crate) async fn into_transport(mut self) -> T {
        if let Err(e) = self.settle().await {
            warn!(connection_id = %self.id, error = %e, "Rollback before release failed");
        }

        let listeners: Vec<_> = self.listeners.drain().collect();
        for (channel, adapter) in listeners {
            if let Err(e) = self.transport.remove_listener(&channel, &adapter).await {
                warn!(connection_id = %self.id, channel = %channel, error = %e, "Failed to remove listener on release");
            }
        }

        self.transport
    }

    /// Roll back a transaction that was dropped without being finished.
    pub(crate) async fn settle(&mut self) -> DbResult<()> {
        if self.pending_rollback {
            self.transport.rollback().await?;
            self.pending_rollback = false;
            debug!(connection_id = %self.id, "Rolled back abandoned transaction");
        }
        Ok(())
    }

    pub(crate) fn mark_pending_rollback(&mut self) {
        self.pending_rollback = true;
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
