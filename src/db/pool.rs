//! Connection pool and scoped acquisition.
//!
//! [`Pool::acquire`] hands out a [`Context`], which derefs to a
//! [`Connection`] and returns it to the pool exactly once: either through
//! [`Context::release`] or, as a fallback, when the context is dropped.

use crate::config::PoolConfig;
use crate::db::connection::Connection;
use crate::db::postgres::PgConnectionSource;
use crate::db::transport::ConnectionSource;
use crate::error::DbResult;
use crate::query::QueryAssembler;
use sqlx::postgres::PgPool;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared pool of database connections.
///
/// Cloning is cheap; clones share the same underlying source.
pub struct Pool<S: ConnectionSource = PgConnectionSource> {
    source: Arc<S>,
    assembler: Arc<QueryAssembler>,
    command_timeout: Option<Duration>,
}

impl<S: ConnectionSource> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            assembler: Arc::clone(&self.assembler),
            command_timeout: self.command_timeout,
        }
    }
}

impl<S: ConnectionSource> std::fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl Pool<PgConnectionSource> {
    /// Connect to PostgreSQL.
    ///
    /// Pool options may be given as URL query parameters
    /// (`?max_connections=5&command_timeout=30`); they are stripped before
    /// the URL reaches the driver.
    pub async fn connect(url: &str) -> DbResult<Self> {
        Self::connect_with(url, PoolConfig::default()).await
    }

    /// Connect with explicit options. Options set in `config` take
    /// precedence over the same options in the URL.
    pub async fn connect_with(url: &str, config: PoolConfig) -> DbResult<Self> {
        let (url, url_config) = PoolConfig::from_url(url)?;
        let config = config.merge(url_config);
        let source = PgConnectionSource::connect_with(&url, &config).await?;
        Ok(Self::new(source).with_command_timeout(config.command_timeout()))
    }

    /// Wrap an existing sqlx pool.
    pub fn from_pg_pool(pool: PgPool) -> Self {
        Self::new(PgConnectionSource::new(pool))
    }
}

impl<S: ConnectionSource> Pool<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            assembler: Arc::new(QueryAssembler::new()),
            command_timeout: None,
        }
    }

    /// Use `assembler` for every connection acquired from now on.
    pub fn with_assembler(mut self, assembler: QueryAssembler) -> Self {
        self.assembler = Arc::new(assembler);
        self
    }

    /// Default timeout applied to each operation on acquired connections.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Borrow one connection for the lifetime of the returned [`Context`].
    pub async fn acquire(&self) -> DbResult<Context<S>> {
        let transport = self.source.acquire().await?;
        let mut conn = Connection::new(transport, Arc::clone(&self.assembler));
        conn.set_timeout(self.command_timeout);
        debug!(connection_id = %conn.id(), "Connection acquired");

        Ok(Context {
            conn: Some(conn),
            source: Arc::clone(&self.source),
        })
    }

    /// Close the pool. Connections still held by contexts are closed as
    /// they are released.
    pub async fn close(&self) {
        self.source.close().await;
        info!("Pool closed");
    }
}

/// A connection borrowed from a [`Pool`].
///
/// Call [`release`](Context::release) when done. A context that is dropped
/// instead is released on a spawned task.
pub struct Context<S: ConnectionSource> {
    /// `None` only once released.
    conn: Option<Connection<S::Transport>>,
    source: Arc<S>,
}

impl<S: ConnectionSource> std::fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> Context<S> {
    /// Return the connection to the pool.
    ///
    /// A transaction left open is rolled back and every listener is
    /// removed before the connection is handed back.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let id = conn.id().to_string();
            let transport = conn.into_transport().await;
            self.source.release(transport).await;
            debug!(connection_id = %id, "Connection released");
        }
    }
}

impl<S: ConnectionSource> Deref for Context<S> {
    type Target = Connection<S::Transport>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<S: ConnectionSource> DerefMut for Context<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<S: ConnectionSource> Drop for Context<S> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                connection_id = %conn.id(),
                "Context dropped outside a tokio runtime; connection dropped without cleanup"
            );
            return;
        };

        let source = Arc::clone(&self.source);
        runtime.spawn(async move {
            let id = conn.id().to_string();
            let transport = conn.into_transport().await;
            source.release(transport).await;
            warn!(
                connection_id = %id,
                "Connection released via Drop - consider using explicit release()"
            );
        });
    }
}
