//! Seams between the typed layer and the database driver.
//!
//! [`Transport`] is one physical link to the server, [`ConnectionSource`]
//! hands them out and takes them back. The PostgreSQL implementations live in
//! `db::postgres`; tests substitute recording fakes.

use crate::error::DbResult;
use crate::models::{CommandStatus, QueryParam, RawNotification};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// A row as produced by the transport: column name to value.
pub type RawRow = serde_json::Map<String, JsonValue>;

/// Receives notifications for one channel.
///
/// The transport identifies listeners by `Arc` pointer, so removal must pass
/// the same `Arc` that was registered.
#[async_trait]
pub trait RawListener: Send + Sync {
    async fn notify(&self, notification: RawNotification);
}

/// One link to the database server.
///
/// All query methods receive already-assembled SQL and its ordered
/// arguments. `timeout` bounds the single round trip when set.
#[async_trait]
pub trait Transport: Send {
    async fn execute(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<CommandStatus>;

    async fn fetch(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<Vec<RawRow>>;

    /// First row of the result, if any.
    async fn fetchrow(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<Option<RawRow>>;

    /// Value at `column` of the first row; `Null` when there are no rows.
    async fn fetchval(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        column: usize,
        timeout: Option<Duration>,
    ) -> DbResult<JsonValue>;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    async fn add_listener(&mut self, channel: &str, listener: Arc<dyn RawListener>)
    -> DbResult<()>;

    async fn remove_listener(
        &mut self,
        channel: &str,
        listener: &Arc<dyn RawListener>,
    ) -> DbResult<()>;
}

/// Hands out transports and takes them back.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn acquire(&self) -> DbResult<Self::Transport>;

    async fn release(&self, transport: Self::Transport);

    async fn close(&self);
}

/// Pointer identity of a listener, ignoring vtable metadata.
pub(crate) fn listener_addr(listener: &Arc<dyn RawListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}
