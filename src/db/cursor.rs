//! Server-side cursors.
//!
//! A [`CursorFactory`] is returned by `cursor()`. Awaiting it declares the
//! cursor and yields an interactive [`Cursor`]; [`CursorFactory::stream`]
//! instead yields rows lazily, fetching `prefetch` rows per round trip and
//! decoding each row only when it is pulled from the stream.

use crate::db::connection::Connection;
use crate::db::decoder::RowDecoder;
use crate::db::transport::{RawRow, Transport};
use crate::error::{DbError, DbResult};
use crate::models::DEFAULT_CURSOR_PREFETCH;
use crate::query::AssembledQuery;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

/// Generate a unique cursor name.
fn generate_cursor_name() -> String {
    format!("__pgt_cursor_{}", uuid::Uuid::new_v4().simple())
}

/// A cursor not yet declared on the server.
#[must_use = "a cursor factory does nothing until awaited or streamed"]
pub struct CursorFactory<'c, T: Transport, R> {
    conn: &'c mut Connection<T>,
    query: DbResult<AssembledQuery>,
    prefetch: u32,
    timeout: Option<Duration>,
    _row: PhantomData<fn() -> R>,
}

impl<'c, T, R> CursorFactory<'c, T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    /// `query` may already hold an error; it surfaces when the cursor is opened.
    pub(crate) fn new(
        conn: &'c mut Connection<T>,
        query: DbResult<AssembledQuery>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            conn,
            query,
            prefetch: DEFAULT_CURSOR_PREFETCH,
            timeout,
            _row: PhantomData,
        }
    }

    /// Rows fetched per round trip when streaming (default: 50).
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Timeout for each statement the cursor issues.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn open(self) -> DbResult<Cursor<'c, T, R>> {
        let query = self.query?;
        if self.prefetch == 0 {
            return Err(DbError::invalid_input("cursor prefetch must be greater than 0"));
        }

        self.conn.settle().await?;
        let name = generate_cursor_name();
        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", name, query.sql);
        self.conn
            .transport_mut()
            .execute(&declare, &query.args, self.timeout)
            .await?;

        debug!(cursor = %name, param_count = query.args.len(), "Cursor declared");

        Ok(Cursor {
            conn: self.conn,
            name,
            timeout: self.timeout,
            _row: PhantomData,
        })
    }

    /// Iterate the result lazily, forward only.
    ///
    /// The cursor is closed once the result is exhausted. Dropping the stream
    /// early leaves it open until the transaction ends.
    pub fn stream(self) -> impl Stream<Item = DbResult<R>> + Send + 'c {
        let prefetch = self.prefetch;
        stream::try_unfold(RowStream::Unopened(self), move |state| {
            next_row(state, prefetch)
        })
    }
}

/// Pull one row, refilling the buffer from the server when it runs dry.
async fn next_row<'c, T, R>(
    state: RowStream<'c, T, R>,
    prefetch: u32,
) -> DbResult<Option<(R, RowStream<'c, T, R>)>>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    let (mut cursor, mut buffer, mut exhausted) = match state {
        RowStream::Unopened(factory) => (factory.open().await?, VecDeque::new(), false),
        RowStream::Open {
            cursor,
            buffer,
            exhausted,
        } => (cursor, buffer, exhausted),
    };

    if buffer.is_empty() && !exhausted {
        let rows = cursor.fetch_raw(prefetch).await?;
        exhausted = rows.len() < prefetch as usize;
        buffer = rows.into();
    }

    match buffer.pop_front() {
        Some(raw) => {
            let row = RowDecoder::decode_row(raw)?;
            Ok(Some((
                row,
                RowStream::Open {
                    cursor,
                    buffer,
                    exhausted,
                },
            )))
        }
        None => {
            cursor.close().await?;
            Ok(None)
        }
    }
}

impl<'c, T, R> IntoFuture for CursorFactory<'c, T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    type Output = DbResult<Cursor<'c, T, R>>;
    type IntoFuture = BoxFuture<'c, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.open())
    }
}

enum RowStream<'c, T: Transport, R> {
    Unopened(CursorFactory<'c, T, R>),
    Open {
        cursor: Cursor<'c, T, R>,
        buffer: VecDeque<RawRow>,
        exhausted: bool,
    },
}

/// An open, forward-only server-side cursor.
pub struct Cursor<'c, T: Transport, R> {
    conn: &'c mut Connection<T>,
    name: String,
    timeout: Option<Duration>,
    _row: PhantomData<fn() -> R>,
}

impl<T: Transport, R> std::fmt::Debug for Cursor<'_, T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<'c, T, R> Cursor<'c, T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch and decode up to `n` rows. `n` must be greater than zero.
    pub async fn fetch(&mut self, n: u32) -> DbResult<Vec<R>> {
        let rows = self.fetch_raw(n).await?;
        RowDecoder::decode_rows(rows)
    }

    /// Fetch and decode the next row, `None` at the end of the result.
    pub async fn fetchrow(&mut self) -> DbResult<Option<R>> {
        let sql = format!("FETCH NEXT FROM {}", self.name);
        let row = self
            .conn
            .transport_mut()
            .fetchrow(&sql, &[], self.timeout)
            .await?;
        row.map(RowDecoder::decode_row).transpose()
    }

    /// Skip up to `n` rows, returning how many were skipped. `n` must be
    /// greater than zero.
    pub async fn forward(&mut self, n: u32) -> DbResult<u64> {
        check_count(n)?;
        let sql = format!("MOVE FORWARD {} FROM {}", n, self.name);
        let status = self
            .conn
            .transport_mut()
            .execute(&sql, &[], self.timeout)
            .await?;
        Ok(status.rows_affected)
    }

    /// Close the cursor on the server.
    pub async fn close(self) -> DbResult<()> {
        let sql = format!("CLOSE {}", self.name);
        self.conn
            .transport_mut()
            .execute(&sql, &[], self.timeout)
            .await?;
        debug!(cursor = %self.name, "Cursor closed");
        Ok(())
    }

    async fn fetch_raw(&mut self, n: u32) -> DbResult<Vec<RawRow>> {
        check_count(n)?;
        let sql = format!("FETCH FORWARD {} FROM {}", n, self.name);
        self.conn
            .transport_mut()
            .fetch(&sql, &[], self.timeout)
            .await
    }
}

/// `FETCH FORWARD 0` re-reads the current row and `MOVE FORWARD 0` does nothing.
fn check_count(n: u32) -> DbResult<()> {
    if n == 0 {
        return Err(DbError::invalid_input("n must be greater than zero"));
    }
    Ok(())
}
