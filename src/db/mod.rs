//! Database layer.
//!
//! - `transport`: seams to the driver (`Transport`, `ConnectionSource`)
//! - `postgres`, `params`, `types`: the sqlx PostgreSQL implementation
//! - `connection`, `transaction`, `cursor`: typed query operations
//! - `decoder`: raw rows to caller types
//! - `listener`: LISTEN/NOTIFY handlers
//! - `pool`: pool and scoped `Context`

pub mod connection;
pub mod cursor;
pub mod decoder;
pub mod listener;
pub mod params;
pub mod pool;
pub mod postgres;
pub mod transaction;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use cursor::{Cursor, CursorFactory};
pub use decoder::{DecodeStrategy, RowDecoder, TypeAdapter};
pub use listener::{
    AsyncFnHandler, FnHandler, NotificationHandler, async_handler_fn, handler_fn,
};
pub use pool::{Context, Pool};
pub use postgres::{PgConnectionSource, PgTransport};
pub use transaction::Transaction;
pub use transport::{ConnectionSource, RawListener, RawRow, Transport};

/// A connection backed by PostgreSQL.
pub type PgConnection = Connection<PgTransport>;
