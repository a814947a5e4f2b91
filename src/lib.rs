//! pgtemplate
//!
//! Template-based PostgreSQL access. Queries are built with [`sql!`], which
//! keeps literal SQL and embedded values apart; values always travel as
//! `$N` parameters and plain SQL strings are refused.
//!
//! ```no_run
//! use pgtemplate::{Pool, sql};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Student {
//!     id: i64,
//!     name: String,
//! }
//!
//! # async fn demo() -> pgtemplate::DbResult<()> {
//! let pool = Pool::connect("postgres://localhost/school?max_connections=5").await?;
//! let mut conn = pool.acquire().await?;
//!
//! let min_id = 10;
//! let students: Vec<Student> = conn
//!     .fetch(sql!("SELECT id, name FROM students WHERE id > " {min_id}))
//!     .await?;
//!
//! conn.release().await;
//! # let _ = students;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod query;

pub use config::PoolConfig;
pub use db::{
    Connection, Context, Cursor, CursorFactory, NotificationHandler, PgConnection, Pool,
    RowDecoder, Transaction, async_handler_fn, handler_fn,
};
pub use error::{DbError, DbResult};
pub use models::{CommandStatus, Notification, QueryParam, TransactionStatus};
pub use query::{AssembledQuery, Embed, Query, QueryAssembler, Template};
