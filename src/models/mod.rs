//! Data models for pgtemplate.
//!
//! This module re-exports all model types used throughout the crate.

pub mod notification;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use notification::{Notification, RawNotification};
pub use query::{CommandStatus, DEFAULT_CURSOR_PREFETCH, QueryParam};
pub use transaction::TransactionStatus;
