//! SQLite host for `hindsight-core`.
//!
//! [`SqliteHost`] owns the entity registry, materialises tables, and runs
//! the lifecycle hooks around every write, so live entities with a history
//! shadow attached leave snapshot rows behind. Database access runs on
//! [`tokio_rusqlite`]'s dedicated thread without blocking the runtime.

mod encode;
mod host;
mod schema;
mod transaction;

pub mod error;

pub use error::{Error, Result};
pub use host::{BulkOptions, SqliteHost, WriteOptions};
pub use transaction::Transaction;
