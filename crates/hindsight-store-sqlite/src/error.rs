//! Error type for `hindsight-store-sqlite`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] hindsight_core::Error),

  /// A lifecycle hook rejected or failed the write.
  #[error("hook failed: {0}")]
  Hook(#[source] hindsight_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("{entity} has no field {field:?}")]
  UnknownField { entity: String, field: String },

  #[error("{entity} row has no value for primary key {field:?}")]
  MissingPrimaryKey { entity: String, field: String },

  #[error("{0} is not paranoid; there is nothing to restore")]
  NotParanoid(String),

  #[error("timed out waiting for the write lock")]
  Busy,

  #[error("transaction {0} is already finished")]
  TransactionFinished(Uuid),
}

impl Error {
  /// The write was refused because its target is a history entity.
  pub fn is_read_only(&self) -> bool {
    matches!(self, Self::Hook(hindsight_core::Error::ReadOnly))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
