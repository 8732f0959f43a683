//! Error types for `hindsight-core`.

use thiserror::Error;

use crate::hooks::{HookScope, LifecycleEvent};

/// Message carried by [`Error::ReadOnly`].
pub const READ_ONLY_MESSAGE: &str =
  "This is a read-only history database. You aren't allowed to modify it.";

#[derive(Debug, Error)]
pub enum Error {
  /// A direct write was attempted against a history entity.
  #[error("{READ_ONLY_MESSAGE}")]
  ReadOnly,

  /// Persisting a snapshot row failed. Only surfaced in blocking mode.
  #[error("snapshot write failed: {0}")]
  SnapshotWrite(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("cannot derive history schema: {0}")]
  SchemaDerivation(String),

  #[error("invalid entity definition: {0}")]
  InvalidDefinition(String),

  #[error("unknown entity: {0}")]
  UnknownEntity(String),

  #[error("entity already defined: {0}")]
  AlreadyDefined(String),

  #[error("{event} is a {expected:?} event, cannot attach a {found:?} hook")]
  HookScope {
    event:    LifecycleEvent,
    expected: HookScope,
    found:    HookScope,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap an engine failure as a snapshot write failure.
  pub fn snapshot_write<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::SnapshotWrite(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
