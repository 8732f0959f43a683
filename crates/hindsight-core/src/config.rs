//! History configuration.
//!
//! Every key is optional. The struct deserialises from camelCase keys so a
//! host application can embed it in its own configuration source.

use std::{fmt, sync::Arc};

use serde::Deserialize;

use crate::Error;

/// Callback for snapshot write failures that non-blocking mode would
/// otherwise drop. Never changes what the triggering write reports.
pub type SnapshotErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
  /// The triggering write awaits the snapshot write.
  pub blocking:            bool,
  /// Capture post-write state with after-hooks on every mutation kind,
  /// instead of pre-write state on update and destroy only.
  pub full:                bool,
  pub model_suffix:        String,
  pub index_suffix:        String,
  pub deleted_column_name: String,
  pub add_associations:    bool,
  /// Snapshot writes join the triggering write's transaction.
  pub allow_transactions:  bool,
  #[serde(skip)]
  pub on_snapshot_error:   Option<SnapshotErrorHandler>,
}

impl Default for HistoryConfig {
  fn default() -> Self {
    Self {
      blocking:            true,
      full:                false,
      model_suffix:        "History".into(),
      index_suffix:        "_history".into(),
      deleted_column_name: "temporalizeDeleted".into(),
      add_associations:    false,
      allow_transactions:  true,
      on_snapshot_error:   None,
    }
  }
}

impl fmt::Debug for HistoryConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HistoryConfig")
      .field("blocking", &self.blocking)
      .field("full", &self.full)
      .field("model_suffix", &self.model_suffix)
      .field("index_suffix", &self.index_suffix)
      .field("deleted_column_name", &self.deleted_column_name)
      .field("add_associations", &self.add_associations)
      .field("allow_transactions", &self.allow_transactions)
      .field("on_snapshot_error", &self.on_snapshot_error.is_some())
      .finish()
  }
}

impl HistoryConfig {
  pub fn blocking(mut self, on: bool) -> Self {
    self.blocking = on;
    self
  }

  pub fn full(mut self, on: bool) -> Self {
    self.full = on;
    self
  }

  pub fn add_associations(mut self, on: bool) -> Self {
    self.add_associations = on;
    self
  }

  pub fn allow_transactions(mut self, on: bool) -> Self {
    self.allow_transactions = on;
    self
  }

  pub fn on_snapshot_error<F>(mut self, handler: F) -> Self
  where
    F: Fn(&Error) + Send + Sync + 'static,
  {
    self.on_snapshot_error = Some(Arc::new(handler));
    self
  }

  /// Name of the history entity shadowing `live`.
  pub fn history_name(&self, live: &str) -> String {
    format!("{live}{}", self.model_suffix)
  }
}
