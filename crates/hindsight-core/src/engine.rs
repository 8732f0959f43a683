//! The [`Engine`] trait: the data-engine operations snapshot hooks need.
//!
//! The trait is implemented by hosts (e.g. `hindsight-store-sqlite`). The
//! interceptor depends on this abstraction, never on a concrete backend.

use std::{fmt, future::Future};

use crate::{model::Record, query::Filter};

/// Parameters for [`Engine::find_all`].
#[derive(Debug, Clone)]
pub struct FindOptions<T> {
  pub filter:      Filter,
  pub transaction: Option<T>,
  /// When `false`, soft-deleted rows are returned too.
  pub paranoid:    bool,
}

impl<T> FindOptions<T> {
  pub fn new(filter: Filter) -> Self {
    Self { filter, transaction: None, paranoid: true }
  }
}

/// Abstraction over the data engine history rows are written through.
///
/// `Clone` must be cheap: hooks clone the engine into detached snapshot
/// writes.
pub trait Engine: Clone + Send + Sync + 'static {
  /// Handle to an open transaction. Cloning shares the same transaction.
  type Transaction: Clone + fmt::Debug + Send + Sync + 'static;
  type Error: std::error::Error + Send + Sync + 'static;

  /// Insert `rows` into `entity` as one batch, applying attribute defaults.
  /// Fires no hooks. Returns the number of rows written.
  fn create_many<'a>(
    &'a self,
    entity: &'a str,
    rows: Vec<Record>,
    transaction: Option<Self::Transaction>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  /// Return every row of `entity` matching `options.filter`.
  fn find_all<'a>(
    &'a self,
    entity: &'a str,
    options: FindOptions<Self::Transaction>,
  ) -> impl Future<Output = Result<Vec<Record>, Self::Error>> + Send + 'a;
}
