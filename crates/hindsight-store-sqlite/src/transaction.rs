//! Explicit transactions over the host's single connection.
//!
//! A [`Transaction`] owns the host's write gate from `BEGIN IMMEDIATE` to
//! its end, so writes from outside the transaction wait rather than
//! interleave with it. Clones share one transaction.
//!
//! Batches that must land independently of the open transaction can be
//! [deferred](Transaction::defer): they run in autocommit mode right after
//! `COMMIT` or `ROLLBACK`, before the gate is released.

use std::{
  fmt,
  sync::{Arc, Mutex, PoisonError, Weak},
};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{Error, Result};

/// A write queued until the open transaction ends.
pub(crate) type Deferred =
  Box<dyn FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<()> + Send + 'static>;

enum State {
  Active { gate: OwnedMutexGuard<()>, deferred: Vec<Deferred> },
  Committed,
  RolledBack,
}

pub(crate) struct Inner {
  id:    Uuid,
  conn:  tokio_rusqlite::Connection,
  state: Mutex<State>,
}

#[derive(Clone)]
pub struct Transaction {
  inner: Arc<Inner>,
}

/// A handle that does not keep the transaction alive.
#[derive(Clone, Default)]
pub(crate) struct WeakTransaction(Weak<Inner>);

impl WeakTransaction {
  pub(crate) fn upgrade(&self) -> Option<Transaction> {
    self.0.upgrade().map(|inner| Transaction { inner })
  }
}

impl fmt::Debug for Transaction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transaction")
      .field("id", &self.inner.id)
      .field("active", &self.is_active())
      .finish()
  }
}

impl Transaction {
  /// Start a transaction. The caller must already hold the write gate.
  pub(crate) async fn begin(
    conn: tokio_rusqlite::Connection,
    gate: OwnedMutexGuard<()>,
  ) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
      })
      .await?;
    let id = Uuid::new_v4();
    tracing::debug!(%id, "began transaction");
    let state = Mutex::new(State::Active { gate, deferred: Vec::new() });
    Ok(Self { inner: Arc::new(Inner { id, conn, state }) })
  }

  pub fn id(&self) -> Uuid { self.inner.id }

  pub fn is_active(&self) -> bool { matches!(*self.state(), State::Active { .. }) }

  pub(crate) fn ensure_active(&self) -> Result<()> {
    if self.is_active() { Ok(()) } else { Err(Error::TransactionFinished(self.inner.id)) }
  }

  pub(crate) fn downgrade(&self) -> WeakTransaction {
    WeakTransaction(Arc::downgrade(&self.inner))
  }

  /// Queue `write` to run once this transaction ends, whether it commits or
  /// rolls back. Hands `write` back if the transaction already ended.
  pub(crate) fn defer(&self, write: Deferred) -> std::result::Result<(), Deferred> {
    match &mut *self.state() {
      State::Active { deferred, .. } => {
        deferred.push(write);
        Ok(())
      }
      _ => Err(write),
    }
  }

  pub async fn commit(&self) -> Result<()> {
    self.ensure_active()?;
    let outcome = self
      .inner
      .conn
      .call(|conn| {
        conn.execute_batch("COMMIT")?;
        Ok(())
      })
      .await;
    match outcome {
      Ok(()) => {
        tracing::debug!(id = %self.inner.id, "committed transaction");
        self.finish(State::Committed).await;
        Ok(())
      }
      Err(err) => {
        // A failed COMMIT may already have rolled back.
        let rolled_back = self
          .inner
          .conn
          .call(|conn| {
            conn.execute_batch("ROLLBACK")?;
            Ok(())
          })
          .await;
        if let Err(rollback_err) = rolled_back {
          tracing::debug!(id = %self.inner.id, error = %rollback_err, "rollback after failed commit");
        }
        self.finish(State::RolledBack).await;
        Err(err.into())
      }
    }
  }

  pub async fn rollback(&self) -> Result<()> {
    self.ensure_active()?;
    self
      .inner
      .conn
      .call(|conn| {
        conn.execute_batch("ROLLBACK")?;
        Ok(())
      })
      .await?;
    tracing::debug!(id = %self.inner.id, "rolled back transaction");
    self.finish(State::RolledBack).await;
    Ok(())
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record the outcome, run deferred writes, then release the write gate.
  async fn finish(&self, outcome: State) {
    let previous = std::mem::replace(&mut *self.state(), outcome);
    if let State::Active { gate, deferred } = previous {
      run_deferred(&self.inner.conn, self.inner.id, deferred).await;
      drop(gate);
    }
  }
}

/// Each deferred write is its own unit; a failure is logged and the rest
/// still run.
async fn run_deferred(conn: &tokio_rusqlite::Connection, id: Uuid, deferred: Vec<Deferred>) {
  if deferred.is_empty() {
    return;
  }
  let count = deferred.len();
  let failures = conn
    .call(move |conn| {
      let mut failures = Vec::new();
      for write in deferred {
        if let Err(err) = write(conn) {
          failures.push(err.to_string());
        }
      }
      Ok(failures)
    })
    .await;
  match failures {
    Ok(failures) => {
      for error in &failures {
        tracing::warn!(%id, %error, "deferred write failed");
      }
      tracing::debug!(%id, writes = count, failed = failures.len(), "ran deferred writes");
    }
    Err(err) => tracing::warn!(%id, error = %err, "deferred writes did not run"),
  }
}

async fn abandon(conn: tokio_rusqlite::Connection, id: Uuid, deferred: Vec<Deferred>) {
  let rolled_back = conn
    .call(|conn| {
      conn.execute_batch("ROLLBACK")?;
      Ok(())
    })
    .await;
  match rolled_back {
    Ok(()) => tracing::warn!(%id, "rolled back abandoned transaction"),
    Err(err) => tracing::warn!(%id, error = %err, "rollback of abandoned transaction failed"),
  }
  run_deferred(&conn, id, deferred).await;
}

impl Drop for Inner {
  /// A transaction abandoned while active is rolled back before the write
  /// gate is released: on the ambient runtime when there is one, otherwise
  /// on a throwaway one, blocking the dropping thread.
  fn drop(&mut self) {
    let state = std::mem::replace(
      self.state.get_mut().unwrap_or_else(PoisonError::into_inner),
      State::RolledBack,
    );
    let State::Active { gate, deferred } = state else { return };

    let conn = self.conn.clone();
    let id = self.id;
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      runtime.spawn(async move {
        abandon(conn, id, deferred).await;
        drop(gate);
      });
      return;
    }
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
      Ok(runtime) => runtime.block_on(abandon(conn, id, deferred)),
      Err(err) => {
        tracing::warn!(%id, error = %err, "abandoned transaction left open; no runtime to roll back on");
      }
    }
    drop(gate);
  }
}
