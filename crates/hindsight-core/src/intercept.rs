//! Mutation Interceptor: wires snapshot hooks onto a live entity and
//! read-only guards onto its history entity.
//!
//! The wiring is fixed at setup from [`HistoryConfig::full`]; see
//! [`live_wiring`]. Snapshot writes go through the host's [`Engine`].
//!
//! In non-blocking mode a failed snapshot write never reaches the caller of
//! the triggering write. It is logged and handed to
//! [`HistoryConfig::on_snapshot_error`], nothing more.

use std::{future::Future, sync::Arc};

use serde_json::Value;

use crate::{
  Error, Result,
  associations,
  config::HistoryConfig,
  derive::{ARCHIVED_AT, SURROGATE_KEY, derive_history_schema},
  engine::{Engine, FindOptions},
  hooks::{BoxFuture, Hook, LifecycleEvent, MutationOptions},
  model::{EntityDefinition, Instance, Record, now_timestamp},
  registry::Registry,
};

// ─── Wiring ──────────────────────────────────────────────────────────────────

/// What a live-entity hook captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
  /// One row.
  Row,
  /// One row, marked deleted.
  RowDelete,
  /// Every row matching the bulk filter.
  Bulk,
  /// Every row matching the bulk filter, marked deleted.
  BulkDelete,
}

const FULL_WIRING: &[(LifecycleEvent, Capture)] = &[
  (LifecycleEvent::AfterCreate, Capture::Row),
  (LifecycleEvent::AfterUpdate, Capture::Row),
  (LifecycleEvent::AfterBulkUpdate, Capture::Bulk),
  (LifecycleEvent::AfterDestroy, Capture::RowDelete),
  (LifecycleEvent::AfterBulkDestroy, Capture::BulkDelete),
  (LifecycleEvent::AfterRestore, Capture::Row),
  (LifecycleEvent::BeforeBulkUpdate, Capture::Bulk),
  (LifecycleEvent::BeforeBulkDestroy, Capture::BulkDelete),
];

const PRE_WRITE_WIRING: &[(LifecycleEvent, Capture)] = &[
  (LifecycleEvent::BeforeUpdate, Capture::Row),
  (LifecycleEvent::BeforeDestroy, Capture::RowDelete),
  (LifecycleEvent::BeforeBulkUpdate, Capture::Bulk),
  (LifecycleEvent::BeforeBulkDestroy, Capture::BulkDelete),
];

/// The live-entity hooks attached for a given `full` setting.
pub fn live_wiring(full: bool) -> &'static [(LifecycleEvent, Capture)] {
  if full { FULL_WIRING } else { PRE_WRITE_WIRING }
}

/// History-entity events that reject the write.
pub const READ_ONLY_EVENTS: [LifecycleEvent; 5] = [
  LifecycleEvent::BeforeUpdate,
  LifecycleEvent::BeforeDestroy,
  LifecycleEvent::BeforeRestore,
  LifecycleEvent::BeforeBulkUpdate,
  LifecycleEvent::BeforeBulkDestroy,
];

// ─── Setup ───────────────────────────────────────────────────────────────────

/// Give `live` a history entity and instrument both.
///
/// Derives and defines the history entity, attaches the snapshot hooks to
/// `live`, and the read-only guards and relationship mirroring to the
/// history entity. Returns the instrumented live entity.
pub fn attach_history<'r, E: Engine>(
  registry: &'r mut Registry<E>,
  live: &str,
  config: HistoryConfig,
) -> Result<&'r EntityDefinition> {
  let live_def = registry.entity(live)?;
  let history = derive_history_schema(live_def, &config)?;
  let snapshotter = Arc::new(Snapshotter::new(live_def, &history.name, config));

  let history_name = history.name.clone();
  registry.define(history)?;

  for &(event, capture) in live_wiring(snapshotter.config.full) {
    registry.add_hook(live, event, Arc::clone(&snapshotter).hook(capture))?;
  }
  for event in READ_ONLY_EVENTS {
    registry.add_hook(&history_name, event, read_only(event))?;
  }
  registry.add_hook(
    &history_name,
    LifecycleEvent::BeforeSync,
    associations::mirror_hook(snapshotter.config.model_suffix.clone()),
  )?;

  tracing::info!(
    live,
    history = %history_name,
    full = snapshotter.config.full,
    blocking = snapshotter.config.blocking,
    "attached history"
  );
  registry.entity(live)
}

fn read_only<E: Engine>(event: LifecycleEvent) -> Hook<E> {
  if event.scope() == crate::hooks::HookScope::Bulk {
    Hook::bulk(|_, _| Box::pin(async { Err(Error::ReadOnly) }))
  } else {
    Hook::row(|_, _, _| Box::pin(async { Err(Error::ReadOnly) }))
  }
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// Builds and persists snapshot rows for one live/history pair.
struct Snapshotter {
  live:       String,
  history:    String,
  updated_at: String,
  deleted_at: String,
  config:     HistoryConfig,
}

impl Snapshotter {
  fn new(live: &EntityDefinition, history: &str, config: HistoryConfig) -> Self {
    Self {
      live: live.name.clone(),
      history: history.to_owned(),
      updated_at: live.options.updated_at.clone(),
      deleted_at: live.options.deleted_at.clone(),
      config,
    }
  }

  fn hook<E: Engine>(self: Arc<Self>, capture: Capture) -> Hook<E> {
    match capture {
      Capture::Row => self.row_hook(false),
      Capture::RowDelete => self.row_hook(true),
      Capture::Bulk => self.bulk_hook(false),
      Capture::BulkDelete => self.bulk_hook(true),
    }
  }

  fn row_hook<E: Engine>(self: Arc<Self>, delete: bool) -> Hook<E> {
    Hook::row(
      move |engine: &E, instance: &Instance, options: &mut MutationOptions<E::Transaction>| {
        if delete {
          options.delete_operation = true;
        }
        let payload = self.row_payload(instance, options.delete_operation);
        let transaction = self.scoped(&options.transaction);
        let engine = engine.clone();
        let this = Arc::clone(&self);
        self.dispatch(async move { this.persist(&engine, vec![payload], transaction).await })
      },
    )
  }

  /// The matching rows are read before the hook returns, in either mode, so
  /// a before-hook always sees the pre-write state. Only the history write
  /// may be detached.
  fn bulk_hook<E: Engine>(self: Arc<Self>, delete: bool) -> Hook<E> {
    Hook::bulk(move |engine: &E, options: &mut MutationOptions<E::Transaction>| {
      if delete {
        options.delete_operation = true;
      }
      // Per-row hooks already capture each row.
      if options.individual_hooks {
        return Box::pin(async { Ok(()) });
      }
      let query = FindOptions {
        filter:      options.filter.clone(),
        transaction: options.transaction.clone(),
        paranoid:    false,
      };
      let transaction = self.scoped(&options.transaction);
      let delete = options.delete_operation;
      let this = Arc::clone(&self);
      Box::pin(async move {
        let rows = match engine.find_all(&this.live, query).await {
          Ok(rows) => this.bulk_payload(rows, delete, &now_timestamp()),
          Err(err) => return this.settle(Error::snapshot_write(err)),
        };
        if rows.is_empty() {
          return Ok(());
        }
        let engine = engine.clone();
        let writer = Arc::clone(&this);
        this
          .dispatch(async move { writer.persist(&engine, rows, transaction).await })
          .await
      })
    })
  }

  /// Pre-write values unless in full mode or there are none.
  fn row_payload(&self, instance: &Instance, delete: bool) -> Record {
    let source = match &instance.previous {
      Some(previous) if !self.config.full => previous,
      _ => &instance.values,
    };
    let mut payload = source.clone();
    payload.remove(SURROGATE_KEY);
    if delete {
      payload.insert(self.config.deleted_column_name.clone(), Value::Bool(true));
    }
    payload
  }

  /// Stamp re-queried rows with their own update (or deletion) time.
  fn bulk_payload(&self, rows: Vec<Record>, delete: bool, captured_at: &str) -> Vec<Record> {
    rows
      .into_iter()
      .map(|mut row| {
        let stamp_field = if delete { &self.deleted_at } else { &self.updated_at };
        let archived_at = match row.get(stamp_field) {
          Some(Value::String(at)) => at.clone(),
          _ => captured_at.to_owned(),
        };
        row.remove(SURROGATE_KEY);
        row.insert(ARCHIVED_AT.to_owned(), Value::String(archived_at));
        if delete {
          row.insert(self.config.deleted_column_name.clone(), Value::Bool(true));
        }
        row
      })
      .collect()
  }

  fn scoped<T: Clone>(&self, transaction: &Option<T>) -> Option<T> {
    if self.config.allow_transactions { transaction.clone() } else { None }
  }

  async fn persist<E: Engine>(
    &self,
    engine: &E,
    rows: Vec<Record>,
    transaction: Option<E::Transaction>,
  ) -> Result<()> {
    let count = engine
      .create_many(&self.history, rows, transaction)
      .await
      .map_err(Error::snapshot_write)?;
    tracing::debug!(history = %self.history, rows = count, "wrote snapshot");
    Ok(())
  }

  /// Await `write` in blocking mode; otherwise detach it and report any
  /// failure out of band.
  fn dispatch<'a, F>(self: &Arc<Self>, write: F) -> BoxFuture<'a, Result<()>>
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    if self.config.blocking {
      return Box::pin(write);
    }
    let this = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(err) = write.await {
        this.report(&err);
      }
    });
    Box::pin(async { Ok(()) })
  }

  /// A failure before the write is dispatched: returned in blocking mode,
  /// reported out of band otherwise.
  fn settle(&self, err: Error) -> Result<()> {
    if self.config.blocking {
      return Err(err);
    }
    self.report(&err);
    Ok(())
  }

  fn report(&self, err: &Error) {
    tracing::warn!(
      live = %self.live,
      history = %self.history,
      error = %err,
      "dropped snapshot write failure"
    );
    if let Some(handler) = &self.config.on_snapshot_error {
      handler(err);
    }
  }
}
