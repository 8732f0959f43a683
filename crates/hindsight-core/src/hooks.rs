//! Lifecycle events and the per-entity hook table.
//!
//! Hooks are keyed by a closed set of [`LifecycleEvent`] variants. Each event
//! has a fixed [`HookScope`] deciding which handler shape it accepts, so a
//! wiring mistake is rejected when the hook is attached rather than when it
//! first fires.

use std::{collections::BTreeMap, fmt, future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::{
  Error, Result,
  engine::Engine,
  model::Instance,
  query::Filter,
  registry::Registry,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumIter,
  IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum LifecycleEvent {
  BeforeCreate,
  AfterCreate,
  BeforeUpdate,
  AfterUpdate,
  BeforeDestroy,
  AfterDestroy,
  BeforeRestore,
  AfterRestore,
  BeforeBulkUpdate,
  AfterBulkUpdate,
  BeforeBulkDestroy,
  AfterBulkDestroy,
  BeforeSync,
  AfterSync,
}

/// The handler shape an event accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
  /// One affected row.
  Row,
  /// A filtered set of rows.
  Bulk,
  /// Schema materialisation.
  Sync,
}

impl LifecycleEvent {
  pub const fn scope(self) -> HookScope {
    match self {
      Self::BeforeCreate
      | Self::AfterCreate
      | Self::BeforeUpdate
      | Self::AfterUpdate
      | Self::BeforeDestroy
      | Self::AfterDestroy
      | Self::BeforeRestore
      | Self::AfterRestore => HookScope::Row,
      Self::BeforeBulkUpdate
      | Self::AfterBulkUpdate
      | Self::BeforeBulkDestroy
      | Self::AfterBulkDestroy => HookScope::Bulk,
      Self::BeforeSync | Self::AfterSync => HookScope::Sync,
    }
  }

  pub const fn is_before(self) -> bool {
    matches!(
      self,
      Self::BeforeCreate
        | Self::BeforeUpdate
        | Self::BeforeDestroy
        | Self::BeforeRestore
        | Self::BeforeBulkUpdate
        | Self::BeforeBulkDestroy
        | Self::BeforeSync
    )
  }
}

// ─── Mutation event ──────────────────────────────────────────────────────────

/// The ambient context of one write in progress, supplied by the host.
///
/// Hooks treat it as read-only except for `delete_operation`, which snapshot
/// hooks set so a shared handler can tell a delete from an update.
#[derive(Debug, Clone)]
pub struct MutationOptions<T> {
  pub entity:           String,
  pub filter:           Filter,
  pub transaction:      Option<T>,
  /// A bulk write also fires per-row hooks for each affected row.
  pub individual_hooks: bool,
  pub delete_operation: bool,
  /// Hard delete even on a paranoid entity.
  pub force:            bool,
}

impl<T> MutationOptions<T> {
  pub fn new(entity: impl Into<String>) -> Self {
    Self {
      entity:           entity.into(),
      filter:           Filter::All,
      transaction:      None,
      individual_hooks: false,
      delete_operation: false,
      force:            false,
    }
  }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

type Transaction<E> = <E as Engine>::Transaction;

pub type RowHook<E> = Arc<
  dyn for<'a> Fn(
      &'a E,
      &'a Instance,
      &'a mut MutationOptions<Transaction<E>>,
    ) -> BoxFuture<'a, Result<()>>
    + Send
    + Sync,
>;

pub type BulkHook<E> = Arc<
  dyn for<'a> Fn(&'a E, &'a mut MutationOptions<Transaction<E>>) -> BoxFuture<'a, Result<()>>
    + Send
    + Sync,
>;

/// Runs synchronously with the registry, before or after an entity's
/// schema is materialised. Receives the name of the entity being synced.
pub type SyncHook<E> = Arc<dyn Fn(&mut Registry<E>, &str) -> Result<()> + Send + Sync>;

pub enum Hook<E: Engine> {
  Row(RowHook<E>),
  Bulk(BulkHook<E>),
  Sync(SyncHook<E>),
}

impl<E: Engine> Hook<E> {
  pub fn row<F>(f: F) -> Self
  where
    F: for<'a> Fn(
        &'a E,
        &'a Instance,
        &'a mut MutationOptions<Transaction<E>>,
      ) -> BoxFuture<'a, Result<()>>
      + Send
      + Sync
      + 'static,
  {
    Self::Row(Arc::new(f))
  }

  pub fn bulk<F>(f: F) -> Self
  where
    F: for<'a> Fn(&'a E, &'a mut MutationOptions<Transaction<E>>) -> BoxFuture<'a, Result<()>>
      + Send
      + Sync
      + 'static,
  {
    Self::Bulk(Arc::new(f))
  }

  pub fn sync<F>(f: F) -> Self
  where
    F: Fn(&mut Registry<E>, &str) -> Result<()> + Send + Sync + 'static,
  {
    Self::Sync(Arc::new(f))
  }

  pub fn scope(&self) -> HookScope {
    match self {
      Self::Row(_) => HookScope::Row,
      Self::Bulk(_) => HookScope::Bulk,
      Self::Sync(_) => HookScope::Sync,
    }
  }
}

impl<E: Engine> Clone for Hook<E> {
  fn clone(&self) -> Self {
    match self {
      Self::Row(h) => Self::Row(Arc::clone(h)),
      Self::Bulk(h) => Self::Bulk(Arc::clone(h)),
      Self::Sync(h) => Self::Sync(Arc::clone(h)),
    }
  }
}

impl<E: Engine> fmt::Debug for Hook<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Hook::{:?}", self.scope())
  }
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// Handlers attached to one entity, in attachment order per event.
pub struct HookTable<E: Engine> {
  hooks: BTreeMap<LifecycleEvent, Vec<Hook<E>>>,
}

impl<E: Engine> Default for HookTable<E> {
  fn default() -> Self { Self { hooks: BTreeMap::new() } }
}

impl<E: Engine> Clone for HookTable<E> {
  fn clone(&self) -> Self { Self { hooks: self.hooks.clone() } }
}

impl<E: Engine> fmt::Debug for HookTable<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map()
      .entries(self.hooks.iter().map(|(event, hooks)| (event, hooks.len())))
      .finish()
  }
}

impl<E: Engine> HookTable<E> {
  pub fn new() -> Self { Self::default() }

  /// Attach `hook` to `event`. The hook's shape must match the event scope.
  pub fn add(&mut self, event: LifecycleEvent, hook: Hook<E>) -> Result<()> {
    if hook.scope() != event.scope() {
      return Err(Error::HookScope {
        event,
        expected: event.scope(),
        found: hook.scope(),
      });
    }
    self.hooks.entry(event).or_default().push(hook);
    Ok(())
  }

  pub fn get(&self, event: LifecycleEvent) -> &[Hook<E>] {
    self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn count(&self, event: LifecycleEvent) -> usize { self.get(event).len() }

  /// Events with at least one hook, in event order.
  pub fn events(&self) -> impl Iterator<Item = LifecycleEvent> + '_ {
    self
      .hooks
      .iter()
      .filter(|(_, hooks)| !hooks.is_empty())
      .map(|(event, _)| *event)
  }

  pub fn row_hooks(&self, event: LifecycleEvent) -> Vec<RowHook<E>> {
    self
      .get(event)
      .iter()
      .filter_map(|h| match h {
        Hook::Row(h) => Some(Arc::clone(h)),
        _ => None,
      })
      .collect()
  }

  pub fn bulk_hooks(&self, event: LifecycleEvent) -> Vec<BulkHook<E>> {
    self
      .get(event)
      .iter()
      .filter_map(|h| match h {
        Hook::Bulk(h) => Some(Arc::clone(h)),
        _ => None,
      })
      .collect()
  }

  pub fn sync_hooks(&self, event: LifecycleEvent) -> Vec<SyncHook<E>> {
    self
      .get(event)
      .iter()
      .filter_map(|h| match h {
        Hook::Sync(h) => Some(Arc::clone(h)),
        _ => None,
      })
      .collect()
  }
}
