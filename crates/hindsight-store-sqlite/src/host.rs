//! [`SqliteHost`]: the SQLite data engine that owns the entity registry and
//! runs the lifecycle pipeline around every write.
//!
//! All access goes through one [`tokio_rusqlite::Connection`]. Writes made
//! outside a [`Transaction`] take the write gate for the duration of one
//! statement (or one batch); a transaction holds it from begin to end.
//! An [`Engine::create_many`] batch outside any transaction, issued while
//! one is open, is deferred until that transaction ends instead of waiting
//! on the gate.

use std::{
  path::Path,
  sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
  time::Duration,
};

use hindsight_core::{
  Engine, HistoryConfig, Registry,
  engine::FindOptions,
  hooks::{Hook, LifecycleEvent, MutationOptions},
  model::{DefaultValue, EntityDefinition, Instance, Record, Relationship, now_timestamp},
  query::Filter,
};
use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{RawRow, check_filter, encode_value, quote, render_filter},
  schema::{self, PRAGMAS, TableNames},
  transaction::{Deferred, Transaction, WeakTransaction},
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Options for a single-row write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
  pub transaction: Option<Transaction>,
  /// Hard delete even on a paranoid entity.
  pub force:       bool,
}

impl WriteOptions {
  pub fn in_transaction(mut self, transaction: &Transaction) -> Self {
    self.transaction = Some(transaction.clone());
    self
  }

  pub fn force(mut self) -> Self {
    self.force = true;
    self
  }
}

/// Options for a filter-scoped bulk write.
#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
  pub filter:           Filter,
  pub transaction:      Option<Transaction>,
  /// Also fire per-row hooks for every matched row.
  pub individual_hooks: bool,
  pub force:            bool,
}

impl BulkOptions {
  pub fn new(filter: Filter) -> Self { Self { filter, ..Self::default() } }

  pub fn in_transaction(mut self, transaction: &Transaction) -> Self {
    self.transaction = Some(transaction.clone());
    self
  }

  pub fn individual_hooks(mut self) -> Self {
    self.individual_hooks = true;
    self
  }

  pub fn force(mut self) -> Self {
    self.force = true;
    self
  }
}

// ─── Host ────────────────────────────────────────────────────────────────────

/// A SQLite-backed host for live and history entities.
///
/// Cloning is cheap; clones share the connection, the registry and the
/// write gate.
#[derive(Clone)]
pub struct SqliteHost {
  pub(crate) conn: tokio_rusqlite::Connection,
  registry:        Arc<RwLock<Registry<SqliteHost>>>,
  gate:            Arc<Mutex<()>>,
  open:            Arc<std::sync::Mutex<WeakTransaction>>,
  busy_timeout:    Duration,
}

impl std::fmt::Debug for SqliteHost {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqliteHost")
      .field("registry", &*self.registry())
      .field("busy_timeout", &self.busy_timeout)
      .finish_non_exhaustive()
  }
}

impl SqliteHost {
  /// Open (or create) a database at `path`.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory database, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        Ok(())
      })
      .await?;
    Ok(Self {
      conn,
      registry: Arc::new(RwLock::new(Registry::new())),
      gate: Arc::new(Mutex::new(())),
      open: Arc::default(),
      busy_timeout: DEFAULT_BUSY_TIMEOUT,
    })
  }

  /// How long a write waits for an open transaction to finish before
  /// failing with [`Error::Busy`].
  pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
    self.busy_timeout = timeout;
    self
  }

  fn registry(&self) -> RwLockReadGuard<'_, Registry<SqliteHost>> {
    self.registry.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry<SqliteHost>> {
    self.registry.write().unwrap_or_else(PoisonError::into_inner)
  }

  // ── Setup ───────────────────────────────────────────────────────────────

  /// Define a new entity. Returns the normalised definition.
  pub fn define(&self, definition: EntityDefinition) -> Result<EntityDefinition> {
    let defined = self.registry_mut().define(definition)?.clone();
    Ok(defined)
  }

  /// Declare a relationship from `entity`. Returns `false` for a repeat.
  pub fn associate(&self, entity: &str, relationship: Relationship) -> Result<bool> {
    let added = self.registry_mut().associate(entity, relationship)?;
    Ok(added)
  }

  /// Give `live` a history entity. Call before [`SqliteHost::sync`].
  pub fn attach_history(&self, live: &str, config: HistoryConfig) -> Result<EntityDefinition> {
    let mut registry = self.registry_mut();
    let live = hindsight_core::attach_history(&mut *registry, live, config)?.clone();
    Ok(live)
  }

  /// Attach an application hook.
  pub fn add_hook(&self, entity: &str, event: LifecycleEvent, hook: Hook<SqliteHost>) -> Result<()> {
    self.registry_mut().add_hook(entity, event, hook)?;
    Ok(())
  }

  pub fn entity(&self, name: &str) -> Result<EntityDefinition> {
    let def = self.registry().entity(name)?.clone();
    Ok(def)
  }

  /// Names of every defined entity, in definition order.
  pub fn entity_names(&self) -> Vec<String> {
    self.registry().names().map(str::to_owned).collect()
  }

  /// Materialise every entity, in definition order, firing the before- and
  /// after-sync hooks around each.
  pub async fn sync(&self) -> Result<()> {
    for name in self.entity_names() {
      let batch = {
        let mut registry = self.registry_mut();
        registry
          .run_sync_hooks(&name, LifecycleEvent::BeforeSync)
          .map_err(Error::Hook)?;
        let tables: TableNames = registry
          .names()
          .filter_map(|n| registry.get(n))
          .map(|d| (d.name.clone(), d.table().to_owned()))
          .collect();
        schema::statements(registry.entity(&name)?, &tables)
      };
      self.write(None, move |conn| conn.execute_batch(&batch)).await?;
      tracing::debug!(entity = %name, "synced");
      self
        .registry_mut()
        .run_sync_hooks(&name, LifecycleEvent::AfterSync)
        .map_err(Error::Hook)?;
    }
    Ok(())
  }

  // ── Transactions ────────────────────────────────────────────────────────

  async fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
    tokio::time::timeout(self.busy_timeout, self.gate.lock())
      .await
      .map_err(|_| Error::Busy)
  }

  /// Open a transaction. Writes outside it wait until it finishes.
  pub async fn begin(&self) -> Result<Transaction> {
    let gate = tokio::time::timeout(self.busy_timeout, Arc::clone(&self.gate).lock_owned())
      .await
      .map_err(|_| Error::Busy)?;
    let transaction = Transaction::begin(self.conn.clone(), gate).await?;
    *self.open.lock().unwrap_or_else(PoisonError::into_inner) = transaction.downgrade();
    Ok(transaction)
  }

  /// The transaction currently holding the write gate, if any.
  fn open_transaction(&self) -> Option<Transaction> {
    let open = self.open.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
    open.filter(Transaction::is_active)
  }

  /// Run `f` on the connection as a write: inside `transaction` when given,
  /// otherwise under the write gate.
  async fn write<F, R>(&self, transaction: Option<&Transaction>, f: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let _gate = match transaction {
      Some(tx) => {
        tx.ensure_active()?;
        None
      }
      None => Some(self.acquire().await?),
    };
    Ok(self.conn.call(move |conn| Ok(f(conn)?)).await?)
  }

  // ── Hooks ───────────────────────────────────────────────────────────────

  async fn run_row_hooks(
    &self,
    entity: &str,
    event: LifecycleEvent,
    instance: &Instance,
    options: &mut MutationOptions<Transaction>,
  ) -> Result<()> {
    let hooks = self.registry().row_hooks(entity, event);
    for hook in hooks {
      hook(self, instance, options).await.map_err(Error::Hook)?;
    }
    Ok(())
  }

  async fn run_bulk_hooks(
    &self,
    entity: &str,
    event: LifecycleEvent,
    options: &mut MutationOptions<Transaction>,
  ) -> Result<()> {
    let hooks = self.registry().bulk_hooks(entity, event);
    for hook in hooks {
      hook(self, options).await.map_err(Error::Hook)?;
    }
    Ok(())
  }

  // ── Single-row writes ───────────────────────────────────────────────────

  /// Insert one row. Defaults and timestamps are filled in; the returned
  /// instance carries the generated key.
  pub async fn create(&self, entity: &str, values: Record, options: WriteOptions) -> Result<Instance> {
    let def = self.entity(entity)?;
    let mut instance = Instance::new(values);
    if def.options.timestamps {
      let now = Value::String(now_timestamp());
      instance
        .values
        .entry(def.options.created_at.clone())
        .or_insert_with(|| now.clone());
      instance.values.insert(def.options.updated_at.clone(), now);
    }

    let tx = options.transaction.as_ref();
    let mut mutation = mutation_options(entity, Filter::All, tx);
    self
      .run_row_hooks(entity, LifecycleEvent::BeforeCreate, &instance, &mut mutation)
      .await?;
    instance.values = self.insert(&def, instance.values, tx).await?;
    self
      .run_row_hooks(entity, LifecycleEvent::AfterCreate, &instance, &mut mutation)
      .await?;

    tracing::debug!(entity, "created row");
    Ok(Instance::loaded(instance.values))
  }

  /// Apply `changes` to a persisted row.
  pub async fn update(
    &self,
    entity: &str,
    instance: &mut Instance,
    changes: Record,
    options: WriteOptions,
  ) -> Result<()> {
    let def = self.entity(entity)?;
    let stored = instance.previous.get_or_insert_with(|| instance.values.clone()).clone();
    let key = key_filter(&def, &stored)?;
    check_fields(&def, changes.keys())?;

    instance.values.extend(changes);
    if def.options.timestamps {
      instance
        .values
        .insert(def.options.updated_at.clone(), Value::String(now_timestamp()));
    }

    let tx = options.transaction.as_ref();
    let mut mutation = mutation_options(entity, key.clone(), tx);
    self
      .run_row_hooks(entity, LifecycleEvent::BeforeUpdate, instance, &mut mutation)
      .await?;

    let assignments: Record = instance
      .changed()
      .into_iter()
      .filter(|field| def.attribute(field).is_some())
      .filter_map(|field| instance.get(field).map(|v| (field.to_owned(), v.clone())))
      .collect();
    if !assignments.is_empty() {
      let (sql, params) = update_sql(&def, &assignments, &key)?;
      self
        .write(tx, move |conn| conn.execute(&sql, params_from_iter(params)))
        .await?;
    }

    self
      .run_row_hooks(entity, LifecycleEvent::AfterUpdate, instance, &mut mutation)
      .await?;
    instance.previous = Some(instance.values.clone());
    tracing::debug!(entity, fields = assignments.len(), "updated row");
    Ok(())
  }

  /// Delete a persisted row. On a paranoid entity this sets the deleted-at
  /// field instead, unless `options.force`.
  pub async fn destroy(&self, entity: &str, instance: &mut Instance, options: WriteOptions) -> Result<()> {
    let def = self.entity(entity)?;
    let stored = instance.previous.get_or_insert_with(|| instance.values.clone()).clone();
    let key = key_filter(&def, &stored)?;

    let tx = options.transaction.as_ref();
    let mut mutation = mutation_options(entity, key.clone(), tx);
    mutation.force = options.force;
    self
      .run_row_hooks(entity, LifecycleEvent::BeforeDestroy, instance, &mut mutation)
      .await?;

    let soft = def.options.is_paranoid() && !options.force;
    if soft {
      let now = Value::String(now_timestamp());
      let changes = Record::from([(def.options.deleted_at.clone(), now.clone())]);
      let (sql, params) = update_sql(&def, &changes, &key)?;
      self
        .write(tx, move |conn| conn.execute(&sql, params_from_iter(params)))
        .await?;
      instance.values.insert(def.options.deleted_at.clone(), now);
    } else {
      let (sql, params) = delete_sql(&def, &key)?;
      self
        .write(tx, move |conn| conn.execute(&sql, params_from_iter(params)))
        .await?;
    }

    self
      .run_row_hooks(entity, LifecycleEvent::AfterDestroy, instance, &mut mutation)
      .await?;
    instance.previous = Some(instance.values.clone());
    tracing::debug!(entity, soft, "destroyed row");
    Ok(())
  }

  /// Clear the deleted-at field of a soft-deleted row.
  pub async fn restore(&self, entity: &str, instance: &mut Instance, options: WriteOptions) -> Result<()> {
    let def = self.entity(entity)?;
    if !def.options.is_paranoid() {
      return Err(Error::NotParanoid(def.name));
    }
    let stored = instance.previous.get_or_insert_with(|| instance.values.clone()).clone();
    let key = key_filter(&def, &stored)?;

    let tx = options.transaction.as_ref();
    let mut mutation = mutation_options(entity, key.clone(), tx);
    self
      .run_row_hooks(entity, LifecycleEvent::BeforeRestore, instance, &mut mutation)
      .await?;

    let changes = Record::from([(def.options.deleted_at.clone(), Value::Null)]);
    let (sql, params) = update_sql(&def, &changes, &key)?;
    self
      .write(tx, move |conn| conn.execute(&sql, params_from_iter(params)))
      .await?;
    instance.values.insert(def.options.deleted_at.clone(), Value::Null);

    self
      .run_row_hooks(entity, LifecycleEvent::AfterRestore, instance, &mut mutation)
      .await?;
    instance.previous = Some(instance.values.clone());
    tracing::debug!(entity, "restored row");
    Ok(())
  }

  // ── Bulk writes ─────────────────────────────────────────────────────────

  /// Apply `changes` to every visible row matching `options.filter`.
  /// Returns the number of rows changed.
  pub async fn bulk_update(&self, entity: &str, changes: Record, options: BulkOptions) -> Result<usize> {
    let def = self.entity(entity)?;
    check_filter(&def, &options.filter)?;
    check_fields(&def, changes.keys())?;
    let mut changes = changes;
    if def.options.timestamps {
      changes.insert(def.options.updated_at.clone(), Value::String(now_timestamp()));
    }

    let mut mutation = mutation_options(entity, options.filter, options.transaction.as_ref());
    mutation.individual_hooks = options.individual_hooks;
    mutation.force = options.force;
    self
      .run_bulk_hooks(entity, LifecycleEvent::BeforeBulkUpdate, &mut mutation)
      .await?;

    let tx = mutation.transaction.clone();
    let mut instances = Vec::new();
    if mutation.individual_hooks {
      for row in self.select(&def, &mutation.filter, true, tx.as_ref()).await? {
        let mut instance = Instance::loaded(row);
        instance.values.extend(changes.clone());
        self
          .run_row_hooks(entity, LifecycleEvent::BeforeUpdate, &instance, &mut mutation)
          .await?;
        instances.push(instance);
      }
    }

    let filter = visible(&def, &mutation.filter, true);
    let count = if changes.is_empty() {
      0
    } else {
      let (sql, params) = update_sql(&def, &changes, &filter)?;
      self
        .write(tx.as_ref(), move |conn| conn.execute(&sql, params_from_iter(params)))
        .await?
    };

    for instance in &instances {
      self
        .run_row_hooks(entity, LifecycleEvent::AfterUpdate, instance, &mut mutation)
        .await?;
    }
    self
      .run_bulk_hooks(entity, LifecycleEvent::AfterBulkUpdate, &mut mutation)
      .await?;
    tracing::debug!(entity, rows = count, "bulk updated");
    Ok(count)
  }

  /// Delete every visible row matching `options.filter`; soft delete on a
  /// paranoid entity unless `options.force`. Returns the number of rows.
  pub async fn bulk_destroy(&self, entity: &str, options: BulkOptions) -> Result<usize> {
    let def = self.entity(entity)?;
    check_filter(&def, &options.filter)?;

    let mut mutation = mutation_options(entity, options.filter, options.transaction.as_ref());
    mutation.individual_hooks = options.individual_hooks;
    mutation.force = options.force;
    self
      .run_bulk_hooks(entity, LifecycleEvent::BeforeBulkDestroy, &mut mutation)
      .await?;

    let tx = mutation.transaction.clone();
    let mut instances = Vec::new();
    if mutation.individual_hooks {
      for row in self.select(&def, &mutation.filter, true, tx.as_ref()).await? {
        let instance = Instance::loaded(row);
        self
          .run_row_hooks(entity, LifecycleEvent::BeforeDestroy, &instance, &mut mutation)
          .await?;
        instances.push(instance);
      }
    }

    let filter = visible(&def, &mutation.filter, true);
    let soft = def.options.is_paranoid() && !mutation.force;
    let now = Value::String(now_timestamp());
    let (sql, params) = if soft {
      let changes = Record::from([(def.options.deleted_at.clone(), now.clone())]);
      update_sql(&def, &changes, &filter)?
    } else {
      delete_sql(&def, &filter)?
    };
    let count = self
      .write(tx.as_ref(), move |conn| conn.execute(&sql, params_from_iter(params)))
      .await?;

    for instance in &mut instances {
      if soft {
        instance.values.insert(def.options.deleted_at.clone(), now.clone());
      }
      self
        .run_row_hooks(entity, LifecycleEvent::AfterDestroy, instance, &mut mutation)
        .await?;
    }
    self
      .run_bulk_hooks(entity, LifecycleEvent::AfterBulkDestroy, &mut mutation)
      .await?;
    tracing::debug!(entity, rows = count, soft, "bulk destroyed");
    Ok(count)
  }

  // ── Reads ───────────────────────────────────────────────────────────────

  /// Every row matching `options.filter`, oldest first. Soft-deleted rows
  /// are skipped unless `options.paranoid` is off.
  pub async fn find_all(&self, entity: &str, options: FindOptions<Transaction>) -> Result<Vec<Instance>> {
    let def = self.entity(entity)?;
    let rows = self
      .select(&def, &options.filter, options.paranoid, options.transaction.as_ref())
      .await?;
    Ok(rows.into_iter().map(Instance::loaded).collect())
  }

  /// The visible row whose primary key is `key`.
  pub async fn find_by_pk(&self, entity: &str, key: impl Into<Value>) -> Result<Option<Instance>> {
    let def = self.entity(entity)?;
    let field = def.primary_key_field().ok_or_else(|| {
      hindsight_core::Error::InvalidDefinition(format!("{} has no primary key", def.name))
    })?;
    let filter = Filter::eq(field, key);
    let mut rows = self.select(&def, &filter, true, None).await?;
    Ok(rows.pop().map(Instance::loaded))
  }

  async fn select(
    &self,
    def: &EntityDefinition,
    filter: &Filter,
    paranoid: bool,
    transaction: Option<&Transaction>,
  ) -> Result<Vec<Record>> {
    check_filter(def, filter)?;
    if let Some(tx) = transaction {
      tx.ensure_active()?;
    }
    let (sql, params) = select_sql(def, &visible(def, filter, paranoid))?;
    let width = def.attributes.len();
    let raw = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params_from_iter(params), |row| {
            (0..width)
              .map(|i| row.get::<_, SqlValue>(i))
              .collect::<rusqlite::Result<Vec<_>>>()
              .map(RawRow)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raw.into_iter().map(|row| row.into_record(def)).collect()
  }

  async fn insert(
    &self,
    def: &EntityDefinition,
    mut record: Record,
    transaction: Option<&Transaction>,
  ) -> Result<Record> {
    let (sql, params) = insert_sql(def, &mut record, &now_timestamp())?;
    let rowid = self
      .write(transaction, move |conn| {
        conn.execute(&sql, params_from_iter(params))?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    if let Some(key) = generated_key(def) {
      let slot = record.entry(key.to_owned()).or_insert(Value::Null);
      if slot.is_null() {
        *slot = Value::from(rowid);
      }
    }
    for attr in &def.attributes {
      record.entry(attr.name.clone()).or_insert(Value::Null);
    }
    Ok(record)
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

impl Engine for SqliteHost {
  type Transaction = Transaction;
  type Error = Error;

  async fn create_many(
    &self,
    entity: &str,
    rows: Vec<Record>,
    transaction: Option<Transaction>,
  ) -> Result<usize> {
    let def = self.entity(entity)?;
    let now = now_timestamp();
    let statements = rows
      .into_iter()
      .map(|mut row| insert_sql(&def, &mut row, &now))
      .collect::<Result<Vec<_>>>()?;
    let count = statements.len();
    if count == 0 {
      return Ok(0);
    }

    let insert: Deferred = Box::new(move |conn| {
      let batch = conn.savepoint()?;
      for (sql, params) in statements {
        batch.execute(&sql, params_from_iter(params))?;
      }
      batch.commit()
    });

    let insert = match (&transaction, self.open_transaction()) {
      (None, Some(open)) => match open.defer(insert) {
        Ok(()) => {
          tracing::debug!(entity, rows = count, transaction = %open.id(), "deferred batch");
          return Ok(count);
        }
        Err(insert) => insert,
      },
      _ => insert,
    };
    self.write(transaction.as_ref(), insert).await?;
    tracing::debug!(entity, rows = count, "inserted batch");
    Ok(count)
  }

  async fn find_all(&self, entity: &str, options: FindOptions<Transaction>) -> Result<Vec<Record>> {
    let def = self.entity(entity)?;
    self
      .select(&def, &options.filter, options.paranoid, options.transaction.as_ref())
      .await
  }
}

// ─── Statements ──────────────────────────────────────────────────────────────

type Statement = (String, Vec<SqlValue>);

fn mutation_options(
  entity: &str,
  filter: Filter,
  transaction: Option<&Transaction>,
) -> MutationOptions<Transaction> {
  let mut options = MutationOptions::new(entity);
  options.filter = filter;
  options.transaction = transaction.cloned();
  options
}

fn check_fields<'a>(def: &EntityDefinition, fields: impl IntoIterator<Item = &'a String>) -> Result<()> {
  for field in fields {
    if def.attribute(field).is_none() {
      return Err(Error::UnknownField { entity: def.name.clone(), field: field.clone() });
    }
  }
  Ok(())
}

/// Matches exactly the stored row with these key values.
fn key_filter(def: &EntityDefinition, stored: &Record) -> Result<Filter> {
  def.primary_keys().try_fold(Filter::All, |filter, key| match stored.get(&key.name) {
    Some(value) if !value.is_null() => Ok(filter.and(Filter::eq(key.name.clone(), value.clone()))),
    _ => Err(Error::MissingPrimaryKey { entity: def.name.clone(), field: key.name.clone() }),
  })
}

/// `filter`, narrowed to rows that are not soft-deleted when `paranoid`.
fn visible(def: &EntityDefinition, filter: &Filter, paranoid: bool) -> Filter {
  if paranoid && def.options.is_paranoid() {
    filter.clone().and(Filter::is_null(def.options.deleted_at.clone()))
  } else {
    filter.clone()
  }
}

/// The single integer key SQLite assigns when left unset.
fn generated_key(def: &EntityDefinition) -> Option<&str> {
  let mut keys = def.primary_keys();
  match (keys.next(), keys.next()) {
    (Some(key), None) if key.auto_increment => Some(key.name.as_str()),
    _ => None,
  }
}

fn select_sql(def: &EntityDefinition, filter: &Filter) -> Result<Statement> {
  let mut params = Vec::new();
  let predicate = render_filter(def, filter, &mut params)?;
  let columns = def
    .attributes
    .iter()
    .map(|a| quote(&a.name))
    .collect::<Vec<_>>()
    .join(", ");
  let sql = format!(
    "SELECT {columns} FROM {} WHERE {predicate} ORDER BY rowid",
    quote(def.table())
  );
  Ok((sql, params))
}

fn update_sql(def: &EntityDefinition, changes: &Record, filter: &Filter) -> Result<Statement> {
  let mut params = Vec::new();
  let mut assignments = Vec::new();
  for (field, value) in changes {
    let attr = def.attribute(field).ok_or_else(|| Error::UnknownField {
      entity: def.name.clone(),
      field:  field.clone(),
    })?;
    assignments.push(format!("{} = ?", quote(field)));
    params.push(encode_value(attr, value)?);
  }
  let predicate = render_filter(def, filter, &mut params)?;
  let sql = format!(
    "UPDATE {} SET {} WHERE {predicate}",
    quote(def.table()),
    assignments.join(", ")
  );
  Ok((sql, params))
}

fn delete_sql(def: &EntityDefinition, filter: &Filter) -> Result<Statement> {
  let mut params = Vec::new();
  let predicate = render_filter(def, filter, &mut params)?;
  Ok((format!("DELETE FROM {} WHERE {predicate}", quote(def.table())), params))
}

/// Fill attribute defaults into `record` and build its `INSERT`. Fields
/// that are not attributes are ignored.
fn insert_sql(def: &EntityDefinition, record: &mut Record, now: &str) -> Result<Statement> {
  for attr in &def.attributes {
    if record.contains_key(&attr.name) {
      continue;
    }
    let value = match &attr.default {
      Some(DefaultValue::Value(value)) => value.clone(),
      Some(DefaultValue::Now) => Value::String(now.to_owned()),
      Some(DefaultValue::UuidV4) => Value::String(Uuid::new_v4().to_string()),
      None => continue,
    };
    record.insert(attr.name.clone(), value);
  }

  let generated = generated_key(def);
  let mut columns = Vec::new();
  let mut params = Vec::new();
  for attr in &def.attributes {
    let Some(value) = record.get(&attr.name) else { continue };
    if value.is_null() && generated == Some(attr.name.as_str()) {
      continue;
    }
    columns.push(quote(&attr.name));
    params.push(encode_value(attr, value)?);
  }

  let table = quote(def.table());
  let sql = if columns.is_empty() {
    format!("INSERT INTO {table} DEFAULT VALUES")
  } else {
    format!(
      "INSERT INTO {table} ({}) VALUES ({})",
      columns.join(", "),
      vec!["?"; columns.len()].join(", ")
    )
  };
  Ok((sql, params))
}
