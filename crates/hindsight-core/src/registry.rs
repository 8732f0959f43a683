//! The entity registry: every defined entity and the hooks attached to it.
//!
//! The host owns the registry. This crate only inserts into it: the history
//! entity at setup, hooks on both entities, and mirrored relationships at
//! sync time.

use std::collections::BTreeMap;

use crate::{
  Error, Result,
  engine::Engine,
  hooks::{BulkHook, Hook, HookTable, LifecycleEvent, RowHook},
  model::{
    Attribute, DataType, EntityDefinition, ReferentialAction, References, Relationship,
    RelationshipKind, default_foreign_key,
  },
};

pub struct Registry<E: Engine> {
  /// Definition order; sync walks entities in this order.
  order:    Vec<String>,
  entities: BTreeMap<String, EntityDefinition>,
  hooks:    BTreeMap<String, HookTable<E>>,
}

impl<E: Engine> Default for Registry<E> {
  fn default() -> Self {
    Self { order: Vec::new(), entities: BTreeMap::new(), hooks: BTreeMap::new() }
  }
}

impl<E: Engine> std::fmt::Debug for Registry<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Registry")
      .field("entities", &self.order)
      .field("hooks", &self.hooks)
      .finish()
  }
}

impl<E: Engine> Registry<E> {
  pub fn new() -> Self { Self::default() }

  // ── Definitions ─────────────────────────────────────────────────────────

  /// Normalise, validate and add a new entity.
  pub fn define(&mut self, definition: EntityDefinition) -> Result<&EntityDefinition> {
    if self.entities.contains_key(&definition.name) {
      return Err(Error::AlreadyDefined(definition.name));
    }
    let definition = definition.normalized()?;
    let name = definition.name.clone();
    tracing::debug!(entity = %name, attributes = definition.attributes.len(), "defined entity");
    self.order.push(name.clone());
    self.hooks.insert(name.clone(), HookTable::new());
    Ok(self.entities.entry(name).or_insert(definition))
  }

  /// Insert or replace a definition under its own name. Hooks and
  /// definition order of an existing entry are kept.
  pub fn register(&mut self, definition: EntityDefinition) {
    let name = definition.name.clone();
    if !self.entities.contains_key(&name) {
      self.order.push(name.clone());
      self.hooks.insert(name.clone(), HookTable::new());
    }
    self.entities.insert(name, definition);
  }

  pub fn get(&self, name: &str) -> Option<&EntityDefinition> { self.entities.get(name) }

  pub fn get_mut(&mut self, name: &str) -> Option<&mut EntityDefinition> {
    self.entities.get_mut(name)
  }

  pub fn entity(&self, name: &str) -> Result<&EntityDefinition> {
    self.get(name).ok_or_else(|| Error::UnknownEntity(name.to_owned()))
  }

  fn entity_mut(&mut self, name: &str) -> Result<&mut EntityDefinition> {
    self.entities.get_mut(name).ok_or_else(|| Error::UnknownEntity(name.to_owned()))
  }

  pub fn contains(&self, name: &str) -> bool { self.entities.contains_key(name) }

  /// Entity names in definition order.
  pub fn names(&self) -> impl Iterator<Item = &str> { self.order.iter().map(String::as_str) }

  // ── Hooks ───────────────────────────────────────────────────────────────

  pub fn add_hook(&mut self, entity: &str, event: LifecycleEvent, hook: Hook<E>) -> Result<()> {
    self
      .hooks
      .get_mut(entity)
      .ok_or_else(|| Error::UnknownEntity(entity.to_owned()))?
      .add(event, hook)
  }

  pub fn hooks(&self, entity: &str) -> Option<&HookTable<E>> { self.hooks.get(entity) }

  pub fn row_hooks(&self, entity: &str, event: LifecycleEvent) -> Vec<RowHook<E>> {
    self.hooks(entity).map(|t| t.row_hooks(event)).unwrap_or_default()
  }

  pub fn bulk_hooks(&self, entity: &str, event: LifecycleEvent) -> Vec<BulkHook<E>> {
    self.hooks(entity).map(|t| t.bulk_hooks(event)).unwrap_or_default()
  }

  /// Run `entity`'s sync hooks for `event`, in attachment order.
  pub fn run_sync_hooks(&mut self, entity: &str, event: LifecycleEvent) -> Result<()> {
    let hooks = self.hooks(entity).map(|t| t.sync_hooks(event)).unwrap_or_default();
    for hook in hooks {
      hook(self, entity)?;
    }
    Ok(())
  }

  // ── Relationships ───────────────────────────────────────────────────────

  /// Declare `relationship` on `entity`.
  ///
  /// The foreign key is resolved to its conventional name when unset. With
  /// `constraints` on, the foreign-key attribute (on `entity` for
  /// `BelongsTo`, on the target for `HasOne`/`HasMany`) gets the reference
  /// and referential actions, and is added if missing. Returns `false` when
  /// an identical declaration already exists.
  pub fn associate(&mut self, entity: &str, mut relationship: Relationship) -> Result<bool> {
    let source = self.entity(entity)?;
    let (holder, referenced) = match relationship.kind {
      RelationshipKind::BelongsTo => (entity.to_owned(), relationship.target.clone()),
      RelationshipKind::HasOne | RelationshipKind::HasMany => {
        (relationship.target.clone(), entity.to_owned())
      }
      RelationshipKind::BelongsToMany => (String::new(), String::new()),
    };

    if relationship.options.foreign_key.is_none() && !referenced.is_empty() {
      let key = self.referenced_key(&referenced)?;
      relationship.options.foreign_key = Some(default_foreign_key(&referenced, &key));
    }

    if source.relationships.iter().any(|r| r.same_declaration(&relationship)) {
      return Ok(false);
    }

    if relationship.options.constraints && !holder.is_empty() {
      self.constrain(&holder, &referenced, &relationship)?;
    }

    tracing::debug!(
      entity,
      kind = %relationship.kind,
      target = %relationship.target,
      "declared relationship"
    );
    self.entity_mut(entity)?.relationships.push(relationship);
    Ok(true)
  }

  fn referenced_key(&self, referenced: &str) -> Result<String> {
    self
      .entity(referenced)?
      .association_field()
      .map(str::to_owned)
      .ok_or_else(|| Error::InvalidDefinition(format!("{referenced} has no primary key")))
  }

  /// Put the foreign-key facets on `holder`'s foreign-key attribute.
  fn constrain(&mut self, holder: &str, referenced: &str, relationship: &Relationship) -> Result<()> {
    let key = self.referenced_key(referenced)?;
    let key_type = self
      .entity(referenced)?
      .attribute(&key)
      .map(|a| a.data_type)
      .unwrap_or(DataType::Integer);
    let fk = relationship
      .options
      .foreign_key
      .clone()
      .unwrap_or_else(|| default_foreign_key(referenced, &key));
    let on_delete = relationship.options.on_delete.unwrap_or(ReferentialAction::SetNull);
    let on_update = relationship.options.on_update.unwrap_or(ReferentialAction::Cascade);

    let holder_def = self.entity_mut(holder)?;
    if holder_def.attribute(&fk).is_none() {
      holder_def.attributes.push(Attribute::new(fk.clone(), key_type));
    }
    if let Some(attr) = holder_def.attribute_mut(&fk) {
      attr.references = Some(References { entity: referenced.to_owned(), key });
      attr.on_delete = Some(on_delete);
      attr.on_update = Some(on_update);
    }
    Ok(())
  }
}
