//! Typed entity model: attributes, indexes, table options and relationships.
//!
//! An [`EntityDefinition`] is the full, ordered description of one record
//! type. Live entities are written by the application; history entities are
//! derived from them by [`crate::derive`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter};

use crate::{Error, Result, query::Filter};

// ─── Values ──────────────────────────────────────────────────────────────────

/// Field values of one row, keyed by attribute name.
pub type Record = BTreeMap<String, Value>;

/// Encode a timestamp the way every stored timestamp is encoded: RFC 3339,
/// UTC, microsecond precision. Fixed precision keeps the strings ordered.
pub fn encode_timestamp(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String { encode_timestamp(Utc::now()) }

/// A live row as seen by a per-row hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
  pub values:   Record,
  /// Field values before the write in progress; `None` for a row that has
  /// not been persisted yet.
  pub previous: Option<Record>,
}

impl Instance {
  pub fn new(values: Record) -> Self { Self { values, previous: None } }

  /// An instance loaded from storage: previous and current values agree.
  pub fn loaded(values: Record) -> Self {
    Self { previous: Some(values.clone()), values }
  }

  pub fn get(&self, field: &str) -> Option<&Value> { self.values.get(field) }

  /// Names of the fields whose value differs from the previous state.
  pub fn changed(&self) -> Vec<&str> {
    match &self.previous {
      None => self.values.keys().map(String::as_str).collect(),
      Some(prev) => self
        .values
        .iter()
        .filter(|(k, v)| prev.get(*k) != Some(*v))
        .map(|(k, _)| k.as_str())
        .collect(),
    }
  }
}

// ─── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
  Integer,
  BigInt,
  Real,
  Text,
  Boolean,
  Timestamp,
  Json,
  Uuid,
}

/// A value filled in by the host when a write leaves the field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DefaultValue {
  Value(Value),
  /// The current time at write.
  Now,
  /// A fresh v4 UUID at write.
  UuidV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
  #[strum(serialize = "CASCADE")]
  Cascade,
  #[strum(serialize = "SET NULL")]
  SetNull,
  #[strum(serialize = "SET DEFAULT")]
  SetDefault,
  #[strum(serialize = "RESTRICT")]
  Restrict,
  #[strum(serialize = "NO ACTION")]
  NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct References {
  pub entity: String,
  pub key:    String,
}

/// A named getter or setter binding. Opaque here; only ever stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessor(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unique {
  #[default]
  No,
  Yes,
  /// Part of a named (possibly composite) unique constraint.
  Named(String),
}

impl Unique {
  pub fn is_unique(&self) -> bool { !matches!(self, Self::No) }
}

/// One column of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
  pub name:           String,
  pub data_type:      DataType,
  pub allow_null:     bool,
  pub default:        Option<DefaultValue>,
  pub primary_key:    bool,
  pub auto_increment: bool,
  pub unique:         Unique,
  pub references:     Option<References>,
  pub on_delete:      Option<ReferentialAction>,
  pub on_update:      Option<ReferentialAction>,
  pub getter:         Option<Accessor>,
  pub setter:         Option<Accessor>,
  pub comment:        Option<String>,
}

/// The constraint and behaviour metadata an attribute may carry on top of
/// its name, type, nullability and default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
pub enum AttributeFacet {
  Unique,
  PrimaryKey,
  AutoIncrement,
  Getter,
  Setter,
  References,
  OnDelete,
  OnUpdate,
}

impl Attribute {
  pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
    Self {
      name: name.into(),
      data_type,
      allow_null: true,
      default: None,
      primary_key: false,
      auto_increment: false,
      unique: Unique::No,
      references: None,
      on_delete: None,
      on_update: None,
      getter: None,
      setter: None,
      comment: None,
    }
  }

  pub fn not_null(mut self) -> Self {
    self.allow_null = false;
    self
  }

  pub fn default_value(mut self, default: DefaultValue) -> Self {
    self.default = Some(default);
    self
  }

  pub fn primary_key(mut self) -> Self {
    self.primary_key = true;
    self.allow_null = false;
    self
  }

  pub fn auto_increment(mut self) -> Self {
    self.auto_increment = true;
    self
  }

  pub fn unique(mut self) -> Self {
    self.unique = Unique::Yes;
    self
  }

  pub fn unique_named(mut self, constraint: impl Into<String>) -> Self {
    self.unique = Unique::Named(constraint.into());
    self
  }

  pub fn references(mut self, entity: impl Into<String>, key: impl Into<String>) -> Self {
    self.references = Some(References { entity: entity.into(), key: key.into() });
    self
  }

  pub fn on_delete(mut self, action: ReferentialAction) -> Self {
    self.on_delete = Some(action);
    self
  }

  pub fn on_update(mut self, action: ReferentialAction) -> Self {
    self.on_update = Some(action);
    self
  }

  pub fn getter(mut self, binding: impl Into<String>) -> Self {
    self.getter = Some(Accessor(binding.into()));
    self
  }

  pub fn setter(mut self, binding: impl Into<String>) -> Self {
    self.setter = Some(Accessor(binding.into()));
    self
  }

  pub fn comment(mut self, comment: impl Into<String>) -> Self {
    self.comment = Some(comment.into());
    self
  }

  pub fn has(&self, facet: AttributeFacet) -> bool {
    match facet {
      AttributeFacet::Unique => self.unique.is_unique(),
      AttributeFacet::PrimaryKey => self.primary_key,
      AttributeFacet::AutoIncrement => self.auto_increment,
      AttributeFacet::Getter => self.getter.is_some(),
      AttributeFacet::Setter => self.setter.is_some(),
      AttributeFacet::References => self.references.is_some(),
      AttributeFacet::OnDelete => self.on_delete.is_some(),
      AttributeFacet::OnUpdate => self.on_update.is_some(),
    }
  }

  pub fn clear(&mut self, facet: AttributeFacet) {
    match facet {
      AttributeFacet::Unique => self.unique = Unique::No,
      AttributeFacet::PrimaryKey => self.primary_key = false,
      AttributeFacet::AutoIncrement => self.auto_increment = false,
      AttributeFacet::Getter => self.getter = None,
      AttributeFacet::Setter => self.setter = None,
      AttributeFacet::References => self.references = None,
      AttributeFacet::OnDelete => self.on_delete = None,
      AttributeFacet::OnUpdate => self.on_update = None,
    }
  }
}

// ─── Indexes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
  Unique,
  FullText,
  Spatial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
  pub name:    Option<String>,
  pub fields:  Vec<String>,
  pub unique:  bool,
  pub kind:    Option<IndexKind>,
  pub comment: Option<String>,
}

impl Index {
  pub fn new<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      name:    None,
      fields:  fields.into_iter().map(Into::into).collect(),
      unique:  false,
      kind:    None,
      comment: None,
    }
  }

  pub fn named(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }

  pub fn kind(mut self, kind: IndexKind) -> Self {
    self.kind = Some(kind);
    self
  }

  /// Either flavour of uniqueness: the flag or the index kind.
  pub fn is_unique(&self) -> bool {
    self.unique || self.kind == Some(IndexKind::Unique)
  }

  /// The explicit name, or `<table>_<field>_<field>…` when unnamed.
  pub fn resolved_name(&self, table: &str) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => {
        let mut name = table.to_owned();
        for field in &self.fields {
          name.push('_');
          name.push_str(field);
        }
        name
      }
    }
  }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Table-level options of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOptions {
  /// Storage table name; the entity name when unset.
  pub table_name:       Option<String>,
  /// Host-managed created-at/updated-at fields.
  pub timestamps:       bool,
  /// Soft delete via the deleted-at field. Needs `timestamps`.
  pub paranoid:         bool,
  pub created_at:       String,
  pub updated_at:       String,
  pub deleted_at:       String,
  pub indexes:          Vec<Index>,
  pub scopes:           BTreeMap<String, Filter>,
  pub default_scope:    Option<Filter>,
  pub instance_methods: BTreeSet<String>,
  pub comment:          Option<String>,
  /// Options this system does not interpret; carried through verbatim.
  pub extra:            BTreeMap<String, Value>,
}

impl Default for EntityOptions {
  fn default() -> Self {
    Self {
      table_name:       None,
      timestamps:       true,
      paranoid:         false,
      created_at:       "createdAt".into(),
      updated_at:       "updatedAt".into(),
      deleted_at:       "deletedAt".into(),
      indexes:          Vec::new(),
      scopes:           BTreeMap::new(),
      default_scope:    None,
      instance_methods: BTreeSet::new(),
      comment:          None,
      extra:            BTreeMap::new(),
    }
  }
}

impl EntityOptions {
  pub fn is_paranoid(&self) -> bool { self.timestamps && self.paranoid }
}

// ─── Relationships ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
  BelongsTo,
  HasOne,
  HasMany,
  BelongsToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipOptions {
  pub alias:       Option<String>,
  pub foreign_key: Option<String>,
  /// Join entity of a many-to-many relationship.
  pub through:     Option<String>,
  pub on_delete:   Option<ReferentialAction>,
  pub on_update:   Option<ReferentialAction>,
  /// Whether the relationship is backed by a foreign-key constraint.
  pub constraints: bool,
}

impl Default for RelationshipOptions {
  fn default() -> Self {
    Self {
      alias:       None,
      foreign_key: None,
      through:     None,
      on_delete:   None,
      on_update:   None,
      constraints: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
  pub kind:    RelationshipKind,
  pub target:  String,
  pub options: RelationshipOptions,
}

impl Relationship {
  pub fn new(kind: RelationshipKind, target: impl Into<String>) -> Self {
    Self { kind, target: target.into(), options: RelationshipOptions::default() }
  }

  pub fn belongs_to(target: impl Into<String>) -> Self {
    Self::new(RelationshipKind::BelongsTo, target)
  }

  pub fn has_one(target: impl Into<String>) -> Self {
    Self::new(RelationshipKind::HasOne, target)
  }

  pub fn has_many(target: impl Into<String>) -> Self {
    Self::new(RelationshipKind::HasMany, target)
  }

  pub fn belongs_to_many(target: impl Into<String>, through: impl Into<String>) -> Self {
    let mut rel = Self::new(RelationshipKind::BelongsToMany, target);
    rel.options.through = Some(through.into());
    rel
  }

  pub fn alias(mut self, alias: impl Into<String>) -> Self {
    self.options.alias = Some(alias.into());
    self
  }

  pub fn foreign_key(mut self, field: impl Into<String>) -> Self {
    self.options.foreign_key = Some(field.into());
    self
  }

  pub fn on_delete(mut self, action: ReferentialAction) -> Self {
    self.options.on_delete = Some(action);
    self
  }

  pub fn on_update(mut self, action: ReferentialAction) -> Self {
    self.options.on_update = Some(action);
    self
  }

  /// Both referential actions set to `NO ACTION`.
  pub fn no_action(self) -> Self {
    self
      .on_delete(ReferentialAction::NoAction)
      .on_update(ReferentialAction::NoAction)
  }

  pub fn without_constraints(mut self) -> Self {
    self.options.constraints = false;
    self
  }

  /// Two declarations describe the same relationship when kind, target,
  /// alias and foreign key agree.
  pub fn same_declaration(&self, other: &Self) -> bool {
    self.kind == other.kind
      && self.target == other.target
      && self.options.alias == other.options.alias
      && self.options.foreign_key == other.options.foreign_key
  }
}

/// Conventional foreign-key field name: `Team` + `id` → `teamId`.
pub fn default_foreign_key(entity: &str, key: &str) -> String {
  let mut chars = entity.chars();
  let mut name: String = match chars.next() {
    Some(first) => first.to_lowercase().chain(chars).collect(),
    None => String::new(),
  };
  let mut key_chars = key.chars();
  if let Some(first) = key_chars.next() {
    name.extend(first.to_uppercase());
    name.extend(key_chars);
  }
  name
}

// ─── Entities ────────────────────────────────────────────────────────────────

/// The complete definition of one record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
  pub name:             String,
  /// Column order is significant and preserved.
  pub attributes:       Vec<Attribute>,
  pub options:          EntityOptions,
  pub relationships:    Vec<Relationship>,
  /// Field relationships key against, when it is not the primary key.
  pub association_key:  Option<String>,
  /// For a history entity, the name of the live entity it shadows.
  pub origin:           Option<String>,
  /// For a history entity, whether relationships are mirrored at sync.
  pub add_associations: bool,
}

impl EntityDefinition {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name:             name.into(),
      attributes:       Vec::new(),
      options:          EntityOptions::default(),
      relationships:    Vec::new(),
      association_key:  None,
      origin:           None,
      add_associations: false,
    }
  }

  pub fn with_attribute(mut self, attribute: Attribute) -> Self {
    self.attributes.push(attribute);
    self
  }

  pub fn with_index(mut self, index: Index) -> Self {
    self.options.indexes.push(index);
    self
  }

  pub fn with_options(mut self, options: EntityOptions) -> Self {
    self.options = options;
    self
  }

  pub fn timestamps(mut self, on: bool) -> Self {
    self.options.timestamps = on;
    self
  }

  pub fn paranoid(mut self, on: bool) -> Self {
    self.options.paranoid = on;
    self
  }

  pub fn table_name(mut self, table: impl Into<String>) -> Self {
    self.options.table_name = Some(table.into());
    self
  }

  pub fn table(&self) -> &str {
    self.options.table_name.as_deref().unwrap_or(&self.name)
  }

  pub fn attribute(&self, name: &str) -> Option<&Attribute> {
    self.attributes.iter().find(|a| a.name == name)
  }

  pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
    self.attributes.iter_mut().find(|a| a.name == name)
  }

  pub fn primary_keys(&self) -> impl Iterator<Item = &Attribute> {
    self.attributes.iter().filter(|a| a.primary_key)
  }

  /// The first primary-key field.
  pub fn primary_key_field(&self) -> Option<&str> {
    self.primary_keys().next().map(|a| a.name.as_str())
  }

  /// The field other entities reference this one by.
  pub fn association_field(&self) -> Option<&str> {
    self.association_key.as_deref().or_else(|| self.primary_key_field())
  }

  pub fn is_history(&self) -> bool { self.origin.is_some() }

  /// Check the definition is internally consistent.
  pub fn validate(&self) -> Result<()> {
    if self.name.is_empty() {
      return Err(Error::InvalidDefinition("entity name is empty".into()));
    }
    if self.attributes.is_empty() {
      return Err(Error::InvalidDefinition(format!(
        "{} declares no attributes",
        self.name
      )));
    }
    if let Some(dup) = first_duplicate(&self.attributes) {
      return Err(Error::InvalidDefinition(format!(
        "{} declares attribute {dup:?} twice",
        self.name
      )));
    }
    for index in &self.options.indexes {
      if index.fields.is_empty() {
        return Err(Error::InvalidDefinition(format!(
          "{}: index {:?} has no fields",
          self.name,
          index.resolved_name(self.table())
        )));
      }
      if let Some(missing) = index.fields.iter().find(|f| self.attribute(f).is_none()) {
        return Err(Error::InvalidDefinition(format!(
          "{}: index field {missing:?} is not an attribute",
          self.name
        )));
      }
    }
    Ok(())
  }

  /// Fill in what the host adds to every definition, then validate: an
  /// auto-increment `id` when no primary key is declared, and the
  /// timestamp fields when `timestamps` is on.
  pub fn normalized(mut self) -> Result<Self> {
    if !self.attributes.is_empty() && self.primary_key_field().is_none() {
      self.attributes.insert(
        0,
        Attribute::new("id", DataType::Integer).primary_key().auto_increment(),
      );
    }
    if self.options.timestamps {
      for field in [self.options.created_at.clone(), self.options.updated_at.clone()] {
        if self.attribute(&field).is_none() {
          self.attributes.push(Attribute::new(field, DataType::Timestamp).not_null());
        }
      }
      if self.options.paranoid {
        let field = self.options.deleted_at.clone();
        if self.attribute(&field).is_none() {
          self.attributes.push(Attribute::new(field, DataType::Timestamp));
        }
      }
    }
    self.validate()?;
    Ok(self)
  }
}

/// The first attribute name that appears more than once.
pub fn first_duplicate(attributes: &[Attribute]) -> Option<&str> {
  let mut seen = BTreeSet::new();
  attributes
    .iter()
    .map(|a| a.name.as_str())
    .find(|name| !seen.insert(*name))
}
