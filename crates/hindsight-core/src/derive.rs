//! Schema Deriver: the history entity's shape, computed from the live one.
//!
//! A pure function over ordered containers. Identical inputs give identical
//! outputs, down to the serialised bytes.

use crate::{
  Error, Result,
  config::HistoryConfig,
  model::{
    Attribute, AttributeFacet, DataType, DefaultValue, EntityDefinition, EntityOptions, Index,
    first_duplicate,
  },
};

/// Surrogate key of every history entity.
pub const SURROGATE_KEY: &str = "hid";

/// Capture-time field of every history entity.
pub const ARCHIVED_AT: &str = "archivedAt";

/// Facets valid on a live table but invalid or harmful on an append-only one.
pub const EXCLUDED_FACETS: [AttributeFacet; 8] = [
  AttributeFacet::Unique,
  AttributeFacet::PrimaryKey,
  AttributeFacet::AutoIncrement,
  AttributeFacet::Getter,
  AttributeFacet::Setter,
  AttributeFacet::References,
  AttributeFacet::OnDelete,
  AttributeFacet::OnUpdate,
];

/// Derive the history entity for `live`.
pub fn derive_history_schema(
  live: &EntityDefinition,
  config: &HistoryConfig,
) -> Result<EntityDefinition> {
  check_derivable(live, config)?;

  let timestamp_fields = [live.options.created_at.as_str(), live.options.updated_at.as_str()];
  let copied = live
    .attributes
    .iter()
    .map(|a| history_attribute(a, &timestamp_fields))
    .collect();

  Ok(EntityDefinition {
    name:             config.history_name(&live.name),
    attributes:       merge_own(copied, own_attributes(config)),
    options:          history_options(&live.options, live.table(), config),
    relationships:    Vec::new(),
    association_key:  None,
    origin:           Some(live.name.clone()),
    add_associations: config.add_associations,
  })
}

fn check_derivable(live: &EntityDefinition, config: &HistoryConfig) -> Result<()> {
  if config.model_suffix.is_empty() {
    return Err(Error::SchemaDerivation(
      "model suffix is empty; history and live entity names would collide".into(),
    ));
  }
  if config.index_suffix.is_empty() {
    return Err(Error::SchemaDerivation(
      "index suffix is empty; history and live index names would collide".into(),
    ));
  }
  if config.deleted_column_name.is_empty() {
    return Err(Error::SchemaDerivation("deleted column name is empty".into()));
  }
  if let Some(origin) = &live.origin {
    return Err(Error::SchemaDerivation(format!(
      "{} is already the history of {origin}",
      live.name
    )));
  }
  if live.attributes.is_empty() {
    return Err(Error::SchemaDerivation(format!("{} declares no attributes", live.name)));
  }
  if let Some(dup) = first_duplicate(&live.attributes) {
    return Err(Error::SchemaDerivation(format!(
      "{} declares attribute {dup:?} twice",
      live.name
    )));
  }
  Ok(())
}

/// Copy of a live attribute with every excluded facet cleared. Timestamp
/// fields become plain timestamps copied from the live row, never
/// regenerated.
pub fn history_attribute(live: &Attribute, timestamp_fields: &[&str]) -> Attribute {
  let mut attr = live.clone();
  for facet in EXCLUDED_FACETS {
    attr.clear(facet);
  }
  if timestamp_fields.contains(&attr.name.as_str()) {
    attr.data_type = DataType::Timestamp;
    if attr.default == Some(DefaultValue::Now) {
      attr.default = None;
    }
  }
  attr
}

/// The three attributes every history entity owns.
pub fn own_attributes(config: &HistoryConfig) -> Vec<Attribute> {
  vec![
    Attribute::new(SURROGATE_KEY, DataType::BigInt)
      .primary_key()
      .auto_increment()
      .unique(),
    Attribute::new(ARCHIVED_AT, DataType::Timestamp)
      .not_null()
      .default_value(DefaultValue::Now),
    Attribute::new(config.deleted_column_name.clone(), DataType::Boolean)
      .default_value(DefaultValue::Value(serde_json::Value::Null)),
  ]
}

/// Own attributes replace same-named copies in place; the rest append.
fn merge_own(mut copied: Vec<Attribute>, own: Vec<Attribute>) -> Vec<Attribute> {
  for attr in own {
    match copied.iter_mut().find(|a| a.name == attr.name) {
      Some(slot) => *slot = attr,
      None => copied.push(attr),
    }
  }
  copied
}

/// Live options minus identity and runtime bookkeeping, with timestamps off
/// and indexes filtered and renamed.
pub fn history_options(
  live: &EntityOptions,
  live_table: &str,
  config: &HistoryConfig,
) -> EntityOptions {
  EntityOptions {
    table_name:       None,
    timestamps:       false,
    scopes:           Default::default(),
    default_scope:    None,
    instance_methods: Default::default(),
    indexes:          history_indexes(&live.indexes, live_table, &config.index_suffix),
    ..live.clone()
  }
}

/// Drop unique indexes and suffix the names of the rest.
pub fn history_indexes(indexes: &[Index], live_table: &str, suffix: &str) -> Vec<Index> {
  indexes
    .iter()
    .filter(|index| !index.is_unique())
    .map(|index| {
      let mut renamed = index.clone();
      renamed.name = Some(format!("{}{suffix}", index.resolved_name(live_table)));
      renamed
    })
    .collect()
}
