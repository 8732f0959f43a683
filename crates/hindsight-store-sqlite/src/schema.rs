//! DDL rendering for registered entities.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so `sync` can run on an
//! existing database. Columns follow attribute order.

use std::collections::BTreeMap;

use hindsight_core::model::{Attribute, DataType, EntityDefinition, Unique};

use crate::encode::quote;

/// Connection-level settings applied once at open.
pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

/// Entity name to table name, for resolving `REFERENCES` targets.
pub type TableNames = BTreeMap<String, String>;

fn column_type(data_type: DataType) -> &'static str {
  match data_type {
    DataType::Integer | DataType::BigInt | DataType::Boolean => "INTEGER",
    DataType::Real => "REAL",
    DataType::Text | DataType::Timestamp | DataType::Json | DataType::Uuid => "TEXT",
  }
}

fn column(attr: &Attribute, single_key: bool, tables: &TableNames) -> String {
  let mut sql = format!("{} {}", quote(&attr.name), column_type(attr.data_type));
  if attr.primary_key && single_key {
    sql.push_str(" PRIMARY KEY");
    if attr.auto_increment && column_type(attr.data_type) == "INTEGER" {
      sql.push_str(" AUTOINCREMENT");
    }
  } else {
    if !attr.allow_null {
      sql.push_str(" NOT NULL");
    }
    if attr.unique == Unique::Yes {
      sql.push_str(" UNIQUE");
    }
  }
  if let Some(target) = &attr.references {
    let table = tables.get(&target.entity).unwrap_or(&target.entity);
    sql.push_str(&format!(" REFERENCES {} ({})", quote(table), quote(&target.key)));
    if let Some(action) = attr.on_delete {
      sql.push_str(&format!(" ON DELETE {action}"));
    }
    if let Some(action) = attr.on_update {
      sql.push_str(&format!(" ON UPDATE {action}"));
    }
  }
  sql
}

/// `CREATE TABLE` for `def`.
pub fn create_table(def: &EntityDefinition, tables: &TableNames) -> String {
  let keys: Vec<&str> = def.primary_keys().map(|a| a.name.as_str()).collect();
  let single_key = keys.len() == 1;

  let mut lines: Vec<String> =
    def.attributes.iter().map(|a| column(a, single_key, tables)).collect();

  if keys.len() > 1 {
    lines.push(format!("PRIMARY KEY ({})", quoted_list(&keys)));
  }

  let mut named: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
  for attr in &def.attributes {
    if let Unique::Named(constraint) = &attr.unique {
      named.entry(constraint.as_str()).or_default().push(attr.name.as_str());
    }
  }
  for (constraint, fields) in named {
    lines.push(format!(
      "CONSTRAINT {} UNIQUE ({})",
      quote(constraint),
      quoted_list(&fields)
    ));
  }

  format!(
    "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
    quote(def.table()),
    lines.join(",\n    ")
  )
}

/// `CREATE INDEX` statements for `def`'s declared indexes.
pub fn create_indexes(def: &EntityDefinition) -> Vec<String> {
  def
    .options
    .indexes
    .iter()
    .map(|index| {
      let fields: Vec<&str> = index.fields.iter().map(String::as_str).collect();
      format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
        if index.is_unique() { "UNIQUE " } else { "" },
        quote(&index.resolved_name(def.table())),
        quote(def.table()),
        quoted_list(&fields)
      )
    })
    .collect()
}

/// The full batch materialising `def`.
pub fn statements(def: &EntityDefinition, tables: &TableNames) -> String {
  let mut batch = create_table(def, tables);
  for index in create_indexes(def) {
    batch.push('\n');
    batch.push_str(&index);
  }
  batch
}

fn quoted_list(fields: &[&str]) -> String {
  fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
  use hindsight_core::{
    HistoryConfig, derive_history_schema,
    model::{Index, ReferentialAction},
  };

  use super::*;

  fn user() -> EntityDefinition {
    EntityDefinition::new("User")
      .with_attribute(Attribute::new("name", DataType::Text).not_null())
      .with_attribute(Attribute::new("email", DataType::Text).unique())
      .with_attribute(
        Attribute::new("teamId", DataType::Integer)
          .references("Team", "id")
          .on_delete(ReferentialAction::Cascade),
      )
      .with_index(Index::new(["name"]))
      .with_index(Index::new(["email"]).named("users_email").unique())
      .normalized()
      .unwrap()
  }

  fn tables() -> TableNames { BTreeMap::from([("Team".to_owned(), "teams".to_owned())]) }

  #[test]
  fn live_table_ddl() {
    let ddl = create_table(&user(), &tables());
    assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"User\""));
    assert!(ddl.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
    assert!(ddl.contains("\"name\" TEXT NOT NULL"));
    assert!(ddl.contains("\"email\" TEXT UNIQUE"));
    assert!(ddl.contains("\"teamId\" INTEGER REFERENCES \"teams\" (\"id\") ON DELETE CASCADE"));
    assert!(ddl.contains("\"createdAt\" TEXT NOT NULL"));
  }

  #[test]
  fn history_table_ddl_has_no_live_constraints() {
    let history = derive_history_schema(&user(), &HistoryConfig::default()).unwrap();
    let ddl = create_table(&history, &tables());

    assert!(ddl.contains("\"hid\" INTEGER PRIMARY KEY AUTOINCREMENT"));
    assert!(ddl.contains("\"id\" INTEGER NOT NULL,"));
    assert!(ddl.contains("\"email\" TEXT,"));
    assert!(!ddl.contains("REFERENCES"));
    assert!(ddl.contains("\"archivedAt\" TEXT NOT NULL"));
    assert!(ddl.contains("\"temporalizeDeleted\" INTEGER"));

    let indexes = create_indexes(&history);
    assert_eq!(
      indexes,
      ["CREATE INDEX IF NOT EXISTS \"User_name_history\" ON \"UserHistory\" (\"name\");"]
    );
  }

  #[test]
  fn composite_keys_and_named_uniques_are_table_constraints() {
    let def = EntityDefinition::new("Membership")
      .with_attribute(Attribute::new("userId", DataType::Integer).primary_key())
      .with_attribute(Attribute::new("teamId", DataType::Integer).primary_key())
      .with_attribute(Attribute::new("slot", DataType::Integer).unique_named("slot_per_team"))
      .with_attribute(Attribute::new("seat", DataType::Integer).unique_named("slot_per_team"))
      .timestamps(false);
    let ddl = create_table(&def, &TableNames::new());

    assert!(ddl.contains("\"userId\" INTEGER NOT NULL"));
    assert!(ddl.contains("PRIMARY KEY (\"userId\", \"teamId\")"));
    assert!(ddl.contains("CONSTRAINT \"slot_per_team\" UNIQUE (\"slot\", \"seat\")"));
    assert!(!ddl.contains("AUTOINCREMENT"));
  }

  #[test]
  fn unique_index_keeps_its_name() {
    let indexes = create_indexes(&user());
    assert_eq!(indexes[0], "CREATE INDEX IF NOT EXISTS \"User_name\" ON \"User\" (\"name\");");
    assert_eq!(
      indexes[1],
      "CREATE UNIQUE INDEX IF NOT EXISTS \"users_email\" ON \"User\" (\"email\");"
    );
  }
}
