//! Encoding and decoding helpers between JSON field values and the SQLite
//! column representations, plus filter rendering.
//!
//! Booleans are stored as 0/1 integers. `Json` attributes are stored as
//! compact JSON text. Timestamps and UUIDs are stored as text.

use hindsight_core::{
  model::{Attribute, DataType, EntityDefinition, Record},
  query::Filter,
};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::{Error, Result};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote(ident: &str) -> String { format!("\"{}\"", ident.replace('"', "\"\"")) }

// ─── Values ──────────────────────────────────────────────────────────────────

pub fn encode_value(attr: &Attribute, value: &Value) -> Result<SqlValue> {
  Ok(match (attr.data_type, value) {
    (_, Value::Null) => SqlValue::Null,
    (DataType::Json, v) => SqlValue::Text(serde_json::to_string(v)?),
    (_, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
    (_, Value::Number(n)) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
    },
    (_, Value::String(s)) => SqlValue::Text(s.clone()),
    (_, other) => SqlValue::Text(other.to_string()),
  })
}

pub fn decode_value(attr: &Attribute, value: SqlValue) -> Result<Value> {
  Ok(match (attr.data_type, value) {
    (_, SqlValue::Null) => Value::Null,
    (DataType::Boolean, SqlValue::Integer(i)) => Value::Bool(i != 0),
    (DataType::Json, SqlValue::Text(s)) => serde_json::from_str(&s)?,
    (_, SqlValue::Integer(i)) => Value::from(i),
    (_, SqlValue::Real(f)) => serde_json::Number::from_f64(f)
      .map(Value::Number)
      .unwrap_or(Value::Null),
    (_, SqlValue::Text(s)) => Value::String(s),
    (_, SqlValue::Blob(b)) => Value::from(b),
  })
}

/// Raw column values of one row, in attribute order.
pub struct RawRow(pub Vec<SqlValue>);

impl RawRow {
  pub fn into_record(self, def: &EntityDefinition) -> Result<Record> {
    def
      .attributes
      .iter()
      .zip(self.0)
      .map(|(attr, raw)| Ok((attr.name.clone(), decode_value(attr, raw)?)))
      .collect()
  }
}

// ─── Filters ─────────────────────────────────────────────────────────────────

fn attribute<'a>(def: &'a EntityDefinition, field: &str) -> Result<&'a Attribute> {
  def.attribute(field).ok_or_else(|| Error::UnknownField {
    entity: def.name.clone(),
    field:  field.to_owned(),
  })
}

/// Check every field `filter` mentions is an attribute of `def`.
pub fn check_filter(def: &EntityDefinition, filter: &Filter) -> Result<()> {
  for field in filter.fields() {
    attribute(def, field)?;
  }
  Ok(())
}

/// Render `filter` as a SQL boolean expression with `?` placeholders,
/// appending the bound values to `params`.
pub fn render_filter(
  def: &EntityDefinition,
  filter: &Filter,
  params: &mut Vec<SqlValue>,
) -> Result<String> {
  Ok(match filter {
    Filter::All => "1".to_owned(),
    Filter::Eq { field, value } if value.is_null() => null_check(def, field, "IS NULL")?,
    Filter::Ne { field, value } if value.is_null() => null_check(def, field, "IS NOT NULL")?,
    Filter::Eq { field, value } => compare(def, params, field, "=", value)?,
    Filter::Ne { field, value } => compare(def, params, field, "!=", value)?,
    Filter::Gt { field, value } => compare(def, params, field, ">", value)?,
    Filter::Gte { field, value } => compare(def, params, field, ">=", value)?,
    Filter::Lt { field, value } => compare(def, params, field, "<", value)?,
    Filter::Lte { field, value } => compare(def, params, field, "<=", value)?,
    Filter::In { values, .. } if values.is_empty() => "0".to_owned(),
    Filter::In { field, values } => {
      let attr = attribute(def, field)?;
      for value in values {
        params.push(encode_value(attr, value)?);
      }
      let marks = vec!["?"; values.len()].join(", ");
      format!("{} IN ({marks})", quote(field))
    }
    Filter::IsNull { field } => null_check(def, field, "IS NULL")?,
    Filter::NotNull { field } => null_check(def, field, "IS NOT NULL")?,
    Filter::And { filters } => join(def, filters, " AND ", "1", params)?,
    Filter::Or { filters } => join(def, filters, " OR ", "0", params)?,
  })
}

fn compare(
  def: &EntityDefinition,
  params: &mut Vec<SqlValue>,
  field: &str,
  op: &str,
  value: &Value,
) -> Result<String> {
  let attr = attribute(def, field)?;
  params.push(encode_value(attr, value)?);
  Ok(format!("{} {op} ?", quote(field)))
}

fn null_check(def: &EntityDefinition, field: &str, test: &str) -> Result<String> {
  attribute(def, field)?;
  Ok(format!("{} {test}", quote(field)))
}

fn join(
  def: &EntityDefinition,
  filters: &[Filter],
  sep: &str,
  empty: &str,
  params: &mut Vec<SqlValue>,
) -> Result<String> {
  if filters.is_empty() {
    return Ok(empty.to_owned());
  }
  let parts = filters
    .iter()
    .map(|f| Ok(format!("({})", render_filter(def, f, params)?)))
    .collect::<Result<Vec<_>>>()?;
  Ok(parts.join(sep))
}

#[cfg(test)]
mod tests {
  use hindsight_core::model::Attribute;
  use serde_json::json;

  use super::*;

  fn def() -> EntityDefinition {
    EntityDefinition::new("User")
      .with_attribute(Attribute::new("id", DataType::Integer).primary_key())
      .with_attribute(Attribute::new("name", DataType::Text))
      .with_attribute(Attribute::new("active", DataType::Boolean))
      .with_attribute(Attribute::new("meta", DataType::Json))
  }

  #[test]
  fn renders_nested_filters_with_params() {
    let filter = Filter::eq("active", true)
      .and(Filter::is_in("id", [1, 2]).or(Filter::is_null("name")));
    let mut params = Vec::new();
    let sql = render_filter(&def(), &filter, &mut params).unwrap();

    assert_eq!(
      sql,
      "(\"active\" = ?) AND ((\"id\" IN (?, ?)) OR (\"name\" IS NULL))"
    );
    assert_eq!(
      params,
      [SqlValue::Integer(1), SqlValue::Integer(1), SqlValue::Integer(2)]
    );
  }

  #[test]
  fn null_equality_and_empty_in() {
    let mut params = Vec::new();
    let d = def();
    assert_eq!(
      render_filter(&d, &Filter::eq("name", Value::Null), &mut params).unwrap(),
      "\"name\" IS NULL"
    );
    assert_eq!(
      render_filter(&d, &Filter::is_in("id", Vec::<i64>::new()), &mut params).unwrap(),
      "0"
    );
    assert!(params.is_empty());
  }

  #[test]
  fn unknown_filter_field_is_rejected() {
    let err = check_filter(&def(), &Filter::eq("email", "x")).unwrap_err();
    assert!(matches!(err, Error::UnknownField { ref field, .. } if field == "email"));
  }

  #[test]
  fn json_and_boolean_columns_decode_to_their_types() {
    let d = def();
    let meta = d.attribute("meta").unwrap();
    let stored = encode_value(meta, &json!({ "a": [1, 2] })).unwrap();
    assert_eq!(decode_value(meta, stored).unwrap(), json!({ "a": [1, 2] }));

    let active = d.attribute("active").unwrap();
    assert_eq!(
      decode_value(active, SqlValue::Integer(0)).unwrap(),
      json!(false)
    );
  }

  #[test]
  fn quote_escapes_embedded_quotes() {
    assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
  }
}
