//! Row filters carried by bulk mutation events and finder calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A predicate over the fields of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
  /// Matches every row.
  #[default]
  All,
  Eq { field: String, value: Value },
  Ne { field: String, value: Value },
  Gt { field: String, value: Value },
  Gte { field: String, value: Value },
  Lt { field: String, value: Value },
  Lte { field: String, value: Value },
  In { field: String, values: Vec<Value> },
  IsNull { field: String },
  NotNull { field: String },
  And { filters: Vec<Filter> },
  Or { filters: Vec<Filter> },
}

impl Filter {
  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Eq { field: field.into(), value: value.into() }
  }

  pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Ne { field: field.into(), value: value.into() }
  }

  pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Gt { field: field.into(), value: value.into() }
  }

  pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Gte { field: field.into(), value: value.into() }
  }

  pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Lt { field: field.into(), value: value.into() }
  }

  pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Lte { field: field.into(), value: value.into() }
  }

  pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
  {
    Self::In {
      field:  field.into(),
      values: values.into_iter().map(Into::into).collect(),
    }
  }

  pub fn is_null(field: impl Into<String>) -> Self {
    Self::IsNull { field: field.into() }
  }

  pub fn not_null(field: impl Into<String>) -> Self {
    Self::NotNull { field: field.into() }
  }

  /// Conjunction; `All` is the identity.
  pub fn and(self, other: Filter) -> Self {
    match (self, other) {
      (Self::All, f) | (f, Self::All) => f,
      (Self::And { mut filters }, f) => {
        filters.push(f);
        Self::And { filters }
      }
      (a, b) => Self::And { filters: vec![a, b] },
    }
  }

  pub fn or(self, other: Filter) -> Self {
    Self::Or { filters: vec![self, other] }
  }

  /// Every field name the filter mentions, in first-mention order.
  pub fn fields(&self) -> Vec<&str> {
    let mut out = Vec::new();
    self.collect_fields(&mut out);
    out
  }

  fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
    match self {
      Self::All => {}
      Self::Eq { field, .. }
      | Self::Ne { field, .. }
      | Self::Gt { field, .. }
      | Self::Gte { field, .. }
      | Self::Lt { field, .. }
      | Self::Lte { field, .. }
      | Self::In { field, .. }
      | Self::IsNull { field }
      | Self::NotNull { field } => {
        if !out.contains(&field.as_str()) {
          out.push(field);
        }
      }
      Self::And { filters } | Self::Or { filters } => {
        for f in filters {
          f.collect_fields(out);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn and_with_all_is_identity() {
    let f = Filter::eq("name", "a");
    assert_eq!(Filter::All.and(f.clone()), f);
    assert_eq!(f.clone().and(Filter::All), f);
  }

  #[test]
  fn and_flattens_left_conjunction() {
    let f = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::is_null("c"));
    let Filter::And { filters } = f else { panic!("expected And") };
    assert_eq!(filters.len(), 3);
  }

  #[test]
  fn fields_are_deduplicated_in_order() {
    let f = Filter::gt("age", 3)
      .and(Filter::is_in("team", [json!(1), json!(2)]))
      .or(Filter::lt("age", 90));
    assert_eq!(f.fields(), ["age", "team"]);
  }
}
