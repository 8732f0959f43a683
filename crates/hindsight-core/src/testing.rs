//! In-memory [`Engine`] used by unit tests.

use std::{
  cmp::Ordering,
  collections::BTreeMap,
  sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{
  engine::{Engine, FindOptions},
  model::Record,
  query::Filter,
};

#[derive(Debug, Clone)]
pub struct Write {
  pub entity:      String,
  pub rows:        Vec<Record>,
  pub transaction: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
  tables:             BTreeMap<String, Vec<Record>>,
  writes:             Vec<Write>,
  last_find_paranoid: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
  state: Arc<Mutex<State>>,
  fail:  bool,
}

#[derive(Debug, thiserror::Error)]
#[error("memory engine refused the write")]
pub struct Refused;

impl MemoryEngine {
  pub fn failing() -> Self { Self { fail: true, ..Self::default() } }

  pub fn seed(&self, entity: &str, rows: impl IntoIterator<Item = Record>) {
    let mut state = self.state.lock().unwrap();
    state.tables.entry(entity.to_owned()).or_default().extend(rows);
  }

  /// Drop every row of `entity`, as a hard delete would.
  pub fn clear(&self, entity: &str) { self.state.lock().unwrap().tables.remove(entity); }

  pub fn rows(&self, entity: &str) -> Vec<Record> {
    let state = self.state.lock().unwrap();
    state.tables.get(entity).cloned().unwrap_or_default()
  }

  pub fn writes(&self) -> Vec<Write> { self.state.lock().unwrap().writes.clone() }

  pub fn last_find_paranoid(&self) -> bool {
    self.state.lock().unwrap().last_find_paranoid.unwrap_or(true)
  }
}

impl Engine for MemoryEngine {
  type Transaction = u64;
  type Error = Refused;

  async fn create_many(
    &self,
    entity: &str,
    rows: Vec<Record>,
    transaction: Option<u64>,
  ) -> Result<usize, Refused> {
    if self.fail {
      return Err(Refused);
    }
    let mut state = self.state.lock().unwrap();
    let count = rows.len();
    state.tables.entry(entity.to_owned()).or_default().extend(rows.iter().cloned());
    state.writes.push(Write { entity: entity.to_owned(), rows, transaction });
    Ok(count)
  }

  async fn find_all(
    &self,
    entity: &str,
    options: FindOptions<u64>,
  ) -> Result<Vec<Record>, Refused> {
    let mut state = self.state.lock().unwrap();
    state.last_find_paranoid = Some(options.paranoid);
    Ok(
      state
        .tables
        .get(entity)
        .map(|rows| rows.iter().filter(|r| matches(&options.filter, r)).cloned().collect())
        .unwrap_or_default(),
    )
  }
}

fn compare(a: Option<&Value>, b: &Value) -> Option<Ordering> {
  match (a?, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (x, y) if x == y => Some(Ordering::Equal),
    _ => None,
  }
}

fn matches(filter: &Filter, row: &Record) -> bool {
  let is_null = |field: &str| row.get(field).is_none_or(Value::is_null);
  match filter {
    Filter::All => true,
    Filter::Eq { field, value } => compare(row.get(field), value) == Some(Ordering::Equal),
    Filter::Ne { field, value } => compare(row.get(field), value) != Some(Ordering::Equal),
    Filter::Gt { field, value } => compare(row.get(field), value) == Some(Ordering::Greater),
    Filter::Gte { field, value } => matches!(
      compare(row.get(field), value),
      Some(Ordering::Greater | Ordering::Equal)
    ),
    Filter::Lt { field, value } => compare(row.get(field), value) == Some(Ordering::Less),
    Filter::Lte { field, value } => matches!(
      compare(row.get(field), value),
      Some(Ordering::Less | Ordering::Equal)
    ),
    Filter::In { field, values } => values
      .iter()
      .any(|v| compare(row.get(field), v) == Some(Ordering::Equal)),
    Filter::IsNull { field } => is_null(field),
    Filter::NotNull { field } => !is_null(field),
    Filter::And { filters } => filters.iter().all(|f| matches(f, row)),
    Filter::Or { filters } => filters.iter().any(|f| matches(f, row)),
  }
}
