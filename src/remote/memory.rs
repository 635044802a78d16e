//! In-process remote backend.
//!
//! Keeps tables as vectors of JSON rows and implements the same query
//! semantics as the HTTP backend. Counts calls per operation and can be told
//! to fail, which is what the sync tests drive it with.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::backend::{format_timestamp, ChangeEvent, ChangeKind, ChannelFilter, RemoteBackend};
use super::query::{Predicate, SelectRequest, SelectResponse, SortOrder};
use crate::error::RemoteError;
use crate::model::remote_types::row_id;

type Result<T> = std::result::Result<T, RemoteError>;

/// Number of calls seen per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
  pub select: usize,
  pub insert: usize,
  pub update: usize,
  pub delete: usize,
}

impl CallCounts {
  pub fn writes(&self) -> usize {
    self.insert + self.update + self.delete
  }

  pub fn total(&self) -> usize {
    self.select + self.writes()
  }
}

struct Channel {
  table: String,
  filter: Option<ChannelFilter>,
  tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryState {
  tables: BTreeMap<String, Vec<Value>>,
  calls: CallCounts,
  /// Writes still allowed before every further write fails
  writes_before_failure: Option<usize>,
  unreachable: bool,
  channels: Vec<Channel>,
}

impl MemoryState {
  fn check_reachable(&self) -> Result<()> {
    if self.unreachable {
      return Err(RemoteError::Status {
        status: 503,
        body: "remote unreachable".to_string(),
      });
    }
    Ok(())
  }

  fn check_write(&mut self) -> Result<()> {
    self.check_reachable()?;
    match self.writes_before_failure {
      Some(0) => Err(RemoteError::Status {
        status: 500,
        body: "injected write failure".to_string(),
      }),
      Some(ref mut n) => {
        *n -= 1;
        Ok(())
      }
      None => Ok(()),
    }
  }

  fn notify(&mut self, kind: ChangeKind, table: &str, record: &Value) {
    self.channels.retain(|channel| {
      if channel.table != table {
        return !channel.tx.is_closed();
      }
      if let Some(filter) = &channel.filter {
        if !filter.matches(record) {
          return !channel.tx.is_closed();
        }
      }
      channel
        .tx
        .send(ChangeEvent {
          kind,
          table: table.to_string(),
          record: record.clone(),
        })
        .is_ok()
    });
  }
}

/// Remote backend that lives in process memory.
#[derive(Default)]
pub struct MemoryRemote {
  state: Mutex<MemoryState>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Insert rows directly, bypassing call counting and change feeds.
  pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
    let mut state = self.state();
    let stored = state.tables.entry(table.to_string()).or_default();
    for row in rows {
      stored.push(stamp_new_row(row));
    }
  }

  /// Current rows of `table`.
  pub fn rows(&self, table: &str) -> Vec<Value> {
    self.state().tables.get(table).cloned().unwrap_or_default()
  }

  pub fn calls(&self) -> CallCounts {
    self.state().calls
  }

  pub fn reset_calls(&self) {
    self.state().calls = CallCounts::default();
  }

  /// Let `n` more writes succeed, then fail every write until [`Self::clear_failures`].
  pub fn fail_writes_after(&self, n: usize) {
    self.state().writes_before_failure = Some(n);
  }

  /// Fail every call, reads included.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.state().unreachable = unreachable;
  }

  pub fn clear_failures(&self) {
    let mut state = self.state();
    state.writes_before_failure = None;
    state.unreachable = false;
  }

  /// Number of change feeds whose receiver is still alive.
  pub fn open_channels(&self) -> usize {
    let mut state = self.state();
    state.channels.retain(|c| !c.tx.is_closed());
    state.channels.len()
  }
}

/// Give a new row an id and timestamps unless it already has them.
fn stamp_new_row(row: Value) -> Value {
  let mut map = match row {
    Value::Object(map) => map,
    other => {
      let mut map = Map::new();
      map.insert("value".to_string(), other);
      map
    }
  };
  let now = Value::String(format_timestamp(Utc::now()));
  map
    .entry("id")
    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
  map.entry("created_at").or_insert_with(|| now.clone());
  map.entry("updated_at").or_insert(now);
  Value::Object(map)
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value.as_str()?)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

/// Total order over JSON scalars: nulls first, then by type, timestamps as instants.
fn compare_values(a: &Value, b: &Value) -> Ordering {
  if let (Some(x), Some(y)) = (as_datetime(a), as_datetime(b)) {
    return x.cmp(&y);
  }
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(Ordering::Equal),
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

fn type_rank(value: &Value) -> u8 {
  match value {
    Value::Null => 0,
    Value::Bool(_) => 1,
    Value::Number(_) => 2,
    Value::String(_) => 3,
    Value::Array(_) => 4,
    Value::Object(_) => 5,
  }
}

/// Loose equality: `"42"` equals `42`, matching how query strings compare.
fn values_equal(a: &Value, b: &Value) -> bool {
  if a == b {
    return true;
  }
  match (a, b) {
    (Value::String(s), other) | (other, Value::String(s)) if !other.is_null() => {
      *s == other.to_string()
    }
    _ => false,
  }
}

fn matches(row: &Value, predicate: &Predicate) -> bool {
  let field = |column: &str| row.get(column).unwrap_or(&Value::Null).clone();
  match predicate {
    Predicate::Eq(column, value) => values_equal(&field(column), value),
    Predicate::In(column, values) => {
      let actual = field(column);
      values.iter().any(|v| values_equal(&actual, v))
    }
    Predicate::Gt(column, value) => {
      let actual = field(column);
      !actual.is_null() && compare_values(&actual, value) == Ordering::Greater
    }
    Predicate::Gte(column, value) => {
      let actual = field(column);
      !actual.is_null() && compare_values(&actual, value) != Ordering::Less
    }
    Predicate::Search { fields, term } => {
      let needle = term.to_lowercase();
      fields.iter().any(|f| {
        row
          .get(f)
          .and_then(Value::as_str)
          .is_some_and(|s| s.to_lowercase().contains(&needle))
      })
    }
  }
}

fn not_found(table: &str, id: &str) -> RemoteError {
  RemoteError::NotFound {
    table: table.to_string(),
    id: id.to_string(),
  }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
  async fn select(&self, table: &str, request: &SelectRequest) -> Result<SelectResponse> {
    let mut state = self.state();
    state.calls.select += 1;
    state.check_reachable()?;

    let mut rows: Vec<Value> = state
      .tables
      .get(table)
      .map(|rows| {
        rows
          .iter()
          .filter(|row| request.predicates.iter().all(|p| matches(row, p)))
          .cloned()
          .collect()
      })
      .unwrap_or_default();
    let count = rows.len() as u64;

    if let Some((column, order)) = &request.order {
      rows.sort_by(|a, b| {
        let ord = compare_values(
          a.get(column).unwrap_or(&Value::Null),
          b.get(column).unwrap_or(&Value::Null),
        );
        match order {
          SortOrder::Asc => ord,
          SortOrder::Desc => ord.reverse(),
        }
      });
    }

    let rows = rows
      .into_iter()
      .skip(request.offset)
      .take(request.limit.unwrap_or(usize::MAX))
      .collect();

    Ok(SelectResponse { rows, count })
  }

  async fn insert(&self, table: &str, record: Value) -> Result<Value> {
    let mut state = self.state();
    state.calls.insert += 1;
    state.check_write()?;

    let row = stamp_new_row(record);
    state
      .tables
      .entry(table.to_string())
      .or_default()
      .push(row.clone());
    state.notify(ChangeKind::Insert, table, &row);
    Ok(row)
  }

  async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value> {
    let mut state = self.state();
    state.calls.update += 1;
    state.check_write()?;

    let row = state
      .tables
      .get_mut(table)
      .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id)))
      .ok_or_else(|| not_found(table, id))?;

    if let (Value::Object(target), Value::Object(patch)) = (&mut *row, changes) {
      for (key, value) in patch {
        if key != "id" {
          target.insert(key, value);
        }
      }
      target.insert(
        "updated_at".to_string(),
        Value::String(format_timestamp(Utc::now())),
      );
    }
    let updated = row.clone();
    state.notify(ChangeKind::Update, table, &updated);
    Ok(updated)
  }

  async fn delete(&self, table: &str, id: &str) -> Result<Value> {
    let mut state = self.state();
    state.calls.delete += 1;
    state.check_write()?;

    let rows = state
      .tables
      .get_mut(table)
      .ok_or_else(|| not_found(table, id))?;
    let position = rows
      .iter()
      .position(|r| row_id(r).as_deref() == Some(id))
      .ok_or_else(|| not_found(table, id))?;
    let removed = rows.remove(position);
    state.notify(ChangeKind::Delete, table, &removed);
    Ok(removed)
  }

  async fn open_channel(
    &self,
    table: &str,
    filter: Option<&ChannelFilter>,
  ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
    let mut state = self.state();
    state.check_reachable()?;

    let (tx, rx) = mpsc::unbounded_channel();
    state.channels.push(Channel {
      table: table.to_string(),
      filter: filter.cloned(),
      tx,
    });
    Ok(rx)
  }
}
