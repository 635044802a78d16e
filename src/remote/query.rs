//! Query options accepted by the remote layer and the request shape passed to backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Page size used when the caller does not give one.
pub const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  Asc,
  #[default]
  Desc,
}

/// A filter value: equality for a scalar, "is one of" for a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  AnyOf(Vec<Value>),
  Eq(Value),
}

impl From<Value> for FilterValue {
  fn from(value: Value) -> Self {
    match value {
      Value::Array(values) => FilterValue::AnyOf(values),
      other => FilterValue::Eq(other),
    }
  }
}

impl From<&str> for FilterValue {
  fn from(value: &str) -> Self {
    FilterValue::Eq(Value::String(value.to_string()))
  }
}

impl From<String> for FilterValue {
  fn from(value: String) -> Self {
    FilterValue::Eq(Value::String(value))
  }
}

/// Options for [`super::RemoteQueryLayer::query`].
///
/// Filters are kept in a `BTreeMap` so the serialized form, and therefore the
/// cache key, does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
  pub page: Option<u32>,
  pub limit: Option<u32>,
  pub sort_by: Option<String>,
  pub sort_order: Option<SortOrder>,
  #[serde(default)]
  pub filters: BTreeMap<String, FilterValue>,
  pub search: Option<String>,
  #[serde(default)]
  pub search_fields: Vec<String>,
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn page(mut self, page: u32) -> Self {
    self.page = Some(page);
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn sort(mut self, column: impl Into<String>, order: SortOrder) -> Self {
    self.sort_by = Some(column.into());
    self.sort_order = Some(order);
    self
  }

  pub fn filter(mut self, column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    self.filters.insert(column.into(), value.into());
    self
  }

  pub fn search<I, S>(mut self, term: impl Into<String>, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.search = Some(term.into());
    self.search_fields = fields.into_iter().map(Into::into).collect();
    self
  }

  pub(crate) fn effective_page(&self) -> u32 {
    self.page.unwrap_or(1).max(1)
  }

  pub(crate) fn effective_limit(&self) -> u32 {
    self.limit.unwrap_or(DEFAULT_LIMIT).max(1)
  }

  /// Translate into the backend request for one page.
  pub(crate) fn to_request(&self) -> SelectRequest {
    let page = self.effective_page();
    let limit = self.effective_limit();

    let mut predicates: Vec<Predicate> = self
      .filters
      .iter()
      .map(|(column, value)| match value {
        FilterValue::AnyOf(values) => Predicate::In(column.clone(), values.clone()),
        FilterValue::Eq(value) => Predicate::Eq(column.clone(), value.clone()),
      })
      .collect();

    if let Some(term) = self.search.as_deref().filter(|t| !t.trim().is_empty()) {
      if !self.search_fields.is_empty() {
        predicates.push(Predicate::Search {
          fields: self.search_fields.clone(),
          term: term.trim().to_string(),
        });
      }
    }

    SelectRequest {
      predicates,
      order: self
        .sort_by
        .clone()
        .map(|column| (column, self.sort_order.unwrap_or_default())),
      offset: usize::try_from(u64::from(page - 1) * u64::from(limit)).unwrap_or(usize::MAX),
      limit: Some(limit as usize),
    }
  }
}

/// Caching behaviour for a single query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
  /// Consult and populate the cache with this time-to-live. `None` bypasses the cache.
  pub ttl: Option<Duration>,
}

impl CacheOptions {
  pub fn none() -> Self {
    Self { ttl: None }
  }

  pub fn ttl(ttl: Duration) -> Self {
    Self { ttl: Some(ttl) }
  }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse<T> {
  pub data: Vec<T>,
  pub count: u64,
  pub page: u32,
  pub limit: u32,
  pub total_pages: u32,
  pub has_more: bool,
}

impl<T> QueryResponse<T> {
  pub(crate) fn new(data: Vec<T>, count: u64, page: u32, limit: u32) -> Self {
    let total_pages = u32::try_from(count.div_ceil(u64::from(limit.max(1)))).unwrap_or(u32::MAX);
    Self {
      data,
      count,
      page,
      limit,
      total_pages,
      has_more: page < total_pages,
    }
  }
}

/// A single row predicate understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
  Eq(String, Value),
  In(String, Vec<Value>),
  Gt(String, Value),
  Gte(String, Value),
  /// Case-insensitive "contains" on any of `fields`
  Search { fields: Vec<String>, term: String },
}

/// Backend-level select request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectRequest {
  pub predicates: Vec<Predicate>,
  pub order: Option<(String, SortOrder)>,
  pub offset: usize,
  /// `Some(0)` asks for the count only
  pub limit: Option<usize>,
}

/// Rows of one select plus the total count of matching rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectResponse {
  pub rows: Vec<Value>,
  pub count: u64,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_defaults_to_first_page_of_ten() {
    let request = QueryOptions::new().to_request();
    assert_eq!(request.offset, 0);
    assert_eq!(request.limit, Some(10));
    assert!(request.order.is_none());
  }

  #[test]
  fn test_page_offset() {
    let request = QueryOptions::new().page(3).limit(20).to_request();
    assert_eq!(request.offset, 40);
    assert_eq!(request.limit, Some(20));
  }

  #[test]
  fn test_last_possible_page_does_not_overflow() {
    let request = QueryOptions::new().page(u32::MAX).limit(u32::MAX).to_request();
    let expected = u64::from(u32::MAX - 1) * u64::from(u32::MAX);
    assert_eq!(request.offset as u64, expected.min(usize::MAX as u64));
  }

  #[test]
  fn test_sequence_filter_becomes_in() {
    let request = QueryOptions::new()
      .filter("category_id", json!(["a", "b"]))
      .filter("name", "rg")
      .to_request();

    assert!(request
      .predicates
      .contains(&Predicate::In("category_id".into(), vec![json!("a"), json!("b")])));
    assert!(request
      .predicates
      .contains(&Predicate::Eq("name".into(), json!("rg"))));
  }

  #[test]
  fn test_blank_search_is_ignored() {
    let request = QueryOptions::new().search("  ", ["name"]).to_request();
    assert!(request.predicates.is_empty());
  }

  #[test]
  fn test_total_pages_and_has_more() {
    let response = QueryResponse::<()>::new(vec![], 21, 2, 10);
    assert_eq!(response.total_pages, 3);
    assert!(response.has_more);

    let last = QueryResponse::<()>::new(vec![], 20, 2, 10);
    assert_eq!(last.total_pages, 2);
    assert!(!last.has_more);

    let empty = QueryResponse::<()>::new(vec![], 0, 1, 10);
    assert_eq!(empty.total_pages, 0);
    assert!(!empty.has_more);

    let huge = QueryResponse::<()>::new(vec![], u64::MAX, 1, 1);
    assert_eq!(huge.total_pages, u32::MAX);
    assert!(huge.has_more);
  }
}
