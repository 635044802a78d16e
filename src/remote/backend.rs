//! Remote backend trait and the PostgREST-style HTTP implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::query::{Predicate, SelectRequest, SelectResponse, SortOrder};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

type Result<T> = std::result::Result<T, RemoteError>;

/// Kind of change delivered on a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A change pushed on a realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub kind: ChangeKind,
  pub table: String,
  pub record: Value,
}

/// Channel filter of the form `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
  pub column: String,
  pub value: String,
}

impl ChannelFilter {
  pub fn parse(expr: &str) -> Result<Self> {
    let (column, rest) = expr
      .split_once('=')
      .ok_or_else(|| RemoteError::InvalidFilter(expr.to_string()))?;
    let value = rest
      .strip_prefix("eq.")
      .ok_or_else(|| RemoteError::InvalidFilter(expr.to_string()))?;
    if column.is_empty() {
      return Err(RemoteError::InvalidFilter(expr.to_string()));
    }

    Ok(Self {
      column: column.to_string(),
      value: value.to_string(),
    })
  }

  /// Whether `record` passes this filter. Values compare by their text form.
  pub fn matches(&self, record: &Value) -> bool {
    match record.get(&self.column) {
      Some(Value::String(s)) => *s == self.value,
      Some(Value::Null) | None => false,
      Some(other) => other.to_string() == self.value,
    }
  }
}

/// Transport seam of the remote query layer.
///
/// Implementations run one remote call per method and report failures as
/// [`RemoteError`]; they do no caching of their own.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
  async fn select(&self, table: &str, request: &SelectRequest) -> Result<SelectResponse>;

  /// Insert one row and return it as stored.
  async fn insert(&self, table: &str, record: Value) -> Result<Value>;

  /// Patch the row with `id` and return it. Missing rows yield [`RemoteError::NotFound`].
  async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value>;

  /// Delete the row with `id` and return it. Missing rows yield [`RemoteError::NotFound`].
  async fn delete(&self, table: &str, id: &str) -> Result<Value>;

  /// Open a live change feed for `table`. The feed ends when the receiver is dropped.
  async fn open_channel(
    &self,
    table: &str,
    filter: Option<&ChannelFilter>,
  ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>>;
}

/// Format a timestamp the way rows store it.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
  time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// HTTP backend for a PostgREST-compatible API (`{url}/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestBackend {
  client: reqwest::Client,
  base: Url,
  poll_interval: Duration,
}

impl RestBackend {
  pub fn new(config: &RemoteConfig, api_key: &str) -> Result<Self> {
    let mut headers = HeaderMap::new();
    let key = HeaderValue::from_str(api_key)
      .map_err(|e| RemoteError::Rejected(format!("invalid api key header: {}", e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| RemoteError::Rejected(format!("invalid api key header: {}", e)))?;
    headers.insert("apikey", key);
    headers.insert(reqwest::header::AUTHORIZATION, bearer);

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;

    let mut base = Url::parse(&config.url)?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let base = base.join("rest/v1/")?;

    Ok(Self {
      client,
      base,
      poll_interval: Duration::from_secs(config.realtime_poll_secs.max(1)),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    Ok(self.base.join(table)?)
  }

  fn id_url(&self, table: &str, id: &str) -> Result<Url> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));
    Ok(url)
  }

  async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
      status: status.as_u16(),
      body,
    })
  }

  /// First row of a `return=representation` response.
  async fn single_row(response: reqwest::Response, table: &str, id: &str) -> Result<Value> {
    let rows: Vec<Value> = Self::check(response).await?.json().await?;
    rows.into_iter().next().ok_or_else(|| RemoteError::NotFound {
      table: table.to_string(),
      id: id.to_string(),
    })
  }
}

/// Render a value for a PostgREST operator argument.
fn render_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Quote a value for use inside `in.(...)` or `or=(...)` lists.
fn quote(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Append PostgREST query parameters for `request` to `url`.
fn apply_request(url: &mut Url, request: &SelectRequest) {
  let mut pairs = url.query_pairs_mut();
  pairs.append_pair("select", "*");

  for predicate in &request.predicates {
    match predicate {
      Predicate::Eq(column, value) => {
        pairs.append_pair(column, &format!("eq.{}", render_value(value)));
      }
      Predicate::In(column, values) => {
        let list: Vec<String> = values.iter().map(|v| quote(&render_value(v))).collect();
        pairs.append_pair(column, &format!("in.({})", list.join(",")));
      }
      Predicate::Gt(column, value) => {
        pairs.append_pair(column, &format!("gt.{}", render_value(value)));
      }
      Predicate::Gte(column, value) => {
        pairs.append_pair(column, &format!("gte.{}", render_value(value)));
      }
      Predicate::Search { fields, term } => {
        let pattern = quote(&format!("*{}*", term));
        let clauses: Vec<String> = fields
          .iter()
          .map(|f| format!("{}.ilike.{}", f, pattern))
          .collect();
        pairs.append_pair("or", &format!("({})", clauses.join(",")));
      }
    }
  }

  if let Some((column, order)) = &request.order {
    let dir = match order {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    };
    pairs.append_pair("order", &format!("{}.{}", column, dir));
  }
  if request.offset > 0 {
    pairs.append_pair("offset", &request.offset.to_string());
  }
  if let Some(limit) = request.limit {
    pairs.append_pair("limit", &limit.to_string());
  }
}

/// Total from a `Content-Range` header such as `0-9/42` or `*/0`.
fn parse_content_range(header: &str) -> Option<u64> {
  header.rsplit_once('/')?.1.parse().ok()
}

#[async_trait]
impl RemoteBackend for RestBackend {
  async fn select(&self, table: &str, request: &SelectRequest) -> Result<SelectResponse> {
    let mut url = self.table_url(table)?;
    apply_request(&mut url, request);

    let response = self
      .client
      .get(url)
      .header("Prefer", "count=exact")
      .send()
      .await?;
    let response = Self::check(response).await?;

    let count_header = response
      .headers()
      .get(reqwest::header::CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_content_range);
    let rows: Vec<Value> = response.json().await?;
    let count = count_header.unwrap_or(rows.len() as u64);

    Ok(SelectResponse { rows, count })
  }

  async fn insert(&self, table: &str, record: Value) -> Result<Value> {
    let response = self
      .client
      .post(self.table_url(table)?)
      .header("Prefer", "return=representation")
      .json(&record)
      .send()
      .await?;
    let rows: Vec<Value> = Self::check(response).await?.json().await?;
    rows
      .into_iter()
      .next()
      .ok_or_else(|| RemoteError::InvalidResponse(format!("insert into {} returned no row", table)))
  }

  async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value> {
    let response = self
      .client
      .patch(self.id_url(table, id)?)
      .header("Prefer", "return=representation")
      .json(&changes)
      .send()
      .await?;
    Self::single_row(response, table, id).await
  }

  async fn delete(&self, table: &str, id: &str) -> Result<Value> {
    let response = self
      .client
      .delete(self.id_url(table, id)?)
      .header("Prefer", "return=representation")
      .send()
      .await?;
    Self::single_row(response, table, id).await
  }

  /// Emulates a change feed by polling for rows whose `updated_at` advanced.
  /// Deletes are not observable this way.
  async fn open_channel(
    &self,
    table: &str,
    filter: Option<&ChannelFilter>,
  ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = self.clone();
    let table = table.to_string();
    let filter = filter.cloned();

    tokio::spawn(async move {
      let mut since = format_timestamp(Utc::now());
      let mut ticker = tokio::time::interval(backend.poll_interval);
      ticker.tick().await;

      loop {
        ticker.tick().await;
        if tx.is_closed() {
          break;
        }

        let mut predicates = vec![Predicate::Gt("updated_at".into(), Value::String(since.clone()))];
        if let Some(f) = &filter {
          predicates.push(Predicate::Eq(f.column.clone(), Value::String(f.value.clone())));
        }
        let request = SelectRequest {
          predicates,
          order: Some(("updated_at".into(), SortOrder::Asc)),
          offset: 0,
          limit: None,
        };

        let rows = match backend.select(&table, &request).await {
          Ok(response) => response.rows,
          Err(e) => {
            warn!(table = %table, error = %e, "realtime poll failed");
            continue;
          }
        };

        for record in rows {
          if let Some(updated) = record.get("updated_at").and_then(Value::as_str) {
            if updated > since.as_str() {
              since = updated.to_string();
            }
          }
          let kind = if record.get("created_at") == record.get("updated_at") {
            ChangeKind::Insert
          } else {
            ChangeKind::Update
          };
          let event = ChangeEvent {
            kind,
            table: table.clone(),
            record,
          };
          if tx.send(event).is_err() {
            debug!(table = %table, "realtime channel closed");
            return;
          }
        }
      }
    });

    Ok(rx)
  }
}
