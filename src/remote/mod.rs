//! Generic remote query layer.
//!
//! Wraps any [`RemoteBackend`] with paginated queries, a TTL result cache,
//! write-through invalidation and realtime subscriptions. Each layer is an
//! explicitly constructed instance; its cache and channels are its own and are
//! released by [`RemoteQueryLayer::dispose`].
//!
//! Writes invalidate coarsely: every cached query whose key contains the
//! table name is evicted, which is a superset of the queries that could
//! observe the write.

mod backend;
mod cache;
#[cfg(any(test, feature = "test-support"))]
mod memory;
mod query;
mod realtime;

pub use backend::{
  format_timestamp, ChangeEvent, ChangeKind, ChannelFilter, RemoteBackend, RestBackend,
};
pub use cache::{cache_key, CacheEntry, QueryCache};
#[cfg(any(test, feature = "test-support"))]
pub use memory::{CallCounts, MemoryRemote};
pub use query::{
  CacheOptions, FilterValue, Predicate, QueryOptions, QueryResponse, SelectRequest,
  SelectResponse, SortOrder, DEFAULT_LIMIT,
};
pub use realtime::{ChangeCallback, SubscriptionHandle, SubscriptionInfo};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::model::remote_types::reserialize;
use realtime::ChannelRegistry;

type Result<T> = std::result::Result<T, RemoteError>;

/// Table read by [`RemoteQueryLayer::health_check`] unless configured otherwise.
pub const DEFAULT_HEALTH_TABLE: &str = "categories";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
  pub status: HealthStatus,
  #[serde(rename = "latencyMs")]
  pub latency_ms: u128,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
  pub total: u64,
  pub created_last_24h: u64,
  pub last_updated: Option<String>,
}

struct LayerInner {
  backend: Arc<dyn RemoteBackend>,
  cache: QueryCache,
  channels: Arc<ChannelRegistry>,
  health_table: String,
}

/// Query layer over one remote backend. Clones share cache and channels.
#[derive(Clone)]
pub struct RemoteQueryLayer {
  inner: Arc<LayerInner>,
}

impl RemoteQueryLayer {
  pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
    Self::with_health_table(backend, DEFAULT_HEALTH_TABLE)
  }

  pub fn with_health_table(backend: Arc<dyn RemoteBackend>, health_table: &str) -> Self {
    Self {
      inner: Arc::new(LayerInner {
        backend,
        cache: QueryCache::new(),
        channels: Arc::new(ChannelRegistry::default()),
        health_table: health_table.to_string(),
      }),
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.inner.cache
  }

  /// Run a filtered, sorted, paginated query.
  ///
  /// The cache is only consulted when `cache.ttl` is set; a fetched page is
  /// then written back under the same key with that ttl, unless the cache was
  /// invalidated while the fetch was in flight.
  pub async fn query(
    &self,
    table: &str,
    options: &QueryOptions,
    cache: CacheOptions,
  ) -> Result<QueryResponse<Value>> {
    let key = cache_key(table, options);

    if cache.ttl.is_some() {
      if let Some(hit) = self.inner.cache.get(&key) {
        debug!(table, key = %key, "query served from cache");
        return Ok(hit);
      }
    }

    let generation = self.inner.cache.generation();
    let request = options.to_request();
    let selected = self.inner.backend.select(table, &request).await?;
    let response = QueryResponse::new(
      selected.rows,
      selected.count,
      options.effective_page(),
      options.effective_limit(),
    );

    if let Some(ttl) = cache.ttl {
      self
        .inner
        .cache
        .insert_if_unchanged(key, response.clone(), ttl, generation);
    }
    Ok(response)
  }

  /// [`Self::query`] with rows converted to `T`.
  pub async fn query_as<T: DeserializeOwned>(
    &self,
    table: &str,
    options: &QueryOptions,
    cache: CacheOptions,
  ) -> Result<QueryResponse<T>> {
    let page = self.query(table, options, cache).await?;
    let data = page
      .data
      .into_iter()
      .map(reserialize)
      .collect::<serde_json::Result<Vec<T>>>()?;
    Ok(QueryResponse {
      data,
      count: page.count,
      page: page.page,
      limit: page.limit,
      total_pages: page.total_pages,
      has_more: page.has_more,
    })
  }

  /// First row where `column` equals `value`, bypassing the cache.
  pub async fn find_one(&self, table: &str, column: &str, value: &str) -> Result<Option<Value>> {
    let options = QueryOptions::new().filter(column, value).limit(1);
    let page = self.query(table, &options, CacheOptions::none()).await?;
    Ok(page.data.into_iter().next())
  }

  /// Every row of `table`, fetched page by page without caching.
  pub async fn fetch_all(&self, table: &str, page_size: u32) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    let mut page = 1;
    loop {
      let options = QueryOptions::new().page(page).limit(page_size);
      let response = self.query(table, &options, CacheOptions::none()).await?;
      rows.extend(response.data);
      if !response.has_more {
        break;
      }
      page += 1;
    }
    Ok(rows)
  }

  /// Evict every cached query of `table` (by substring). Returns the number evicted.
  pub fn invalidate_table(&self, table: &str) -> usize {
    let evicted = self.inner.cache.invalidate_table(table);
    if evicted > 0 {
      debug!(table, evicted, "invalidated cached queries");
    }
    evicted
  }

  pub async fn create(&self, table: &str, record: Value) -> Result<Value> {
    let row = self.inner.backend.insert(table, record).await?;
    self.invalidate_table(table);
    Ok(row)
  }

  pub async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value> {
    let row = self.inner.backend.update(table, id, changes).await?;
    self.invalidate_table(table);
    Ok(row)
  }

  pub async fn delete(&self, table: &str, id: &str) -> Result<Value> {
    let row = self.inner.backend.delete(table, id).await?;
    self.invalidate_table(table);
    Ok(row)
  }

  /// Create each record in turn. Invalidates even when a later item fails.
  pub async fn batch_create(&self, table: &str, records: Vec<Value>) -> Result<Vec<Value>> {
    let mut created = Vec::with_capacity(records.len());
    for record in records {
      match self.inner.backend.insert(table, record).await {
        Ok(row) => created.push(row),
        Err(e) => {
          self.invalidate_after_partial_batch(table, created.len());
          return Err(e);
        }
      }
    }
    self.invalidate_table(table);
    Ok(created)
  }

  /// Apply each `(id, changes)` in turn, one remote call per item.
  pub async fn batch_update(
    &self,
    table: &str,
    updates: Vec<(String, Value)>,
  ) -> Result<Vec<Value>> {
    let mut updated = Vec::with_capacity(updates.len());
    for (id, changes) in updates {
      match self.inner.backend.update(table, &id, changes).await {
        Ok(row) => updated.push(row),
        Err(e) => {
          self.invalidate_after_partial_batch(table, updated.len());
          return Err(e);
        }
      }
    }
    self.invalidate_table(table);
    Ok(updated)
  }

  pub async fn batch_delete(&self, table: &str, ids: Vec<String>) -> Result<Vec<Value>> {
    let mut deleted = Vec::with_capacity(ids.len());
    for id in ids {
      match self.inner.backend.delete(table, &id).await {
        Ok(row) => deleted.push(row),
        Err(e) => {
          self.invalidate_after_partial_batch(table, deleted.len());
          return Err(e);
        }
      }
    }
    self.invalidate_table(table);
    Ok(deleted)
  }

  fn invalidate_after_partial_batch(&self, table: &str, applied: usize) {
    if applied > 0 {
      warn!(table, applied, "batch stopped after partial success");
      self.invalidate_table(table);
    }
  }

  /// Subscribe to live changes on `table`, optionally filtered by `column=eq.value`.
  ///
  /// Subscriptions to the same table and filter share one backend channel.
  pub async fn subscribe_to_table<F>(
    &self,
    table: &str,
    callback: F,
    filter: Option<&str>,
  ) -> Result<SubscriptionHandle>
  where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
  {
    let parsed = filter.map(ChannelFilter::parse).transpose()?;
    let callback: ChangeCallback = Arc::new(callback);
    let channels = &self.inner.channels;

    let channel_id = ChannelRegistry::channel_id(table, filter);
    if let Some(subscriber) = channels.join(&channel_id, &callback) {
      return Ok(SubscriptionHandle::new(
        channel_id,
        subscriber,
        Arc::clone(channels),
      ));
    }

    let rx = self.inner.backend.open_channel(table, parsed.as_ref()).await?;
    let (channel_id, subscriber) = channels.track(table, filter, rx, callback);
    Ok(SubscriptionHandle::new(
      channel_id,
      subscriber,
      Arc::clone(channels),
    ))
  }

  /// Release the channel named `channel_id` with all its subscribers.
  /// Returns false if it was not tracked.
  pub fn unsubscribe(&self, channel_id: &str) -> bool {
    self.inner.channels.release(channel_id)
  }

  /// Release every tracked channel.
  pub fn unsubscribe_all(&self) -> usize {
    self.inner.channels.release_all()
  }

  pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
    self.inner.channels.list()
  }

  /// Release all channels and drop every cached query.
  pub fn dispose(&self) {
    let released = self.unsubscribe_all();
    self.inner.cache.clear();
    debug!(released, "disposed remote query layer");
  }

  /// Minimal read against the health table, timed.
  pub async fn health_check(&self) -> HealthReport {
    let request = SelectRequest {
      limit: Some(1),
      ..SelectRequest::default()
    };
    let started = Instant::now();
    let result = self
      .inner
      .backend
      .select(&self.inner.health_table, &request)
      .await;
    let latency_ms = started.elapsed().as_millis();

    match result {
      Ok(_) => HealthReport {
        status: HealthStatus::Healthy,
        latency_ms,
        error: None,
      },
      Err(e) => {
        warn!(error = %e, "remote health check failed");
        HealthReport {
          status: HealthStatus::Unhealthy,
          latency_ms,
          error: Some(e.to_string()),
        }
      }
    }
  }

  /// Row count, rows created in the last 24h and latest `updated_at`, one query each.
  pub async fn get_table_stats(&self, table: &str) -> Result<TableStats> {
    let backend = &self.inner.backend;
    let count_only = SelectRequest {
      limit: Some(0),
      ..SelectRequest::default()
    };

    let total = backend.select(table, &count_only).await?.count;

    let since = Utc::now() - ChronoDuration::hours(24);
    let recent = SelectRequest {
      predicates: vec![Predicate::Gte(
        "created_at".into(),
        Value::String(format_timestamp(since)),
      )],
      ..count_only.clone()
    };
    let created_last_24h = backend.select(table, &recent).await?.count;

    let latest = SelectRequest {
      order: Some(("updated_at".into(), SortOrder::Desc)),
      limit: Some(1),
      ..SelectRequest::default()
    };
    let last_updated = backend
      .select(table, &latest)
      .await?
      .rows
      .first()
      .and_then(|row| row.get("updated_at"))
      .and_then(Value::as_str)
      .map(String::from);

    Ok(TableStats {
      total,
      created_last_24h,
      last_updated,
    })
  }
}

impl std::fmt::Debug for RemoteQueryLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteQueryLayer")
      .field("cached_queries", &self.inner.cache.len())
      .field("channels", &self.inner.channels.list().len())
      .finish_non_exhaustive()
  }
}

/// Cache ttl helper for callers configuring in seconds.
pub fn ttl_secs(secs: u64) -> CacheOptions {
  CacheOptions::ttl(Duration::from_secs(secs))
}
