//! Realtime subscription tracking.
//!
//! One backend channel is kept per distinct `(table, filter)` pair. Further
//! subscriptions to the same pair join that channel and share its events;
//! the channel is released when its last subscriber leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::backend::ChangeEvent;

/// Callback invoked for every change delivered on a subscription.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

type Subscribers = Arc<Mutex<HashMap<u64, ChangeCallback>>>;

struct TrackedChannel {
  table: String,
  filter: Option<String>,
  subscribers: Subscribers,
  task: JoinHandle<()>,
}

/// Registry of live channels, owned by one remote layer.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
  channels: Mutex<HashMap<String, TrackedChannel>>,
  next_subscriber: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelRegistry {
  /// Name of the channel serving `table` with `filter`.
  pub(crate) fn channel_id(table: &str, filter: Option<&str>) -> String {
    format!("realtime:{}:{}", table, filter.unwrap_or("*"))
  }

  fn next_subscriber(&self) -> u64 {
    self.next_subscriber.fetch_add(1, Ordering::Relaxed)
  }

  /// Add `callback` to an already open channel. `None` if no such channel.
  pub(crate) fn join(&self, channel_id: &str, callback: &ChangeCallback) -> Option<u64> {
    let channels = lock(&self.channels);
    let channel = channels.get(channel_id)?;
    let subscriber = self.next_subscriber();
    lock(&channel.subscribers).insert(subscriber, Arc::clone(callback));
    debug!(channel = %channel_id, subscriber, "joined realtime channel");
    Some(subscriber)
  }

  /// Track a freshly opened channel and start fanning `rx` out to its subscribers.
  ///
  /// If another caller opened the same channel in the meantime, `rx` is
  /// dropped and `callback` joins the existing one.
  pub(crate) fn track(
    &self,
    table: &str,
    filter: Option<&str>,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    callback: ChangeCallback,
  ) -> (String, u64) {
    let channel_id = Self::channel_id(table, filter);
    let subscriber = self.next_subscriber();
    let mut channels = lock(&self.channels);

    if let Some(existing) = channels.get(&channel_id) {
      lock(&existing.subscribers).insert(subscriber, callback);
      debug!(channel = %channel_id, subscriber, "joined realtime channel opened concurrently");
      return (channel_id, subscriber);
    }

    let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::from([(subscriber, callback)])));
    let fan_out = Arc::clone(&subscribers);
    let task = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let callbacks: Vec<ChangeCallback> = lock(&fan_out).values().cloned().collect();
        for callback in callbacks {
          callback(event.clone());
        }
      }
    });

    channels.insert(
      channel_id.clone(),
      TrackedChannel {
        table: table.to_string(),
        filter: filter.map(String::from),
        subscribers,
        task,
      },
    );
    debug!(channel = %channel_id, subscriber, "opened realtime channel");
    (channel_id, subscriber)
  }

  /// Remove one subscriber, releasing the channel when none remain.
  pub(crate) fn leave(&self, channel_id: &str, subscriber: u64) -> bool {
    let mut channels = lock(&self.channels);
    let Some(channel) = channels.get(channel_id) else {
      return false;
    };

    let remaining = {
      let mut subscribers = lock(&channel.subscribers);
      if subscribers.remove(&subscriber).is_none() {
        return false;
      }
      subscribers.len()
    };

    if remaining == 0 {
      if let Some(channel) = channels.remove(channel_id) {
        channel.task.abort();
        debug!(channel = %channel_id, "released realtime channel");
      }
    }
    true
  }

  /// Release a channel and all of its subscribers. Returns false if it was not tracked.
  pub(crate) fn release(&self, channel_id: &str) -> bool {
    match lock(&self.channels).remove(channel_id) {
      Some(channel) => {
        channel.task.abort();
        debug!(channel = %channel_id, table = %channel.table, "released realtime channel");
        true
      }
      None => false,
    }
  }

  /// Release every channel. Returns how many were open.
  pub(crate) fn release_all(&self) -> usize {
    let drained: Vec<(String, TrackedChannel)> = lock(&self.channels).drain().collect();
    for (_, channel) in &drained {
      channel.task.abort();
    }
    drained.len()
  }

  /// Tracked channels with their table, filter and subscriber count.
  pub(crate) fn list(&self) -> Vec<SubscriptionInfo> {
    let mut list: Vec<SubscriptionInfo> = lock(&self.channels)
      .iter()
      .map(|(id, channel)| SubscriptionInfo {
        channel_id: id.clone(),
        table: channel.table.clone(),
        filter: channel.filter.clone(),
        subscribers: lock(&channel.subscribers).len(),
      })
      .collect();
    list.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    list
  }
}

/// Description of a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
  pub channel_id: String,
  pub table: String,
  pub filter: Option<String>,
  pub subscribers: usize,
}

/// Handle returned by [`super::RemoteQueryLayer::subscribe_to_table`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`SubscriptionHandle::unsubscribe`] to leave the channel.
pub struct SubscriptionHandle {
  channel_id: String,
  subscriber: u64,
  registry: Arc<ChannelRegistry>,
}

impl SubscriptionHandle {
  pub(crate) fn new(channel_id: String, subscriber: u64, registry: Arc<ChannelRegistry>) -> Self {
    Self {
      channel_id,
      subscriber,
      registry,
    }
  }

  pub fn channel_id(&self) -> &str {
    &self.channel_id
  }

  /// Stop receiving events. The channel itself is released with its last
  /// subscriber. Returns false if this subscription was already gone.
  pub fn unsubscribe(self) -> bool {
    self.registry.leave(&self.channel_id, self.subscriber)
  }
}

impl std::fmt::Debug for SubscriptionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SubscriptionHandle")
      .field("channel_id", &self.channel_id)
      .field("subscriber", &self.subscriber)
      .finish_non_exhaustive()
  }
}
