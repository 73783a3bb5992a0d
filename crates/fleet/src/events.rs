//! Explicit subscription registries used instead of ambient event emitters.
//!
//! Subscribers are invoked synchronously on the emitting thread, in
//! subscription order. A subscriber that errors or panics is logged and
//! skipped; the remaining subscribers still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscribers<E> {
  next_id: AtomicU64,
  entries: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for Subscribers<E> {
  fn default() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      entries: RwLock::new(Vec::new()),
    }
  }
}

impl<E> Subscribers<E> {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
  where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.entries.write().push((id, Arc::new(callback)));
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut entries = self.entries.write();
    let before = entries.len();
    entries.retain(|(sid, _)| *sid != id);
    entries.len() != before
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.read().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Deliver `event` to every subscriber and return how many accepted it.
  pub fn emit(&self, event: &E) -> usize {
    // Snapshot the list so callbacks may (un)subscribe without deadlocking.
    let callbacks: Vec<(SubscriptionId, Callback<E>)> = self.entries.read().clone();
    let mut delivered = 0;
    for (id, callback) in callbacks {
      match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => delivered += 1,
        Ok(Err(err)) => warn!("subscriber {id:?} failed: {err:#}"),
        Err(_) => warn!("subscriber {id:?} panicked"),
      }
    }
    delivered
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  CheckScheduled,
  CheckExecuted,
  MessageDelivered,
}

impl EventKind {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Self::CheckScheduled => "check_scheduled",
      Self::CheckExecuted => "check_executed",
      Self::MessageDelivered => "message_delivered",
    }
  }
}

/// Observation emitted by the schedulers for the real-time layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerEvent {
  pub kind: EventKind,
  pub entity_id: Option<String>,
  pub scheduled_message_id: Option<String>,
  pub target_session: String,
  pub timestamp: DateTime<Utc>,
  pub success: bool,
  pub detail: Option<String>,
}

impl SchedulerEvent {
  #[must_use]
  pub fn for_entity(kind: EventKind, entity_id: &str, target_session: &str) -> Self {
    Self {
      kind,
      entity_id: Some(entity_id.to_string()),
      scheduled_message_id: None,
      target_session: target_session.to_string(),
      timestamp: Utc::now(),
      success: true,
      detail: None,
    }
  }

  #[must_use]
  pub fn for_message(message_id: &str, target_session: &str) -> Self {
    Self {
      kind: EventKind::MessageDelivered,
      entity_id: None,
      scheduled_message_id: Some(message_id.to_string()),
      target_session: target_session.to_string(),
      timestamp: Utc::now(),
      success: true,
      detail: None,
    }
  }

  #[must_use]
  pub fn with_outcome(mut self, success: bool, detail: Option<String>) -> Self {
    self.success = success;
    self.detail = detail;
    self
  }
}

/// Pane content observed by the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
  pub session: String,
  pub content: String,
  pub observed_at: DateTime<Utc>,
}
