use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use parking_lot::Mutex;

use crate::events::{OutputEvent, Subscribers};

/// Remembers the last captured content per session and notifies subscribers
/// only when it changes.
#[derive(Default)]
pub(crate) struct OutputTracker {
  last: Mutex<HashMap<String, u64>>,
  pub(crate) subscribers: Subscribers<OutputEvent>,
}

impl OutputTracker {
  pub(crate) fn observe(&self, session: &str, content: &str) {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    let digest = hasher.finish();
    let changed = self.last.lock().insert(session.to_string(), digest) != Some(digest);
    if changed && !self.subscribers.is_empty() {
      self.subscribers.emit(&OutputEvent {
        session: session.to_string(),
        content: content.to_string(),
        observed_at: Utc::now(),
      });
    }
  }

  pub(crate) fn forget(&self, session: &str) {
    self.last.lock().remove(session);
  }

  pub(crate) fn retain_live(&self, live: impl Fn(&str) -> bool) {
    self.last.lock().retain(|session, _| live(session));
  }

  #[cfg(test)]
  pub(crate) fn tracked(&self) -> usize {
    self.last.lock().len()
  }
}
