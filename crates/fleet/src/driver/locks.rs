use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

/// One write lock per session name.
///
/// Writers to the same session run one after another; writers to different
/// sessions never contend beyond the short map lookup. Locks are reentrant so
/// a caller may hold a session across several driver calls.
#[derive(Default)]
pub struct SessionLocks {
  locks: Mutex<HashMap<String, Arc<ReentrantMutex<()>>>>,
}

impl SessionLocks {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_session<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
    let lock = {
      let mut locks = self.locks.lock();
      locks
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
        .clone()
    };
    let _guard = lock.lock();
    f()
  }

  /// Drop the lock entry of a session that no longer exists.
  ///
  /// An entry someone still holds or waits on stays, so later writers keep
  /// queueing on the same lock.
  pub fn forget(&self, name: &str) {
    let mut locks = self.locks.lock();
    if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      locks.remove(name);
    }
  }

  /// Drop idle entries of sessions for which `live` is false.
  pub fn retain_live(&self, live: impl Fn(&str) -> bool) {
    self
      .locks
      .lock()
      .retain(|name, lock| live(name) || Arc::strong_count(lock) > 1);
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.locks.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
