use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::{FleetConfig, FleetPaths};
use crate::driver::{SessionDriver, submit};
use crate::error::{FleetError, FleetResult};
use crate::events::{SchedulerEvent, Subscribers};

use super::store::MessageStore;
use super::types::{DeliveryLogEntry, DeliveryResult, MessageSpec, ScheduledMessage};

#[derive(Default)]
struct State {
  messages: BTreeMap<String, ScheduledMessage>,
  log: Vec<DeliveryLogEntry>,
  // Memory is ahead of disk after a delivery whose save failed.
  messages_dirty: bool,
  log_dirty: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FireMode {
  /// Fired by the tick loop because `nextRun` passed.
  Due,
  /// Fired by an operator; the schedule is left as it was.
  Manual,
}

struct Inner {
  driver: Arc<dyn SessionDriver>,
  events: Arc<Subscribers<SchedulerEvent>>,
  store: MessageStore,
  enter_delay: Duration,
  state: Mutex<State>,
  // One delivery at a time so a message can't be fired twice concurrently.
  delivery: Mutex<()>,
}

/// Durable one-shot and recurring messages, fired by a single tick loop.
pub struct MessageScheduler {
  inner: Arc<Inner>,
  tick_interval: Duration,
  ticker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl MessageScheduler {
  /// Load persisted messages and the delivery log. Ticking starts with [`Self::start`].
  pub fn open(
    driver: Arc<dyn SessionDriver>,
    events: Arc<Subscribers<SchedulerEvent>>,
    paths: &FleetPaths,
    cfg: &FleetConfig,
  ) -> FleetResult<Self> {
    let store = MessageStore::new(paths, cfg.messages.max_log_entries);
    let messages = store.load_messages()?;
    let log = store.load_log()?;
    debug!(
      "loaded {} scheduled messages and {} delivery log entries",
      messages.len(),
      log.len()
    );
    let state = State {
      messages: messages.into_iter().map(|m| (m.id.clone(), m)).collect(),
      log,
      ..State::default()
    };
    Ok(Self {
      inner: Arc::new(Inner {
        driver,
        events,
        store,
        enter_delay: Duration::from_millis(cfg.messages.enter_delay_ms),
        state: Mutex::new(state),
        delivery: Mutex::new(()),
      }),
      tick_interval: Duration::from_millis(cfg.messages.tick_ms.max(10)),
      ticker: Mutex::new(None),
    })
  }

  /// Start the tick loop. Overdue active messages fire once on the first tick.
  pub fn start(&self) -> anyhow::Result<()> {
    let mut ticker = self.ticker.lock();
    if ticker.is_some() {
      return Ok(());
    }
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let inner = Arc::clone(&self.inner);
    let interval = self.tick_interval;
    let handle = thread::Builder::new()
      .name("message-tick".into())
      .spawn(move || inner.run_ticks(interval, &stop_rx))
      .context("failed to spawn message tick thread")?;
    *ticker = Some((stop_tx, handle));
    info!("message scheduler ticking every {interval:?}");
    Ok(())
  }

  /// Stop ticking; an in-flight tick completes first.
  pub fn stop(&self) {
    let ticker = self.ticker.lock().take();
    if let Some((stop_tx, handle)) = ticker {
      drop(stop_tx);
      let _ = handle.join();
    }
  }

  #[must_use]
  pub fn is_running(&self) -> bool {
    self.ticker.lock().is_some()
  }

  pub fn create(&self, spec: MessageSpec) -> FleetResult<ScheduledMessage> {
    spec.validate()?;
    let msg = ScheduledMessage::from_spec(spec, Utc::now());
    self.inner.commit_message(msg.clone())?;
    info!("scheduled message {} ({}) created", msg.name, msg.id);
    Ok(msg)
  }

  pub fn update(&self, id: &str, spec: MessageSpec) -> FleetResult<ScheduledMessage> {
    spec.validate()?;
    self.inner.modify(id, |msg| msg.apply(spec, Utc::now()))
  }

  pub fn delete(&self, id: &str) -> FleetResult<ScheduledMessage> {
    let mut state = self.inner.state.lock();
    let mut next = state.messages.clone();
    let removed = next
      .remove(id)
      .ok_or_else(|| FleetError::MessageNotFound(id.to_string()))?;
    self.inner.persist_messages(&next)?;
    state.messages = next;
    state.messages_dirty = false;
    info!("scheduled message {} ({id}) deleted", removed.name);
    Ok(removed)
  }

  pub fn toggle(&self, id: &str, is_active: bool) -> FleetResult<ScheduledMessage> {
    self.inner.modify(id, |msg| msg.set_active(is_active, Utc::now()))
  }

  /// Deliver a message immediately, whatever its schedule.
  pub fn run_now(&self, id: &str) -> FleetResult<DeliveryResult> {
    self
      .inner
      .fire(id, FireMode::Manual)?
      .ok_or_else(|| FleetError::MessageNotFound(id.to_string()))
  }

  /// Fire every due message once, in `(nextRun, createdAt, id)` order.
  pub fn run_due(&self) -> usize {
    self.inner.tick()
  }

  pub fn get(&self, id: &str) -> FleetResult<ScheduledMessage> {
    self
      .inner
      .state
      .lock()
      .messages
      .get(id)
      .cloned()
      .ok_or_else(|| FleetError::MessageNotFound(id.to_string()))
  }

  /// All messages, oldest first.
  #[must_use]
  pub fn list(&self) -> Vec<ScheduledMessage> {
    let mut all: Vec<_> = self.inner.state.lock().messages.values().cloned().collect();
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    all
  }

  /// Delivery log, newest first, optionally capped at `limit`.
  #[must_use]
  pub fn list_delivery_logs(&self, limit: Option<usize>) -> Vec<DeliveryLogEntry> {
    let state = self.inner.state.lock();
    let take = limit.unwrap_or(state.log.len());
    state.log.iter().rev().take(take).cloned().collect()
  }

  /// Remove every delivery log entry; returns how many were dropped.
  pub fn clear_delivery_logs(&self) -> FleetResult<usize> {
    let mut state = self.inner.state.lock();
    self.inner.store.save_log(&[])?;
    let cleared = state.log.len();
    state.log.clear();
    state.log_dirty = false;
    info!("cleared {cleared} delivery log entries");
    Ok(cleared)
  }
}

impl Drop for MessageScheduler {
  fn drop(&mut self) {
    self.stop();
  }
}

fn due_order(a: &ScheduledMessage, b: &ScheduledMessage) -> std::cmp::Ordering {
  a.next_run
    .cmp(&b.next_run)
    .then_with(|| a.created_at.cmp(&b.created_at))
    .then_with(|| a.id.cmp(&b.id))
}

impl Inner {
  fn run_ticks(&self, interval: Duration, stop_rx: &Receiver<()>) {
    // The first pass doubles as catch-up for messages that came due while
    // the process was down.
    let caught_up = self.tick();
    if caught_up > 0 {
      info!("caught up on {caught_up} overdue scheduled messages");
    }
    loop {
      select! {
        recv(stop_rx) -> _ => return,
        default(interval) => {}
      }
      self.tick();
    }
  }

  fn tick(&self) -> usize {
    self.flush_dirty();
    let now = Utc::now();
    let mut due: Vec<ScheduledMessage> = self
      .state
      .lock()
      .messages
      .values()
      .filter(|m| m.is_due(now))
      .cloned()
      .collect();
    due.sort_by(due_order);
    let mut fired = 0;
    for msg in due {
      match self.fire(&msg.id, FireMode::Due) {
        Ok(Some(_)) => fired += 1,
        Ok(None) => {}
        Err(err) => error!("failed to record delivery of {}: {err}", msg.id),
      }
    }
    fired
  }

  fn persist_messages(&self, messages: &BTreeMap<String, ScheduledMessage>) -> FleetResult<()> {
    let all: Vec<ScheduledMessage> = messages.values().cloned().collect();
    self.store.save_messages(&all)
  }

  /// Insert or replace one message on disk, then in memory.
  fn commit_message(&self, msg: ScheduledMessage) -> FleetResult<()> {
    let mut state = self.state.lock();
    let mut next = state.messages.clone();
    next.insert(msg.id.clone(), msg);
    self.persist_messages(&next)?;
    state.messages = next;
    state.messages_dirty = false;
    Ok(())
  }

  /// Retry the saves that failed after a delivery.
  fn flush_dirty(&self) {
    let mut state = self.state.lock();
    if state.messages_dirty {
      match self.persist_messages(&state.messages) {
        Ok(()) => {
          state.messages_dirty = false;
          info!("scheduled messages saved after an earlier failure");
        }
        Err(err) => debug!("scheduled messages still unsaved: {err}"),
      }
    }
    if state.log_dirty {
      match self.store.save_log(&state.log) {
        Ok(()) => {
          state.log_dirty = false;
          info!("delivery log saved after an earlier failure");
        }
        Err(err) => debug!("delivery log still unsaved: {err}"),
      }
    }
  }

  /// Apply `f` to one stored message, persisting before memory changes.
  fn modify(
    &self,
    id: &str,
    f: impl FnOnce(&mut ScheduledMessage),
  ) -> FleetResult<ScheduledMessage> {
    let mut state = self.state.lock();
    let mut next = state.messages.clone();
    let msg = next
      .get_mut(id)
      .ok_or_else(|| FleetError::MessageNotFound(id.to_string()))?;
    f(msg);
    let updated = msg.clone();
    self.persist_messages(&next)?;
    state.messages = next;
    state.messages_dirty = false;
    Ok(updated)
  }

  /// Deliver one message and record the outcome.
  ///
  /// Returns `Ok(None)` when a due firing no longer applies because the
  /// message was deleted, paused or re-armed in the meantime. An edit that
  /// lands while the text is being typed keeps its new schedule.
  fn fire(&self, id: &str, mode: FireMode) -> FleetResult<Option<DeliveryResult>> {
    let _delivering = self.delivery.lock();
    let Some(msg) = self.state.lock().messages.get(id).cloned() else {
      return match mode {
        FireMode::Due => Ok(None),
        FireMode::Manual => Err(FleetError::MessageNotFound(id.to_string())),
      };
    };
    if mode == FireMode::Due && !msg.is_due(Utc::now()) {
      return Ok(None);
    }

    let outcome = submit(
      self.driver.as_ref(),
      &msg.target_session,
      &msg.message,
      self.enter_delay,
    );
    let sent_at = Utc::now();
    let error = outcome.as_ref().err().map(ToString::to_string);
    match &error {
      None => info!("delivered {} to {}", msg.name, msg.target_session),
      Some(e) => warn!("delivery of {} to {} failed: {e}", msg.name, msg.target_session),
    }

    let entry = DeliveryLogEntry {
      id: uuid::Uuid::new_v4().to_string(),
      scheduled_message_id: msg.id.clone(),
      message_name: msg.name.clone(),
      target_session: msg.target_session.clone(),
      target_project: msg.target_project.clone(),
      message: msg.message.clone(),
      sent_at,
      success: error.is_none(),
      error: error.clone(),
    };
    let result = DeliveryResult::from(&entry);

    let recorded = self.record(&msg, mode, sent_at, entry);
    self.events.emit(
      &SchedulerEvent::for_message(&msg.id, &msg.target_session).with_outcome(error.is_none(), error),
    );
    recorded?;
    Ok(Some(result))
  }

  /// Record a delivery that already happened.
  ///
  /// Memory is updated even when the store cannot be written, so a due
  /// message is never typed twice; the unsaved files are retried on the
  /// next tick.
  fn record(
    &self,
    dispatched: &ScheduledMessage,
    mode: FireMode,
    sent_at: DateTime<Utc>,
    entry: DeliveryLogEntry,
  ) -> FleetResult<()> {
    let mut state = self.state.lock();

    if let Some(current) = state.messages.get_mut(&dispatched.id) {
      match mode {
        FireMode::Due
          if current.updated_at == dispatched.updated_at
            && current.next_run == dispatched.next_run =>
        {
          current.record_fire(sent_at);
        }
        FireMode::Due => debug!("{} was edited during delivery, keeping its new schedule", dispatched.id),
        FireMode::Manual => current.last_run = Some(sent_at),
      }
    }
    state.log.push(entry);
    self.store.prune(&mut state.log);

    let messages_saved = self.persist_messages(&state.messages);
    state.messages_dirty = messages_saved.is_err();
    let log_saved = self.store.save_log(&state.log);
    state.log_dirty = log_saved.is_err();
    messages_saved.and(log_saved)
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::path::Path;

  use super::*;
  use crate::driver::MemoryDriver;
  use crate::messages::types::DelayUnit;

  struct Fixture {
    _dir: tempfile::TempDir,
    paths: FleetPaths,
    cfg: FleetConfig,
    driver: Arc<MemoryDriver>,
    sched: MessageScheduler,
  }

  fn fixture() -> Fixture {
    fixture_with(|_| {})
  }

  fn fixture_with(tune: impl FnOnce(&mut FleetConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let paths = FleetPaths::new(dir.path());
    let mut cfg = FleetConfig::default();
    cfg.messages.enter_delay_ms = 0;
    cfg.messages.tick_ms = 50;
    tune(&mut cfg);
    let driver = Arc::new(MemoryDriver::new());
    let sched =
      MessageScheduler::open(driver.clone(), Arc::new(Subscribers::new()), &paths, &cfg).unwrap();
    Fixture {
      _dir: dir,
      paths,
      cfg,
      driver,
      sched,
    }
  }

  fn spec(name: &str, session: &str, recurring: bool) -> MessageSpec {
    MessageSpec {
      name: name.into(),
      target_session: session.into(),
      target_project: None,
      message: format!("hello from {name}"),
      delay_amount: 1,
      delay_unit: DelayUnit::Hours,
      is_recurring: recurring,
      is_active: true,
    }
  }

  /// Pull a message's nextRun into the past on disk and in memory.
  fn make_due(sched: &MessageScheduler, id: &str, ago_secs: i64) {
    let mut state = sched.inner.state.lock();
    let mut next = state.messages.clone();
    if let Some(m) = next.get_mut(id) {
      m.next_run = Some(Utc::now() - chrono::Duration::seconds(ago_secs));
    }
    sched.inner.persist_messages(&next).unwrap();
    state.messages = next;
  }

  /// Put a non-empty directory where `path` lives so the atomic rename onto it fails.
  fn block(path: &Path) {
    let _ = fs::remove_file(path);
    fs::create_dir_all(path.join("in-the-way")).unwrap();
  }

  fn unblock(path: &Path) {
    fs::remove_dir_all(path).unwrap();
  }

  fn is_persistence_failure<T>(result: FleetResult<T>) -> bool {
    matches!(result, Err(FleetError::PersistenceFailure { .. }))
  }

  #[test]
  fn invalid_spec_is_rejected_before_persisting() {
    let f = fixture();
    let mut s = spec("a", "s", false);
    s.delay_amount = 0;
    assert!(matches!(f.sched.create(s), Err(FleetError::InvalidMessage(_))));
    assert!(!f.paths.messages_file().exists());
  }

  #[test]
  fn crud_round_trips_through_disk() -> FleetResult<()> {
    let f = fixture();
    let msg = f.sched.create(spec("a", "s", true))?;
    let toggled = f.sched.toggle(&msg.id, false)?;
    assert!(!toggled.is_active && toggled.next_run.is_none());
    let mut edited = spec("renamed", "s2", true);
    edited.is_active = true;
    let updated = f.sched.update(&msg.id, edited)?;
    assert_eq!(updated.created_at, msg.created_at);

    let reopened =
      MessageScheduler::open(f.driver.clone(), Arc::new(Subscribers::new()), &f.paths, &f.cfg)?;
    assert_eq!(reopened.list(), vec![updated]);

    f.sched.delete(&msg.id)?;
    assert!(matches!(f.sched.delete(&msg.id), Err(FleetError::MessageNotFound(_))));
    assert!(matches!(f.sched.run_now("nope"), Err(FleetError::MessageNotFound(_))));
    Ok(())
  }

  #[test]
  fn due_messages_fire_in_stable_order() -> FleetResult<()> {
    let f = fixture();
    f.driver.add_session("s");
    let first = f.sched.create(spec("first", "s", false))?;
    let second = f.sched.create(spec("second", "s", false))?;
    let third = f.sched.create(spec("third", "s", false))?;
    make_due(&f.sched, &third.id, 30);
    make_due(&f.sched, &first.id, 10);
    make_due(&f.sched, &second.id, 10);
    // first and second share a due time; creation order breaks the tie.
    {
      let mut state = f.sched.inner.state.lock();
      let (at, created) = {
        let m = &state.messages[&first.id];
        (m.next_run, m.created_at)
      };
      let m = state.messages.get_mut(&second.id).unwrap();
      m.next_run = at;
      m.created_at = created + chrono::Duration::seconds(1);
    }
    assert_eq!(f.sched.run_due(), 3);
    assert_eq!(
      f.driver.submitted("s"),
      vec![
        "hello from third".to_string(),
        "hello from first".to_string(),
        "hello from second".to_string(),
      ]
    );
    assert_eq!(f.sched.run_due(), 0);
    Ok(())
  }

  #[test]
  fn failed_one_shot_completes_with_failure_logged() -> FleetResult<()> {
    let f = fixture();
    let msg = f.sched.create(spec("ghost", "nobody-home", false))?;
    make_due(&f.sched, &msg.id, 1);
    f.sched.run_due();
    let after = f.sched.get(&msg.id)?;
    assert!(!after.is_active);
    let logs = f.sched.list_delivery_logs(None);
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert!(logs[0].error.as_deref().unwrap_or_default().contains("not found"));
    Ok(())
  }

  #[test]
  fn failed_recurring_stays_active_and_advances() -> FleetResult<()> {
    let f = fixture();
    let msg = f.sched.create(spec("r", "nobody-home", true))?;
    make_due(&f.sched, &msg.id, 1);
    f.sched.run_due();
    let after = f.sched.get(&msg.id)?;
    assert!(after.is_active);
    let last = after.last_run.expect("fired");
    assert_eq!(after.next_run, Some(last + after.delay()));
    Ok(())
  }

  #[test]
  fn run_now_leaves_schedule_untouched() -> FleetResult<()> {
    let f = fixture();
    f.driver.add_session("s");
    let msg = f.sched.create(spec("a", "s", false))?;
    let result = f.sched.run_now(&msg.id)?;
    assert!(result.success);
    let after = f.sched.get(&msg.id)?;
    assert!(after.is_active);
    assert_eq!(after.next_run, msg.next_run);
    assert_eq!(after.last_run, Some(result.sent_at));
    Ok(())
  }

  #[test]
  fn delivery_log_is_capped_and_clearable() -> FleetResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let paths = FleetPaths::new(dir.path());
    let mut cfg = FleetConfig::default();
    cfg.messages.enter_delay_ms = 0;
    cfg.messages.max_log_entries = 2;
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("s");
    let sched = MessageScheduler::open(driver, Arc::new(Subscribers::new()), &paths, &cfg)?;
    let msg = sched.create(spec("a", "s", true))?;
    let ids: Vec<String> = (0..3)
      .map(|_| sched.run_now(&msg.id).map(|r| r.log_entry_id))
      .collect::<FleetResult<_>>()?;
    let logs = sched.list_delivery_logs(None);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].id, ids[2]);
    assert_eq!(sched.list_delivery_logs(Some(1)).len(), 1);
    assert_eq!(sched.clear_delivery_logs()?, 2);
    assert!(sched.list_delivery_logs(None).is_empty());
    Ok(())
  }

  #[test]
  fn unsaved_fire_is_not_delivered_again() -> FleetResult<()> {
    let f = fixture();
    f.driver.add_session("s");
    let msg = f.sched.create(spec("once", "s", false))?;
    make_due(&f.sched, &msg.id, 1);
    block(&f.paths.messages_file());

    for _ in 0..3 {
      f.sched.run_due();
    }
    assert_eq!(f.driver.submitted("s"), vec!["hello from once".to_string()]);
    assert!(!f.sched.get(&msg.id)?.is_active);
    assert_eq!(f.sched.list_delivery_logs(None).len(), 1);

    // The next tick writes what the failed save left behind.
    unblock(&f.paths.messages_file());
    f.sched.run_due();
    let reopened =
      MessageScheduler::open(f.driver.clone(), Arc::new(Subscribers::new()), &f.paths, &f.cfg)?;
    let on_disk = reopened.get(&msg.id)?;
    assert!(!on_disk.is_active);
    assert!(on_disk.last_run.is_some());
    assert_eq!(f.driver.submitted("s").len(), 1);
    Ok(())
  }

  #[test]
  fn edit_during_delivery_keeps_the_new_schedule() -> FleetResult<()> {
    let f = fixture_with(|cfg| cfg.messages.enter_delay_ms = 300);
    f.driver.add_session("s");
    let msg = f.sched.create(spec("once", "s", false))?;
    make_due(&f.sched, &msg.id, 1);

    let updated = thread::scope(|scope| {
      let firing = scope.spawn(|| f.sched.run_due());
      thread::sleep(Duration::from_millis(100));
      let mut edited = spec("once", "s", false);
      edited.message = "new text".into();
      let updated = f.sched.update(&msg.id, edited);
      assert_eq!(firing.join().unwrap(), 1);
      updated
    })?;

    let after = f.sched.get(&msg.id)?;
    assert!(after.is_active);
    assert_eq!(after.next_run, updated.next_run);
    assert_eq!(after.message, "new text");
    assert_eq!(f.driver.submitted("s"), vec!["hello from once".to_string()]);
    assert_eq!(f.sched.list_delivery_logs(None).len(), 1);
    Ok(())
  }

  #[test]
  fn failed_saves_leave_memory_untouched() -> FleetResult<()> {
    let f = fixture();
    let msg = f.sched.create(spec("a", "s", true))?;
    let before = f.sched.list();
    block(&f.paths.messages_file());

    assert!(is_persistence_failure(f.sched.create(spec("b", "s", true))));
    assert!(is_persistence_failure(f.sched.update(&msg.id, spec("renamed", "s2", false))));
    assert!(is_persistence_failure(f.sched.toggle(&msg.id, false)));
    assert!(is_persistence_failure(f.sched.delete(&msg.id)));
    assert_eq!(f.sched.list(), before);
    assert_eq!(f.sched.get(&msg.id)?, msg);

    unblock(&f.paths.messages_file());
    let reopened =
      MessageScheduler::open(f.driver.clone(), Arc::new(Subscribers::new()), &f.paths, &f.cfg)?;
    assert_eq!(reopened.list(), before);
    Ok(())
  }

  #[test]
  fn failed_log_clear_keeps_entries() -> FleetResult<()> {
    let f = fixture();
    f.driver.add_session("s");
    let msg = f.sched.create(spec("a", "s", true))?;
    f.sched.run_now(&msg.id)?;
    block(&f.paths.delivery_log_file());

    assert!(is_persistence_failure(f.sched.clear_delivery_logs()));
    assert_eq!(f.sched.list_delivery_logs(None).len(), 1);
    Ok(())
  }

  #[test]
  fn stop_is_safe_and_idempotent() -> anyhow::Result<()> {
    let f = fixture();
    f.sched.start()?;
    f.sched.start()?;
    assert!(f.sched.is_running());
    f.sched.stop();
    f.sched.stop();
    assert!(!f.sched.is_running());
    Ok(())
  }
}
