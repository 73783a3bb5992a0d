//! Recurring check-ins: one timer thread per managed entity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::driver::{SessionDriver, submit};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventKind, SchedulerEvent, Subscribers};

/// What a caller asks for when arming a check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInSpec {
  pub entity_id: String,
  pub target_session: String,
  pub interval_seconds: u64,
  /// Falls back to `checkins.default_template` when absent.
  pub message_template: Option<String>,
  pub vars: BTreeMap<String, String>,
}

impl CheckInSpec {
  #[must_use]
  pub fn new(entity_id: &str, target_session: &str, interval_seconds: u64) -> Self {
    Self {
      entity_id: entity_id.to_string(),
      target_session: target_session.to_string(),
      interval_seconds,
      message_template: None,
      vars: BTreeMap::new(),
    }
  }

  #[must_use]
  pub fn with_template(mut self, template: &str) -> Self {
    self.message_template = Some(template.to_string());
    self
  }

  #[must_use]
  pub fn with_var(mut self, key: &str, value: &str) -> Self {
    self.vars.insert(key.to_string(), value.to_string());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInEntry {
  pub entity_id: String,
  pub target_session: String,
  pub interval_seconds: u64,
  pub message_template: String,
  pub next_fire_at: DateTime<Utc>,
  pub enabled: bool,
  pub vars: BTreeMap<String, String>,
  pub last_fired_at: Option<DateTime<Utc>>,
  pub last_success: Option<bool>,
}

impl CheckInEntry {
  /// Render the message template for this entry.
  ///
  /// Built-in placeholders are `{entity_id}`, `{session}`, `{interval}` and
  /// `{interval_minutes}`; caller vars extend and may override them.
  /// Unknown placeholders are left as written.
  #[must_use]
  pub fn render(&self) -> String {
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("entity_id", self.entity_id.clone());
    vars.insert("session", self.target_session.clone());
    vars.insert("interval", self.interval_seconds.to_string());
    vars.insert("interval_minutes", (self.interval_seconds / 60).to_string());
    for (k, v) in &self.vars {
      vars.insert(k.as_str(), v.clone());
    }
    render_template(&self.message_template, &vars)
  }
}

/// Substitute `{name}` placeholders where `name` is `[A-Za-z_][A-Za-z0-9_]*`.
fn render_template(template: &str, vars: &HashMap<&str, String>) -> String {
  let mut out = String::with_capacity(template.len());
  let bytes = template.as_bytes();
  let mut i = 0;
  let mut copied = 0;
  while i < bytes.len() {
    if bytes[i] == b'{' {
      let mut j = i + 1;
      while j < bytes.len() {
        let c = bytes[j] as char;
        if j == i + 1 {
          if !(c.is_ascii_alphabetic() || c == '_') {
            break;
          }
        } else if !(c.is_ascii_alphanumeric() || c == '_') {
          break;
        }
        j += 1;
      }
      if j > i + 1
        && j < bytes.len()
        && bytes[j] == b'}'
        && let Some(val) = vars.get(&template[i + 1..j])
      {
        out.push_str(&template[copied..i]);
        out.push_str(val);
        i = j + 1;
        copied = i;
        continue;
      }
    }
    i += 1;
  }
  out.push_str(&template[copied..]);
  out
}

struct Armed {
  generation: u64,
  // Dropping the sender wakes the timer thread and ends it.
  _cancel: Sender<()>,
  handle: JoinHandle<()>,
}

struct Inner {
  driver: Arc<dyn SessionDriver>,
  events: Arc<Subscribers<SchedulerEvent>>,
  enter_delay: Duration,
  default_template: String,
  entries: Mutex<BTreeMap<String, CheckInEntry>>,
  timers: Mutex<HashMap<String, Armed>>,
  next_generation: AtomicU64,
}

pub struct CheckInScheduler {
  inner: Arc<Inner>,
}

impl CheckInScheduler {
  #[must_use]
  pub fn new(
    driver: Arc<dyn SessionDriver>,
    events: Arc<Subscribers<SchedulerEvent>>,
    cfg: &FleetConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        driver,
        events,
        enter_delay: Duration::from_millis(cfg.messages.enter_delay_ms),
        default_template: cfg.checkins.default_template.clone(),
        entries: Mutex::new(BTreeMap::new()),
        timers: Mutex::new(HashMap::new()),
        next_generation: AtomicU64::new(1),
      }),
    }
  }

  /// Arm (or re-arm) the check-in of `entity_id`.
  pub fn schedule(
    &self,
    entity_id: &str,
    target_session: &str,
    interval_seconds: u64,
    template: Option<&str>,
  ) -> FleetResult<CheckInEntry> {
    let mut spec = CheckInSpec::new(entity_id, target_session, interval_seconds);
    spec.message_template = template.map(str::to_string);
    self.schedule_spec(spec)
  }

  /// Arm from a full spec. An existing timer for the entity is cancelled first;
  /// there is never more than one live timer per entity.
  pub fn schedule_spec(&self, spec: CheckInSpec) -> FleetResult<CheckInEntry> {
    if spec.entity_id.trim().is_empty() {
      return Err(FleetError::InvalidCheckIn("entity id is empty".into()));
    }
    if spec.target_session.trim().is_empty() {
      return Err(FleetError::InvalidCheckIn("target session is empty".into()));
    }
    if spec.interval_seconds == 0 {
      return Err(FleetError::InvalidCheckIn(
        "interval must be at least one second".into(),
      ));
    }
    let template = spec
      .message_template
      .filter(|t| !t.trim().is_empty())
      .unwrap_or_else(|| self.inner.default_template.clone());
    let entry = CheckInEntry {
      next_fire_at: Utc::now() + chrono::Duration::seconds(secs_i64(spec.interval_seconds)),
      entity_id: spec.entity_id,
      target_session: spec.target_session,
      interval_seconds: spec.interval_seconds,
      message_template: template,
      enabled: true,
      vars: spec.vars,
      last_fired_at: None,
      last_success: None,
    };
    self
      .inner
      .entries
      .lock()
      .insert(entry.entity_id.clone(), entry.clone());
    self.inner.arm(&entry);
    info!(
      "check-in for {} armed every {}s into {}",
      entry.entity_id, entry.interval_seconds, entry.target_session
    );
    Ok(entry)
  }

  /// Cancel and forget the check-in of `entity_id`. Returns false if none existed.
  pub fn cancel(&self, entity_id: &str) -> bool {
    let removed = self.inner.entries.lock().remove(entity_id).is_some();
    let disarmed = self.inner.disarm(entity_id).is_some();
    if removed {
      info!("check-in for {entity_id} cancelled");
    }
    removed || disarmed
  }

  #[must_use]
  pub fn is_scheduled(&self, entity_id: &str) -> bool {
    self.inner.timers.lock().contains_key(entity_id)
  }

  /// Number of live timer threads.
  #[must_use]
  pub fn armed_count(&self) -> usize {
    self.inner.timers.lock().len()
  }

  /// Pause or resume a check-in. A paused entry keeps its settings but has no timer.
  pub fn set_check_in_enabled(&self, entity_id: &str, enabled: bool) -> FleetResult<CheckInEntry> {
    let entry = {
      let mut entries = self.inner.entries.lock();
      let entry = entries
        .get_mut(entity_id)
        .ok_or_else(|| FleetError::CheckInNotFound(entity_id.to_string()))?;
      entry.enabled = enabled;
      if enabled {
        entry.next_fire_at = Utc::now() + chrono::Duration::seconds(secs_i64(entry.interval_seconds));
      }
      entry.clone()
    };
    if enabled {
      self.inner.arm(&entry);
    } else {
      self.inner.disarm(entity_id);
    }
    Ok(entry)
  }

  #[must_use]
  pub fn list_check_ins(&self) -> Vec<CheckInEntry> {
    self.inner.entries.lock().values().cloned().collect()
  }

  #[must_use]
  pub fn get(&self, entity_id: &str) -> Option<CheckInEntry> {
    self.inner.entries.lock().get(entity_id).cloned()
  }

  /// Stop every timer and wait for in-flight fires to finish. Entries are kept.
  pub fn cancel_all(&self) {
    let armed: Vec<Armed> = self.inner.timers.lock().drain().map(|(_, a)| a).collect();
    let count = armed.len();
    let handles: Vec<JoinHandle<()>> = armed.into_iter().map(|a| a.handle).collect();
    for handle in handles {
      let _ = handle.join();
    }
    if count > 0 {
      debug!("stopped {count} check-in timers");
    }
  }
}

impl Drop for CheckInScheduler {
  fn drop(&mut self) {
    self.cancel_all();
  }
}

fn secs_i64(secs: u64) -> i64 {
  i64::try_from(secs).unwrap_or(i64::MAX)
}

impl Inner {
  fn arm(self: &Arc<Self>, entry: &CheckInEntry) {
    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    let inner = Arc::clone(self);
    let entity_id = entry.entity_id.clone();
    let spawned = thread::Builder::new()
      .name(format!("checkin-{entity_id}"))
      .spawn(move || inner.run_timer(&entity_id, generation, &cancel_rx));
    let handle = match spawned {
      Ok(h) => h,
      Err(err) => {
        warn!("failed to spawn check-in timer for {}: {err}", entry.entity_id);
        return;
      }
    };
    self.events.emit(
      &SchedulerEvent::for_entity(EventKind::CheckScheduled, &entry.entity_id, &entry.target_session)
        .with_outcome(true, Some(entry.next_fire_at.to_rfc3339())),
    );
    let replaced = self.timers.lock().insert(
      entry.entity_id.clone(),
      Armed {
        generation,
        _cancel: cancel_tx,
        handle,
      },
    );
    if replaced.is_some() {
      debug!("replaced previous check-in timer for {}", entry.entity_id);
    }
  }

  fn disarm(&self, entity_id: &str) -> Option<u64> {
    self.timers.lock().remove(entity_id).map(|a| a.generation)
  }

  fn is_current(&self, entity_id: &str, generation: u64) -> bool {
    self
      .timers
      .lock()
      .get(entity_id)
      .is_some_and(|a| a.generation == generation)
  }

  fn run_timer(&self, entity_id: &str, generation: u64, cancel_rx: &Receiver<()>) {
    loop {
      let Some(next_fire_at) = self.entries.lock().get(entity_id).map(|e| e.next_fire_at) else {
        return;
      };
      let wait = (next_fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
      select! {
        recv(cancel_rx) -> _ => return,
        default(wait) => {}
      }
      if !self.is_current(entity_id, generation) {
        return;
      }
      self.fire(entity_id, generation);
    }
  }

  fn fire(&self, entity_id: &str, generation: u64) {
    let Some(entry) = self.entries.lock().get(entity_id).cloned() else {
      return;
    };
    let text = entry.render();
    let result = submit(self.driver.as_ref(), &entry.target_session, &text, self.enter_delay);
    let fired_at = Utc::now();
    let detail = match &result {
      Ok(()) => None,
      Err(err) => {
        warn!("check-in for {entity_id} failed: {err}");
        Some(err.to_string())
      }
    };

    let next = {
      let mut entries = self.entries.lock();
      match entries.get_mut(entity_id) {
        // Cancelled or re-armed while the message was in flight.
        Some(e) if self.is_current(entity_id, generation) => {
          e.last_fired_at = Some(fired_at);
          e.last_success = Some(result.is_ok());
          e.next_fire_at = fired_at + chrono::Duration::seconds(secs_i64(entry.interval_seconds));
          Some(e.next_fire_at)
        }
        _ => None,
      }
    };

    self.events.emit(
      &SchedulerEvent::for_entity(EventKind::CheckExecuted, entity_id, &entry.target_session)
        .with_outcome(result.is_ok(), detail),
    );
    if let Some(next) = next {
      self.events.emit(
        &SchedulerEvent::for_entity(EventKind::CheckScheduled, entity_id, &entry.target_session)
          .with_outcome(true, Some(next.to_rfc3339())),
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::driver::MemoryDriver;

  fn scheduler() -> (Arc<MemoryDriver>, Arc<Subscribers<SchedulerEvent>>, CheckInScheduler) {
    let driver = Arc::new(MemoryDriver::new());
    let events = Arc::new(Subscribers::new());
    let mut cfg = FleetConfig::default();
    cfg.messages.enter_delay_ms = 0;
    let sched = CheckInScheduler::new(driver.clone(), events.clone(), &cfg);
    (driver, events, sched)
  }

  fn entry(template: &str) -> CheckInEntry {
    CheckInEntry {
      entity_id: "p1".into(),
      target_session: "frontend-alice".into(),
      interval_seconds: 1800,
      message_template: template.into(),
      next_fire_at: Utc::now(),
      enabled: true,
      vars: BTreeMap::new(),
      last_fired_at: None,
      last_success: None,
    }
  }

  #[test]
  fn render_substitutes_builtins_and_keeps_unknown() {
    let e = entry("{entity_id}@{session} every {interval_minutes}m ({interval}s) {unknown} {");
    assert_eq!(
      e.render(),
      "p1@frontend-alice every 30m (1800s) {unknown} {"
    );
  }

  #[test]
  fn render_caller_vars_override_builtins() {
    let mut e = entry("{session}: {task}");
    e.vars.insert("session".into(), "alias".into());
    e.vars.insert("task".into(), "review PR".into());
    assert_eq!(e.render(), "alias: review PR");
  }

  #[test]
  fn render_handles_multibyte_text() {
    let e = entry("héllo {entity_id} ünïcode");
    assert_eq!(e.render(), "héllo p1 ünïcode");
  }

  #[test]
  fn schedule_rejects_zero_interval() {
    let (_d, _e, sched) = scheduler();
    let err = sched.schedule("p1", "s", 0, None).expect_err("zero interval");
    assert!(matches!(err, FleetError::InvalidCheckIn(_)));
    assert!(!sched.is_scheduled("p1"));
  }

  #[test]
  fn rescheduling_keeps_a_single_timer() -> FleetResult<()> {
    let (_d, _e, sched) = scheduler();
    sched.schedule("p1", "s", 60, None)?;
    sched.schedule("p1", "s", 120, None)?;
    assert_eq!(sched.armed_count(), 1);
    assert_eq!(sched.get("p1").map(|e| e.interval_seconds), Some(120));
    assert!(sched.cancel("p1"));
    assert!(!sched.is_scheduled("p1"));
    assert!(!sched.cancel("p1"));
    Ok(())
  }

  #[test]
  fn fires_into_session_and_reports_outcome() -> FleetResult<()> {
    let (driver, events, sched) = scheduler();
    driver.add_session("s");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.subscribe(move |e: &SchedulerEvent| {
      sink.lock().push((e.kind, e.success));
      Ok(())
    });

    sched.schedule("p1", "s", 1, Some("ping {entity_id}"))?;
    thread::sleep(Duration::from_millis(1400));
    sched.cancel_all();

    assert_eq!(driver.submitted("s"), vec!["ping p1".to_string()]);
    let seen = seen.lock().clone();
    assert_eq!(seen[0], (EventKind::CheckScheduled, true));
    assert!(seen.contains(&(EventKind::CheckExecuted, true)));
    let entry = sched.get("p1").expect("entry kept");
    assert_eq!(entry.last_success, Some(true));
    assert!(entry.next_fire_at > entry.last_fired_at.expect("fired"));
    Ok(())
  }

  #[test]
  fn failed_delivery_keeps_timer_armed() -> FleetResult<()> {
    let (_driver, events, sched) = scheduler();
    let failures = Arc::new(AtomicU64::new(0));
    let counter = failures.clone();
    events.subscribe(move |e: &SchedulerEvent| {
      if e.kind == EventKind::CheckExecuted && !e.success {
        counter.fetch_add(1, Ordering::SeqCst);
      }
      Ok(())
    });
    sched.schedule("p1", "missing", 1, None)?;
    thread::sleep(Duration::from_millis(1300));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(sched.is_scheduled("p1"));
    assert_eq!(sched.get("p1").and_then(|e| e.last_success), Some(false));
    Ok(())
  }

  #[test]
  fn pause_drops_timer_and_resume_rearms() -> FleetResult<()> {
    let (_d, _e, sched) = scheduler();
    sched.schedule("p1", "s", 60, None)?;
    let paused = sched.set_check_in_enabled("p1", false)?;
    assert!(!paused.enabled);
    assert!(!sched.is_scheduled("p1"));
    assert_eq!(sched.list_check_ins().len(), 1);
    sched.set_check_in_enabled("p1", true)?;
    assert!(sched.is_scheduled("p1"));
    let err = sched.set_check_in_enabled("nope", true).expect_err("unknown");
    assert!(matches!(err, FleetError::CheckInNotFound(_)));
    Ok(())
  }
}
