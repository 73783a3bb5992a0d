//! Activity monitor: polls every live session and classifies what its agent is doing.

mod classify;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ScopedJoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::driver::{Session, SessionDriver};
use crate::error::{FleetError, FleetResult};
use crate::events::Subscribers;
use crate::utils::term::tail_chars;

pub use classify::{ActivityState, Classifier, HeuristicClassifier, Observation, clean_capture};
use classify::ChangeTracker;

const EXCERPT_CHARS: usize = 200;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivity {
  pub state: ActivityState,
  pub last_output_at: Option<DateTime<Utc>>,
  /// Tail of the last capture, control codes removed.
  pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
  pub sessions: BTreeMap<String, SessionActivity>,
  pub generation: u64,
  pub taken_at: DateTime<Utc>,
}

impl ActivitySnapshot {
  #[must_use]
  pub fn empty() -> Self {
    Self {
      sessions: BTreeMap::new(),
      generation: 0,
      taken_at: Utc::now(),
    }
  }

  #[must_use]
  pub fn state_of(&self, session: &str) -> Option<ActivityState> {
    self.sessions.get(session).map(|a| a.state)
  }
}

struct Inner {
  driver: Arc<dyn SessionDriver>,
  classifier: Arc<dyn Classifier>,
  capture_lines: usize,
  trackers: Mutex<HashMap<String, ChangeTracker>>,
  snapshot: RwLock<Arc<ActivitySnapshot>>,
  generation: AtomicU64,
  updates: Subscribers<Arc<ActivitySnapshot>>,
  // Manual polls and the poll thread never run a tick at the same time.
  tick: Mutex<()>,
}

pub struct ActivityMonitor {
  inner: Arc<Inner>,
  default_interval: Duration,
  poller: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl ActivityMonitor {
  #[must_use]
  pub fn new(
    driver: Arc<dyn SessionDriver>,
    classifier: Arc<dyn Classifier>,
    cfg: &FleetConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        driver,
        classifier,
        capture_lines: cfg.tmux.capture_lines,
        trackers: Mutex::new(HashMap::new()),
        snapshot: RwLock::new(Arc::new(ActivitySnapshot::empty())),
        generation: AtomicU64::new(0),
        updates: Subscribers::new(),
        tick: Mutex::new(()),
      }),
      default_interval: Duration::from_millis(cfg.monitor.poll_interval_ms.max(10)),
      poller: Mutex::new(None),
    }
  }

  /// Monitor using the configured heuristic classifier.
  pub fn with_heuristics(driver: Arc<dyn SessionDriver>, cfg: &FleetConfig) -> Result<Self> {
    let classifier = HeuristicClassifier::from_config(&cfg.monitor)?;
    Ok(Self::new(driver, Arc::new(classifier), cfg))
  }

  #[must_use]
  pub fn default_interval(&self) -> Duration {
    self.default_interval
  }

  /// Start (or restart) the poll loop with `interval` between ticks.
  pub fn start_polling(&self, interval: Duration) -> Result<()> {
    self.stop_polling();
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let inner = Arc::clone(&self.inner);
    let handle = thread::Builder::new()
      .name("activity-poll".into())
      .spawn(move || inner.run_polls(interval, &stop_rx))
      .context("failed to spawn activity poll thread")?;
    *self.poller.lock() = Some((stop_tx, handle));
    info!("activity monitor polling every {interval:?}");
    Ok(())
  }

  /// Stop polling. A tick in flight completes; no later tick starts.
  pub fn stop_polling(&self) {
    let poller = self.poller.lock().take();
    if let Some((stop_tx, handle)) = poller {
      drop(stop_tx);
      let _ = handle.join();
      debug!("activity monitor stopped");
    }
  }

  #[must_use]
  pub fn is_polling(&self) -> bool {
    self.poller.lock().is_some()
  }

  /// Latest complete snapshot.
  #[must_use]
  pub fn get_snapshot(&self) -> Arc<ActivitySnapshot> {
    self.inner.snapshot.read().clone()
  }

  /// Run one tick now and return the snapshot it produced.
  pub fn poll_once(&self) -> FleetResult<Arc<ActivitySnapshot>> {
    self.inner.tick()
  }

  /// Called with each snapshot whose session states differ from the previous one.
  #[must_use]
  pub fn updates(&self) -> &Subscribers<Arc<ActivitySnapshot>> {
    &self.inner.updates
  }
}

impl Drop for ActivityMonitor {
  fn drop(&mut self) {
    self.stop_polling();
  }
}

impl Inner {
  /// Tick every `interval`. While the multiplexer is unreachable the wait
  /// grows by a doubling backoff until a tick succeeds again.
  fn run_polls(&self, interval: Duration, stop_rx: &Receiver<()>) {
    let mut backoff = Duration::ZERO;
    loop {
      match self.tick() {
        Ok(_) => {
          if !backoff.is_zero() {
            info!("activity polling recovered");
          }
          backoff = Duration::ZERO;
        }
        Err(err) if err.is_transient() => {
          if backoff.is_zero() {
            warn!("activity poll failed, backing off: {err}");
          } else {
            debug!("activity poll still failing: {err}");
          }
          backoff = next_backoff(backoff, interval);
        }
        Err(err) => warn!("activity poll failed: {err}"),
      }
      select! {
        recv(stop_rx) -> _ => return,
        default(interval + backoff) => {}
      }
    }
  }

  fn tick(&self) -> FleetResult<Arc<ActivitySnapshot>> {
    let _tick = self.tick.lock();
    let sessions = self.driver.list_sessions()?;

    // One scoped worker per session so a slow capture never holds up the rest.
    let captures: Vec<(String, FleetResult<String>)> = thread::scope(|scope| {
      let workers: Vec<_> = sessions
        .iter()
        .map(|s: &Session| {
          let spawned = thread::Builder::new()
            .name(format!("capture-{}", s.name))
            .spawn_scoped(scope, move || self.driver.capture_pane(&s.name, self.capture_lines));
          (s.name.clone(), spawned)
        })
        .collect();
      workers
        .into_iter()
        .map(|(name, spawned)| {
          let result = join_capture(&name, spawned);
          (name, result)
        })
        .collect()
    });

    let now = Instant::now();
    let mut trackers = self.trackers.lock();
    let mut activity = BTreeMap::new();
    for (name, capture) in captures {
      let entry = match capture {
        Ok(raw) => {
          let content = clean_capture(&raw);
          let tracker = trackers
            .entry(name.clone())
            .or_insert_with(|| ChangeTracker::new(now, &content));
          let quiet_for = tracker.observe(now, &content);
          let state = self.classifier.classify(&Observation {
            session: &name,
            content: &content,
            quiet_for,
            seen_change: tracker.seen_change(),
          });
          SessionActivity {
            state,
            last_output_at: trackers.get(&name).and_then(ChangeTracker::last_output_at),
            excerpt: tail_chars(&content, EXCERPT_CHARS),
          }
        }
        Err(err) => {
          debug!("capture of {name} failed: {err}");
          SessionActivity {
            state: ActivityState::Unknown,
            last_output_at: trackers.get(&name).and_then(ChangeTracker::last_output_at),
            excerpt: String::new(),
          }
        }
      };
      activity.insert(name, entry);
    }
    trackers.retain(|name, _| activity.contains_key(name));
    drop(trackers);

    let snapshot = Arc::new(ActivitySnapshot {
      sessions: activity,
      generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
      taken_at: Utc::now(),
    });
    let changed = {
      let mut current = self.snapshot.write();
      let changed = states_differ(&current, &snapshot);
      *current = Arc::clone(&snapshot);
      changed
    };
    if changed {
      self.updates.emit(&snapshot);
    }
    Ok(snapshot)
  }
}

/// Whether the set of sessions or any of their states moved between snapshots.
fn states_differ(a: &ActivitySnapshot, b: &ActivitySnapshot) -> bool {
  a.sessions.len() != b.sessions.len()
    || a.sessions.iter().any(|(name, act)| {
      b.sessions
        .get(name)
        .is_none_or(|other| other.state != act.state || other.last_output_at != act.last_output_at)
    })
}

/// A worker that could not be spawned or that panicked leaves its session unknown.
fn join_capture(
  name: &str,
  spawned: std::io::Result<ScopedJoinHandle<'_, FleetResult<String>>>,
) -> FleetResult<String> {
  let handle = spawned.map_err(|err| {
    FleetError::DriverUnavailable(format!("failed to spawn capture worker for {name}: {err}"))
  })?;
  handle
    .join()
    .unwrap_or_else(|_| Err(FleetError::DriverUnavailable(format!("capture worker for {name} panicked"))))
}

fn next_backoff(current: Duration, interval: Duration) -> Duration {
  if current.is_zero() {
    interval.min(MAX_BACKOFF)
  } else {
    (current * 2).min(MAX_BACKOFF)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::driver::MemoryDriver;

  fn monitor(driver: Arc<MemoryDriver>, quiet_ms: u64) -> ActivityMonitor {
    let mut cfg = FleetConfig::default();
    cfg.monitor.quiet_ms = quiet_ms;
    cfg.monitor.idle_markers = vec![r"^\s*>\s*$".into()];
    cfg.monitor.waiting_patterns = vec![r"(?i)\(y/n\)".into()];
    ActivityMonitor::with_heuristics(driver, &cfg).unwrap()
  }

  #[test]
  fn snapshot_covers_every_live_session() -> FleetResult<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    driver.add_session("b");
    driver.set_pane("a", "ready\n>\n");
    driver.set_pane("b", "Apply patch? (y/n)");
    let m = monitor(driver.clone(), 10_000);

    let snap = m.poll_once()?;
    assert_eq!(snap.generation, 1);
    assert_eq!(snap.state_of("a"), Some(ActivityState::Idle));
    assert_eq!(snap.state_of("b"), Some(ActivityState::WaitingForInput));

    driver.remove_externally("b");
    let snap = m.poll_once()?;
    assert_eq!(snap.generation, 2);
    assert!(snap.state_of("b").is_none());
    assert_eq!(m.get_snapshot().generation, 2);
    Ok(())
  }

  #[test]
  fn changing_content_reads_as_working_then_idle_when_quiet() -> FleetResult<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    driver.set_pane("a", "step 1");
    let m = monitor(driver.clone(), 150);
    m.poll_once()?;
    driver.set_pane("a", "step 1\nstep 2");
    let snap = m.poll_once()?;
    assert_eq!(snap.state_of("a"), Some(ActivityState::Working));
    assert!(snap.sessions["a"].last_output_at.is_some());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(m.poll_once()?.state_of("a"), Some(ActivityState::Idle));
    Ok(())
  }

  #[test]
  fn failed_capture_is_unknown_and_isolated() -> FleetResult<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("bad");
    driver.add_session("good");
    driver.set_pane("good", ">");
    driver.fail_capture("bad", true);
    let snap = monitor(driver, 10_000).poll_once()?;
    assert_eq!(snap.state_of("bad"), Some(ActivityState::Unknown));
    assert_eq!(snap.state_of("good"), Some(ActivityState::Idle));
    Ok(())
  }

  #[test]
  fn slow_capture_does_not_serialize_others() -> FleetResult<()> {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b", "c"] {
      driver.add_session(name);
      driver.set_capture_delay(name, Duration::from_millis(200));
    }
    let m = monitor(driver, 10_000);
    let started = Instant::now();
    m.poll_once()?;
    assert!(started.elapsed() < Duration::from_millis(500));
    Ok(())
  }

  #[test]
  fn unavailable_driver_keeps_previous_snapshot() -> FleetResult<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    let m = monitor(driver.clone(), 10_000);
    m.poll_once()?;
    driver.set_unavailable(true);
    assert!(m.poll_once().unwrap_err().is_transient());
    assert_eq!(m.get_snapshot().generation, 1);
    Ok(())
  }

  #[test]
  fn subscribers_hear_only_state_changes() -> Result<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    driver.set_pane("a", ">");
    let m = monitor(driver.clone(), 10_000);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    m.updates().subscribe(move |s: &Arc<ActivitySnapshot>| {
      sink.lock().push(s.generation);
      Ok(())
    });
    m.poll_once()?;
    m.poll_once()?;
    driver.set_pane("a", "Proceed? (y/n)");
    m.poll_once()?;
    assert_eq!(*seen.lock(), vec![1, 3]);
    Ok(())
  }

  #[test]
  fn polling_thread_ticks_until_stopped() -> Result<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    let m = monitor(driver, 10_000);
    m.start_polling(Duration::from_millis(20))?;
    thread::sleep(Duration::from_millis(150));
    m.stop_polling();
    let generation = m.get_snapshot().generation;
    assert!(generation >= 2, "expected several ticks, got {generation}");
    thread::sleep(Duration::from_millis(60));
    assert_eq!(m.get_snapshot().generation, generation);
    assert!(!m.is_polling());
    Ok(())
  }

  #[test]
  fn unspawnable_capture_worker_is_a_failed_capture() {
    let result = join_capture("a", Err(std::io::Error::other("thread limit reached")));
    let err = result.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("failed to spawn capture worker for a"));
  }

  #[test]
  fn backoff_doubles_up_to_the_cap() {
    let interval = Duration::from_millis(500);
    let mut backoff = Duration::ZERO;
    let mut seen = Vec::new();
    for _ in 0..9 {
      backoff = next_backoff(backoff, interval);
      seen.push(backoff.as_millis());
    }
    assert_eq!(seen, vec![500, 1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000]);
  }

  #[test]
  fn unreachable_multiplexer_is_polled_with_backoff() -> Result<()> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_session("a");
    driver.set_unavailable(true);
    let m = monitor(driver.clone(), 10_000);
    m.start_polling(Duration::from_millis(20))?;
    thread::sleep(Duration::from_millis(1000));
    // Without backoff this would be about fifty attempts.
    let attempts = driver.list_calls();
    assert!(attempts < 12, "polled {attempts} times while unreachable");
    assert_eq!(m.get_snapshot().generation, 0);

    driver.set_unavailable(false);
    let recovered = Instant::now();
    while m.get_snapshot().generation == 0 && recovered.elapsed() < Duration::from_secs(5) {
      thread::sleep(Duration::from_millis(20));
    }
    assert!(m.get_snapshot().generation > 0);
    m.stop_polling();
    Ok(())
  }
}
