use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{FleetError, FleetResult};
use crate::events::{OutputEvent, Subscribers};

use super::output::OutputTracker;
use super::{
  KillOutcome, Session, SessionDriver, SessionLocks, StartCommand, StartOutcome, forget_gone,
};

/// One `send` call as the multiplexer received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keystroke {
  pub session: String,
  pub text: String,
  pub enter: bool,
}

struct PaneState {
  info: Session,
  command: StartCommand,
  pane: String,
  typed: String,
  submitted: Vec<String>,
}

/// In-process multiplexer with the same contract as the tmux driver.
///
/// Used by tests and dry runs. Pane content is set explicitly; typed text is
/// buffered per session until Enter submits it.
#[derive(Default)]
pub struct MemoryDriver {
  sessions: Mutex<BTreeMap<String, PaneState>>,
  keystrokes: Mutex<Vec<Keystroke>>,
  locks: SessionLocks,
  output: OutputTracker,
  unavailable: AtomicBool,
  list_calls: AtomicUsize,
  char_delay: Mutex<Duration>,
  capture_failures: Mutex<HashSet<String>>,
  capture_delays: Mutex<HashMap<String, Duration>>,
}

impl MemoryDriver {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Start a shell session, ignoring whether it already existed.
  pub fn add_session(&self, name: &str) -> Session {
    let mut sessions = self.sessions.lock();
    sessions
      .entry(name.to_string())
      .or_insert_with(|| new_pane(name, StartCommand::shell()))
      .info
      .clone()
  }

  /// Remove a session behind the driver's back, as an external `kill` would.
  pub fn remove_externally(&self, name: &str) {
    self.sessions.lock().remove(name);
  }

  pub fn set_pane(&self, name: &str, content: &str) {
    if let Some(state) = self.sessions.lock().get_mut(name) {
      state.pane = content.to_string();
    }
  }

  pub fn append_pane(&self, name: &str, content: &str) {
    if let Some(state) = self.sessions.lock().get_mut(name) {
      state.pane.push_str(content);
    }
  }

  #[must_use]
  pub fn keystrokes(&self, name: &str) -> Vec<Keystroke> {
    self
      .keystrokes
      .lock()
      .iter()
      .filter(|k| k.session == name)
      .cloned()
      .collect()
  }

  /// Every message that reached a session followed by Enter, in order.
  #[must_use]
  pub fn submitted(&self, name: &str) -> Vec<String> {
    self
      .sessions
      .lock()
      .get(name)
      .map(|s| s.submitted.clone())
      .unwrap_or_default()
  }

  /// Text typed but not yet submitted.
  #[must_use]
  pub fn pending_input(&self, name: &str) -> String {
    self
      .sessions
      .lock()
      .get(name)
      .map(|s| s.typed.clone())
      .unwrap_or_default()
  }

  #[must_use]
  pub fn start_command(&self, name: &str) -> Option<StartCommand> {
    self.sessions.lock().get(name).map(|s| s.command.clone())
  }

  /// How many times sessions have been listed, failed attempts included.
  #[must_use]
  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  /// Make every operation fail as if the multiplexer were gone.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Type characters one at a time with this pause between them.
  pub fn set_char_delay(&self, delay: Duration) {
    *self.char_delay.lock() = delay;
  }

  pub fn fail_capture(&self, name: &str, fail: bool) {
    let mut failures = self.capture_failures.lock();
    if fail {
      failures.insert(name.to_string());
    } else {
      failures.remove(name);
    }
  }

  pub fn set_capture_delay(&self, name: &str, delay: Duration) {
    self.capture_delays.lock().insert(name.to_string(), delay);
  }

  fn check_available(&self) -> FleetResult<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(FleetError::DriverUnavailable(
        "in-memory multiplexer switched off".to_string(),
      ));
    }
    Ok(())
  }

  fn with_pane<T>(&self, name: &str, f: impl FnOnce(&mut PaneState) -> T) -> FleetResult<T> {
    let mut sessions = self.sessions.lock();
    let state = sessions
      .get_mut(name)
      .ok_or_else(|| FleetError::SessionNotFound(name.to_string()))?;
    Ok(f(state))
  }
}

fn new_pane(name: &str, command: StartCommand) -> PaneState {
  PaneState {
    info: Session {
      name: name.to_string(),
      windows: 1,
      created_at: Utc::now(),
      attached: 0,
    },
    command,
    pane: String::new(),
    typed: String::new(),
    submitted: Vec::new(),
  }
}

impl SessionDriver for MemoryDriver {
  fn start(&self, name: &str, command: &StartCommand) -> FleetResult<StartOutcome> {
    self.check_available()?;
    if name.trim().is_empty() {
      return Err(FleetError::SpawnFailed {
        name: name.to_string(),
        reason: "session name is empty".to_string(),
      });
    }
    let mut sessions = self.sessions.lock();
    if let Some(existing) = sessions.get(name) {
      return Ok(StartOutcome::AlreadyExists(existing.info.clone()));
    }
    let state = new_pane(name, command.clone());
    let info = state.info.clone();
    sessions.insert(name.to_string(), state);
    Ok(StartOutcome::Started(info))
  }

  fn kill(&self, name: &str) -> FleetResult<KillOutcome> {
    self.check_available()?;
    let removed = self.sessions.lock().remove(name).is_some();
    self.locks.forget(name);
    self.output.forget(name);
    Ok(if removed {
      KillOutcome::Killed
    } else {
      KillOutcome::NotFound
    })
  }

  fn send(&self, name: &str, text: &str, press_enter: bool) -> FleetResult<()> {
    self.check_available()?;
    self.locks.with_session(name, || {
      self.with_pane(name, |_| ())?;
      let delay = *self.char_delay.lock();
      for ch in text.chars() {
        self.with_pane(name, |s| s.typed.push(ch))?;
        if !delay.is_zero() {
          std::thread::sleep(delay);
        }
      }
      if press_enter {
        self.with_pane(name, |s| {
          let line = std::mem::take(&mut s.typed);
          s.submitted.push(line);
        })?;
      }
      self.keystrokes.lock().push(Keystroke {
        session: name.to_string(),
        text: text.to_string(),
        enter: press_enter,
      });
      Ok(())
    })
  }

  fn list_sessions(&self) -> FleetResult<Vec<Session>> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    self.check_available()?;
    let sessions: Vec<Session> = self.sessions.lock().values().map(|s| s.info.clone()).collect();
    forget_gone(&self.locks, &self.output, &sessions);
    Ok(sessions)
  }

  fn capture_pane(&self, name: &str, lines: usize) -> FleetResult<String> {
    self.check_available()?;
    let delay = self.capture_delays.lock().get(name).copied();
    if let Some(delay) = delay {
      std::thread::sleep(delay);
    }
    if self.capture_failures.lock().contains(name) {
      return Err(FleetError::DriverUnavailable(format!(
        "capture of {name} failed"
      )));
    }
    let pane = self.with_pane(name, |s| s.pane.clone())?;
    let all: Vec<&str> = pane.lines().collect();
    let content = all[all.len().saturating_sub(lines)..].join("\n");
    self.output.observe(name, &content);
    Ok(content)
  }

  fn has_session(&self, name: &str) -> FleetResult<bool> {
    self.check_available()?;
    Ok(self.sessions.lock().contains_key(name))
  }

  fn locks(&self) -> &SessionLocks {
    &self.locks
  }

  fn output(&self) -> &Subscribers<OutputEvent> {
    &self.output.subscribers
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn listing_forgets_sessions_removed_externally() -> FleetResult<()> {
    let d = MemoryDriver::new();
    d.add_session("a");
    d.add_session("b");
    d.send("a", "hi", true)?;
    d.send("b", "hi", true)?;
    d.capture_pane("a", 10)?;
    d.capture_pane("b", 10)?;
    assert_eq!(d.locks.len(), 2);

    d.remove_externally("b");
    d.list_sessions()?;
    assert_eq!(d.locks.len(), 1);
    assert_eq!(d.output.tracked(), 1);
    Ok(())
  }

  #[test]
  fn start_is_idempotent_per_name() -> FleetResult<()> {
    let d = MemoryDriver::new();
    let first = d.start("a", &StartCommand::shell())?;
    let second = d.start("a", &StartCommand::parse("claude").unwrap())?;
    assert!(!first.already_existed());
    assert!(second.already_existed());
    assert_eq!(d.list_sessions()?.len(), 1);
    assert_eq!(d.start_command("a"), Some(StartCommand::shell()));
    Ok(())
  }

  #[test]
  fn send_to_missing_session_is_not_found() {
    let d = MemoryDriver::new();
    let err = d.send("ghost", "hi", true).expect_err("no session");
    assert!(matches!(err, FleetError::SessionNotFound(_)));
    assert!(d.keystrokes("ghost").is_empty());
  }

  #[test]
  fn kill_reports_not_found_for_absent_session() -> FleetResult<()> {
    let d = MemoryDriver::new();
    d.add_session("a");
    assert_eq!(d.kill("a")?, KillOutcome::Killed);
    assert_eq!(d.kill("a")?, KillOutcome::NotFound);
    Ok(())
  }

  #[test]
  fn capture_returns_last_lines() -> FleetResult<()> {
    let d = MemoryDriver::new();
    d.add_session("a");
    d.set_pane("a", "one\ntwo\nthree\n");
    assert_eq!(d.capture_pane("a", 2)?, "two\nthree");
    assert_eq!(d.capture_pane("a", 10)?, "one\ntwo\nthree");
    Ok(())
  }

  #[test]
  fn unavailable_driver_fails_every_call() {
    let d = MemoryDriver::new();
    d.add_session("a");
    d.set_unavailable(true);
    assert!(d.list_sessions().unwrap_err().is_transient());
    assert!(d.send("a", "x", true).unwrap_err().is_transient());
  }

  #[test]
  fn concurrent_sends_to_one_session_never_interleave() {
    let d = Arc::new(MemoryDriver::new());
    d.add_session("a");
    d.set_char_delay(Duration::from_millis(1));
    let handles: Vec<_> = ["aaaaaaaa", "bbbbbbbb", "cccccccc"]
      .into_iter()
      .map(|msg| {
        let d = d.clone();
        std::thread::spawn(move || d.send("a", msg, true).unwrap())
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    let mut got = d.submitted("a");
    got.sort();
    assert_eq!(got, vec!["aaaaaaaa", "bbbbbbbb", "cccccccc"]);
  }
}
