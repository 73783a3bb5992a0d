//! Session driver: the only component that touches the terminal multiplexer.
//!
//! Every operation re-verifies that its target session is live before acting;
//! a session created earlier may have been killed externally at any time.

mod locks;
mod memory;
mod output;
pub mod tmux;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FleetResult;
use crate::events::{OutputEvent, Subscribers};

pub use locks::SessionLocks;
pub use memory::{Keystroke, MemoryDriver};
pub use tmux::TmuxDriver;

/// A live multiplexer session as last reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub name: String,
  pub windows: u32,
  pub created_at: DateTime<Utc>,
  pub attached: u32,
}

/// Program launched inside a new session. An empty argv starts the default shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
  pub argv: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub env: Vec<(String, String)>,
}

impl StartCommand {
  #[must_use]
  pub fn shell() -> Self {
    Self::default()
  }

  /// Construct from argv-like vector: first element is the program, rest are args.
  pub fn from_argv(argv: &[String]) -> Result<Self> {
    if let Some(program) = argv.first()
      && program.trim().is_empty()
    {
      bail!("command program is empty");
    }
    Ok(Self {
      argv: argv.to_vec(),
      ..Self::default()
    })
  }

  /// Split a shell-like command line into argv.
  pub fn parse(line: &str) -> Result<Self> {
    let argv = shell_words::split(line)?;
    Self::from_argv(&argv)
  }

  #[must_use]
  pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
  Started(Session),
  /// The session was already live; nothing was spawned.
  AlreadyExists(Session),
}

impl StartOutcome {
  #[must_use]
  pub fn session(&self) -> &Session {
    match self {
      Self::Started(s) | Self::AlreadyExists(s) => s,
    }
  }

  #[must_use]
  pub fn already_existed(&self) -> bool {
    matches!(self, Self::AlreadyExists(_))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
  Killed,
  NotFound,
}

pub trait SessionDriver: Send + Sync {
  /// Start `name` unless it is already live.
  fn start(&self, name: &str, command: &StartCommand) -> FleetResult<StartOutcome>;

  /// Kill `name`; a session that is already gone reports `NotFound`.
  fn kill(&self, name: &str) -> FleetResult<KillOutcome>;

  /// Type `text` literally into the session, then optionally press Enter.
  fn send(&self, name: &str, text: &str, press_enter: bool) -> FleetResult<()>;

  fn list_sessions(&self) -> FleetResult<Vec<Session>>;

  /// Capture the last `lines` lines of the session's active pane.
  fn capture_pane(&self, name: &str, lines: usize) -> FleetResult<String>;

  fn has_session(&self, name: &str) -> FleetResult<bool> {
    Ok(self.list_sessions()?.iter().any(|s| s.name == name))
  }

  /// Per-session write locks shared by every writer of this driver.
  fn locks(&self) -> &SessionLocks;

  /// Subscribers notified whenever a capture observes changed pane content.
  fn output(&self) -> &Subscribers<OutputEvent>;
}

/// Drop per-session driver state of sessions missing from a fresh listing.
fn forget_gone(locks: &SessionLocks, output: &output::OutputTracker, live: &[Session]) {
  let is_live = |name: &str| live.iter().any(|s| s.name == name);
  locks.retain_live(is_live);
  output.retain_live(is_live);
}

/// Submit `text` as one agent prompt: type it, pause, then press Enter.
///
/// Many agent CLIs only accept the submission keystroke as a separate
/// terminal write. Both steps run under the session's write lock so another
/// writer cannot slip its own text between them.
pub fn submit(
  driver: &dyn SessionDriver,
  name: &str,
  text: &str,
  enter_delay: Duration,
) -> FleetResult<()> {
  driver.locks().with_session(name, || {
    driver.send(name, text, false)?;
    if !enter_delay.is_zero() {
      std::thread::sleep(enter_delay);
    }
    driver.send(name, "", true)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn start_command_parses_quoted_arguments() -> Result<()> {
    let cmd = StartCommand::parse("claude --model 'big one' -p \"hi there\"")?;
    assert_eq!(cmd.argv, vec!["claude", "--model", "big one", "-p", "hi there"]);
    Ok(())
  }

  #[test]
  fn start_command_rejects_blank_program() {
    let err = StartCommand::from_argv(&[" ".to_string()]).expect_err("blank program");
    assert!(err.to_string().contains("empty"));
  }

  #[test]
  fn empty_argv_means_default_shell() -> Result<()> {
    assert_eq!(StartCommand::from_argv(&[])?, StartCommand::shell());
    Ok(())
  }

  #[test]
  fn submit_types_text_then_presses_enter() -> FleetResult<()> {
    let driver = MemoryDriver::new();
    driver.add_session("team-a");
    submit(&driver, "team-a", "status?", Duration::ZERO)?;
    assert_eq!(driver.submitted("team-a"), vec!["status?".to_string()]);
    let writes = driver.keystrokes("team-a");
    assert_eq!(writes.len(), 2);
    assert!(!writes[0].enter);
    assert!(writes[1].enter && writes[1].text.is_empty());
    Ok(())
  }
}
