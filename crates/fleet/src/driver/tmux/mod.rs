//! tmux-backed session driver on a dedicated server socket.

mod common;
mod server;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::events::{OutputEvent, Subscribers};

use super::output::OutputTracker;
use super::{
  KillOutcome, Session, SessionDriver, SessionLocks, StartCommand, StartOutcome, forget_gone,
};

use common::{GUARD_SESSION, Tmux, is_no_server, pane_target, session_target, stderr_text};
pub use common::tmux_socket_path;

const LIST_FORMAT: &str =
  "#{session_name}\t#{session_windows}\t#{session_created}\t#{session_attached}";

pub struct TmuxDriver {
  tmux: Tmux,
  locks: SessionLocks,
  output: OutputTracker,
}

impl TmuxDriver {
  #[must_use]
  pub fn new(cfg: &FleetConfig) -> Self {
    Self::with_socket(tmux_socket_path(cfg), cfg.tmux.command_timeout())
  }

  #[must_use]
  pub fn with_socket(socket: PathBuf, command_timeout: Duration) -> Self {
    Self {
      tmux: Tmux::new(socket, command_timeout),
      locks: SessionLocks::new(),
      output: OutputTracker::default(),
    }
  }

  #[must_use]
  pub fn socket_path(&self) -> &Path {
    self.tmux.socket()
  }

  /// Kill the whole tmux server, guard session included.
  pub fn stop_server(&self) -> FleetResult<()> {
    server::stop_server(&self.tmux)
  }

  /// Interactive `attach-session` command for an operator terminal.
  #[must_use]
  pub fn attach_command(&self, name: &str) -> Command {
    let mut cmd = Command::new("tmux");
    cmd
      .arg("-S")
      .arg(self.tmux.socket())
      .arg("attach-session")
      .arg("-t")
      .arg(session_target(name));
    cmd
  }

  fn find_session(&self, name: &str) -> FleetResult<Option<Session>> {
    Ok(self.list_sessions()?.into_iter().find(|s| s.name == name))
  }

  fn session_gone(&self, name: &str) -> FleetResult<bool> {
    Ok(!self.has_session(name)?)
  }
}

fn validate_name(name: &str) -> FleetResult<()> {
  let reason = if name.trim().is_empty() {
    Some("session name is empty")
  } else if name.contains(':') || name.contains('.') {
    Some("session names may not contain ':' or '.'")
  } else if name == GUARD_SESSION {
    Some("session name is reserved")
  } else {
    None
  };
  match reason {
    Some(reason) => Err(FleetError::SpawnFailed {
      name: name.to_string(),
      reason: reason.to_string(),
    }),
    None => Ok(()),
  }
}

fn parse_sessions(stdout: &str) -> Vec<Session> {
  let mut out = Vec::new();
  for ln in stdout.lines() {
    let parts: Vec<&str> = ln.split('\t').collect();
    if parts.len() < 4 || parts[0] == GUARD_SESSION {
      continue;
    }
    let created_secs: i64 = parts[2].parse().unwrap_or(0);
    out.push(Session {
      name: parts[0].to_string(),
      windows: parts[1].parse().unwrap_or(1),
      created_at: DateTime::from_timestamp(created_secs, 0).unwrap_or_else(Utc::now),
      attached: parts[3].parse().unwrap_or(0),
    });
  }
  out
}

impl SessionDriver for TmuxDriver {
  fn start(&self, name: &str, command: &StartCommand) -> FleetResult<StartOutcome> {
    validate_name(name)?;
    self.locks.with_session(name, || {
      server::ensure_server(&self.tmux)?;
      if let Some(existing) = self.find_session(name)? {
        debug!("session {name} already running");
        return Ok(StartOutcome::AlreadyExists(existing));
      }

      let mut args: Vec<String> = vec!["new-session".into(), "-d".into(), "-s".into(), name.into()];
      for (k, v) in &command.env {
        args.push("-e".into());
        args.push(format!("{k}={v}"));
      }
      if let Some(cwd) = &command.cwd {
        args.push("-c".into());
        args.push(cwd.display().to_string());
      }
      args.extend(command.argv.iter().cloned());
      let refs: Vec<&str> = args.iter().map(String::as_str).collect();

      let out = self.tmux.output(&refs)?;
      if !out.status.success() {
        // Lost a race with another starter of the same name.
        if let Some(existing) = self.find_session(name)? {
          return Ok(StartOutcome::AlreadyExists(existing));
        }
        return Err(FleetError::SpawnFailed {
          name: name.to_string(),
          reason: stderr_text(&out),
        });
      }

      // A program that exits at once takes its session with it.
      match self.find_session(name)? {
        Some(session) => {
          info!("started session {name}");
          Ok(StartOutcome::Started(session))
        }
        None => Err(FleetError::SpawnFailed {
          name: name.to_string(),
          reason: "session exited immediately after start".to_string(),
        }),
      }
    })
  }

  fn kill(&self, name: &str) -> FleetResult<KillOutcome> {
    let outcome = self.locks.with_session(name, || {
      if self.session_gone(name)? {
        return Ok(KillOutcome::NotFound);
      }
      let out = self.tmux.output(&["kill-session", "-t", &session_target(name)])?;
      if out.status.success() {
        info!("killed session {name}");
        return Ok(KillOutcome::Killed);
      }
      if self.session_gone(name)? {
        return Ok(KillOutcome::NotFound);
      }
      Err(FleetError::DriverUnavailable(format!(
        "kill-session {name}: {}",
        stderr_text(&out)
      )))
    })?;
    self.locks.forget(name);
    self.output.forget(name);
    Ok(outcome)
  }

  fn send(&self, name: &str, text: &str, press_enter: bool) -> FleetResult<()> {
    self.locks.with_session(name, || {
      if self.session_gone(name)? {
        return Err(FleetError::SessionNotFound(name.to_string()));
      }
      let target = pane_target(name);
      let write_failed = |out: &std::process::Output| -> FleetResult<()> {
        if self.session_gone(name)? {
          return Err(FleetError::SessionNotFound(name.to_string()));
        }
        Err(FleetError::WriteFailed {
          name: name.to_string(),
          reason: stderr_text(out),
        })
      };
      if !text.is_empty() {
        // -l types the text literally instead of interpreting key names.
        let out = self.tmux.output(&["send-keys", "-t", &target, "-l", "--", text])?;
        if !out.status.success() {
          return write_failed(&out);
        }
      }
      if press_enter {
        let out = self.tmux.output(&["send-keys", "-t", &target, "Enter"])?;
        if !out.status.success() {
          return write_failed(&out);
        }
      }
      Ok(())
    })
  }

  fn list_sessions(&self) -> FleetResult<Vec<Session>> {
    let out = self.tmux.output(&["list-sessions", "-F", LIST_FORMAT])?;
    if !out.status.success() {
      let stderr = stderr_text(&out);
      if is_no_server(&stderr) {
        forget_gone(&self.locks, &self.output, &[]);
        return Ok(Vec::new());
      }
      return Err(FleetError::DriverUnavailable(format!(
        "list-sessions: {stderr}"
      )));
    }
    let sessions = parse_sessions(&String::from_utf8_lossy(&out.stdout));
    forget_gone(&self.locks, &self.output, &sessions);
    Ok(sessions)
  }

  fn capture_pane(&self, name: &str, lines: usize) -> FleetResult<String> {
    if self.session_gone(name)? {
      return Err(FleetError::SessionNotFound(name.to_string()));
    }
    let start = format!("-{lines}");
    let out = self
      .tmux
      .output(&["capture-pane", "-p", "-J", "-t", &pane_target(name), "-S", &start])?;
    if !out.status.success() {
      if self.session_gone(name)? {
        return Err(FleetError::SessionNotFound(name.to_string()));
      }
      return Err(FleetError::DriverUnavailable(format!(
        "capture-pane {name}: {}",
        stderr_text(&out)
      )));
    }
    let content = String::from_utf8_lossy(&out.stdout).into_owned();
    self.output.observe(name, &content);
    Ok(content)
  }

  fn has_session(&self, name: &str) -> FleetResult<bool> {
    if name == GUARD_SESSION {
      return Ok(false);
    }
    let out = self.tmux.output(&["has-session", "-t", &session_target(name)])?;
    Ok(out.status.success())
  }

  fn locks(&self) -> &SessionLocks {
    &self.locks
  }

  fn output(&self) -> &Subscribers<OutputEvent> {
    &self.output.subscribers
  }
}
