use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};

pub const GUARD_SESSION: &str = "__fleet_guard__";
pub const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_STEP: Duration = Duration::from_millis(5);

/// Get the tmux socket path from config or environment.
pub fn tmux_socket_path(cfg: &FleetConfig) -> PathBuf {
  if let Ok(env_path) = std::env::var("FLEET_TMUX_SOCKET_PATH") {
    return PathBuf::from(env_path);
  }
  if let Some(ref daemon) = cfg.daemon
    && let Some(ref p) = daemon.tmux_socket_path
  {
    return PathBuf::from(p);
  }
  // Default: $XDG_RUNTIME_DIR/fleet-tmux.sock or ~/.local/run/fleet-tmux.sock
  if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
    return PathBuf::from(xdg_runtime).join("fleet-tmux.sock");
  }
  let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
  PathBuf::from(home).join(".local/run/fleet-tmux.sock")
}

/// Exact-match target for session-level commands.
pub fn session_target(name: &str) -> String {
  format!("={name}")
}

/// Exact-match target for the active pane of a session.
pub fn pane_target(name: &str) -> String {
  format!("={name}:")
}

/// Handle to one tmux server socket with a hard per-command deadline.
#[derive(Debug, Clone)]
pub struct Tmux {
  socket: PathBuf,
  timeout: Duration,
}

impl Tmux {
  pub fn new(socket: PathBuf, timeout: Duration) -> Self {
    Self { socket, timeout }
  }

  pub fn socket(&self) -> &PathBuf {
    &self.socket
  }

  fn command(&self) -> Command {
    let mut cmd = Command::new("tmux");
    cmd.arg("-S").arg(&self.socket);
    cmd
  }

  /// Run `tmux -S <socket> <args>` and return its output, whatever the exit status.
  pub fn output(&self, args: &[&str]) -> FleetResult<Output> {
    let mut cmd = self.command();
    cmd.args(args);
    run_with_timeout(cmd, self.timeout)
  }
}

pub fn stderr_text(out: &Output) -> String {
  let text = String::from_utf8_lossy(&out.stderr).trim().to_string();
  if text.is_empty() {
    format!("tmux exited with {}", out.status)
  } else {
    text
  }
}

/// Whether a failed command only says that no server is listening yet.
pub fn is_no_server(stderr: &str) -> bool {
  stderr.contains("no server running")
    || stderr.contains("error connecting to")
    || stderr.contains("No such file or directory")
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
  pipe.map(|mut p| {
    std::thread::spawn(move || {
      let mut buf = Vec::new();
      let _ = p.read_to_end(&mut buf);
      buf
    })
  })
}

/// Spawn `cmd` and wait at most `timeout` for it; a hung process is killed.
///
/// A missing binary, a spawn failure or a timeout all surface as
/// `DriverUnavailable` so callers can tell them apart from per-session errors.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> FleetResult<Output> {
  cmd
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  let mut child = cmd.spawn().map_err(|err| {
    if err.kind() == std::io::ErrorKind::NotFound {
      FleetError::DriverUnavailable("tmux binary not found in PATH".to_string())
    } else {
      FleetError::DriverUnavailable(format!("failed to spawn tmux: {err}"))
    }
  })?;

  // Readers keep the pipes empty so a chatty child never blocks on write.
  let stdout = drain(child.stdout.take());
  let stderr = drain(child.stderr.take());

  let deadline = Instant::now() + timeout;
  let status = loop {
    match child.try_wait() {
      Ok(Some(status)) => break status,
      Ok(None) if Instant::now() >= deadline => {
        let _ = child.kill();
        let _ = child.wait();
        return Err(FleetError::DriverUnavailable(format!(
          "tmux did not respond within {timeout:?}"
        )));
      }
      Ok(None) => std::thread::sleep(POLL_STEP),
      Err(err) => {
        return Err(FleetError::DriverUnavailable(format!(
          "failed to wait for tmux: {err}"
        )));
      }
    }
  };

  let join = |h: Option<JoinHandle<Vec<u8>>>| h.and_then(|h| h.join().ok()).unwrap_or_default();
  Ok(Output {
    status,
    stdout: join(stdout),
    stderr: join(stderr),
  })
}
