use std::time::{Duration, Instant};

use log::debug;

use crate::error::{FleetError, FleetResult};

use super::common::{GUARD_SESSION, SERVER_READY_TIMEOUT, Tmux, is_no_server, stderr_text};

/// Ensure the socket directory exists with proper permissions (0700).
fn ensure_socket_directory(tmux: &Tmux) -> FleetResult<()> {
  use std::os::unix::fs::PermissionsExt;

  let Some(dir) = tmux.socket().parent() else {
    return Ok(());
  };
  let unavailable = |err: std::io::Error| {
    FleetError::DriverUnavailable(format!("socket directory {}: {err}", dir.display()))
  };
  std::fs::create_dir_all(dir).map_err(unavailable)?;
  std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(unavailable)?;
  Ok(())
}

/// Remove stale socket file if it exists but the server isn't running.
fn cleanup_stale_socket(tmux: &Tmux) {
  if !tmux.socket().exists() {
    return;
  }
  let responsive = tmux
    .output(&["list-sessions"])
    .is_ok_and(|out| out.status.success());
  if !responsive {
    debug!("removing stale tmux socket {}", tmux.socket().display());
    let _ = std::fs::remove_file(tmux.socket());
  }
}

fn wait_for_server_ready(tmux: &Tmux, timeout: Duration) -> FleetResult<()> {
  let start = Instant::now();
  let mut delay_ms = 10u64;
  let max_delay_ms = 200u64;
  let mut last_stderr = String::new();

  while start.elapsed() < timeout {
    match tmux.output(&["list-sessions"]) {
      Ok(out) if out.status.success() => return Ok(()),
      Ok(out) => last_stderr = stderr_text(&out),
      Err(err) => last_stderr = err.to_string(),
    }
    std::thread::sleep(Duration::from_millis(delay_ms));
    delay_ms = (delay_ms * 2).min(max_delay_ms);
  }

  Err(FleetError::DriverUnavailable(format!(
    "tmux server did not become ready within {timeout:?}: {last_stderr}"
  )))
}

/// Check if the tmux server is running by checking for the guard session.
pub fn is_server_running(tmux: &Tmux) -> bool {
  tmux
    .output(&["has-session", "-t", &format!("={GUARD_SESSION}")])
    .is_ok_and(|out| out.status.success())
}

/// Ensure a dedicated tmux server is running on our socket by maintaining a
/// hidden guard session. Agent sessions can then come and go without the
/// server exiting when the last of them closes.
pub fn ensure_server(tmux: &Tmux) -> FleetResult<()> {
  ensure_socket_directory(tmux)?;
  cleanup_stale_socket(tmux);

  if is_server_running(tmux) {
    return Ok(());
  }

  let out = tmux.output(&["new-session", "-d", "-s", GUARD_SESSION])?;
  if !out.status.success() {
    // Another caller may have won the race.
    if is_server_running(tmux) {
      return Ok(());
    }
    return Err(FleetError::DriverUnavailable(format!(
      "failed to create tmux guard session: {}",
      stderr_text(&out)
    )));
  }

  if !is_server_running(tmux) {
    return Err(FleetError::DriverUnavailable(format!(
      "tmux guard session exited immediately after start. \
This usually indicates a tmux configuration issue. \
Try running `tmux -S {}` manually or temporarily disabling your tmux config.",
      tmux.socket().display()
    )));
  }

  wait_for_server_ready(tmux, SERVER_READY_TIMEOUT)
}

/// Stop the tmux server on our socket, taking every session with it.
pub fn stop_server(tmux: &Tmux) -> FleetResult<()> {
  let out = tmux.output(&["kill-server"])?;
  if !out.status.success() {
    let stderr = stderr_text(&out);
    if !is_no_server(&stderr) {
      return Err(FleetError::DriverUnavailable(format!(
        "tmux kill-server failed: {stderr}"
      )));
    }
  }
  let _ = std::fs::remove_file(tmux.socket());
  Ok(())
}
