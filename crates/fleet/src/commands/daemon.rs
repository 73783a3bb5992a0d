use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::config::{AppContext, compute_socket_path};
use crate::daemon::run_daemon;
use crate::driver::{SessionDriver, TmuxDriver};
use crate::protocol::{C2DControl, D2CControl};
use crate::utils::daemon::{connect_daemon_socket, request_on};
use crate::utils::log::t;
use crate::{log_info, log_success, log_warn};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_STEP: Duration = Duration::from_millis(50);

fn wait_for(socket: &Path, present: bool) -> bool {
  let start = Instant::now();
  while start.elapsed() < READY_TIMEOUT {
    if socket.exists() == present {
      return true;
    }
    thread::sleep(POLL_STEP);
  }
  false
}

pub fn run_blocking(ctx: &AppContext) -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();

  let socket = compute_socket_path(&ctx.config);
  run_daemon(&socket, ctx)
}

pub fn start(ctx: &AppContext) -> Result<()> {
  let socket = compute_socket_path(&ctx.config);
  if UnixStream::connect(&socket).is_ok() {
    log_warn!("Daemon already running");
    return Ok(());
  }

  let exe = std::env::current_exe().context("failed to get current exe")?;
  let mut cmd = Command::new(exe);
  cmd
    .arg("daemon")
    .arg("run")
    .current_dir(ctx.paths.root())
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null());
  cmd.spawn().context("failed to spawn daemon child")?;

  if !wait_for(&socket, true) {
    bail!(
      "Daemon did not create socket at {} within timeout",
      socket.display()
    );
  }
  log_success!("Started daemon at {}", t::path(socket.display()));
  Ok(())
}

pub fn stop(ctx: &AppContext, kill_sessions: bool) -> Result<()> {
  let socket = compute_socket_path(&ctx.config);
  let Ok(mut stream) = connect_daemon_socket(&socket) else {
    log_info!("Daemon not running");
    return Ok(());
  };
  match request_on(&mut stream, C2DControl::Shutdown { kill_sessions })? {
    D2CControl::Goodbye => {}
    other => log_warn!("Unexpected reply to shutdown: {:?}", other),
  }
  let _ = stream.shutdown(std::net::Shutdown::Both);

  if !wait_for(&socket, false) {
    bail!("Daemon socket still present after stop");
  }
  log_success!("Stopped daemon");
  Ok(())
}

pub fn status(ctx: &AppContext) -> Result<()> {
  let socket = compute_socket_path(&ctx.config);
  let daemon_running = UnixStream::connect(&socket).is_ok();

  let driver = TmuxDriver::new(&ctx.config);
  let sessions = driver.list_sessions().ok();

  log_info!(
    "Daemon: {}",
    if daemon_running { t::ok("running") } else { t::warn("stopped") }
  );
  log_info!("  Socket: {}", t::path(socket.display()));
  log_info!(
    "Tmux:   {}",
    if sessions.is_some() { t::ok("reachable") } else { t::warn("unavailable") }
  );
  log_info!("  Socket: {}", t::path(driver.socket_path().display()));
  if let Some(sessions) = sessions {
    log_info!("  Sessions: {}", sessions.len());
  }
  Ok(())
}
