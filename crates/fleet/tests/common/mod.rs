#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use assert_cmd::Command;
use parking_lot::Mutex;
use tempfile::{Builder, TempDir};

use fleet::broadcast::{BroadcastPayload, BroadcastSink};
use fleet::messages::{DelayUnit, MessageSpec};
use fleet::{AppContext, FleetConfig, FleetPaths};

/// Returns a workspace-local temp root for tests under `./target/test-tmp`.
pub fn tmp_root() -> PathBuf {
  let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  let workspace_root = manifest_dir
    .parent()
    .and_then(|p| p.parent())
    .unwrap_or(&manifest_dir)
    .to_path_buf();
  let root = workspace_root.join("target").join("test-tmp");
  let _ = std::fs::create_dir_all(&root);
  root
}

pub fn temp_project() -> TempDir {
  Builder::new()
    .prefix("fleet-test-")
    .tempdir_in(tmp_root())
    .expect("temp dir")
}

/// Config tuned for tests: no Enter pause and short loops.
pub fn fast_config() -> FleetConfig {
  let mut config = FleetConfig::default();
  config.messages.enter_delay_ms = 0;
  config.messages.tick_ms = 50;
  config.monitor.poll_interval_ms = 30;
  config.monitor.quiet_ms = 100;
  config.broadcast.debounce_ms = 30;
  config.registry.debounce_ms = 150;
  config
}

pub fn context(dir: &Path) -> AppContext {
  AppContext {
    paths: FleetPaths::new(dir),
    config: fast_config(),
  }
}

pub fn message(name: &str, session: &str, seconds: u32, recurring: bool) -> MessageSpec {
  MessageSpec {
    name: name.into(),
    target_session: session.into(),
    target_project: None,
    message: format!("{name}: status?"),
    delay_amount: seconds,
    delay_unit: DelayUnit::Seconds,
    is_recurring: recurring,
    is_active: true,
  }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  while start.elapsed() < timeout {
    if cond() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(20));
  }
  cond()
}

/// Sink that remembers every payload it was handed.
#[derive(Default)]
pub struct Recorder {
  payloads: Mutex<Vec<BroadcastPayload>>,
}

impl Recorder {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn payloads(&self) -> Vec<BroadcastPayload> {
    self.payloads.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.payloads.lock().len()
  }
}

impl BroadcastSink for Recorder {
  fn publish(&self, payload: &BroadcastPayload) -> Result<()> {
    self.payloads.lock().push(payload.clone());
    Ok(())
  }
}

pub fn tmux_available() -> bool {
  std::process::Command::new("tmux")
    .arg("-V")
    .output()
    .is_ok_and(|o| o.status.success())
}

/// Isolated project directory plus runtime dir for CLI runs.
pub struct CliEnv {
  project: TempDir,
  runtime: TempDir,
}

impl CliEnv {
  pub fn new() -> Self {
    let project = temp_project();
    // Unix socket paths are length-limited; keep the runtime dir short.
    let runtime = Builder::new()
      .prefix("fleet-rt-")
      .tempdir()
      .expect("runtime dir");
    let fleet_dir = project.path().join(".fleet");
    std::fs::create_dir_all(&fleet_dir).expect("create .fleet");
    let tmux_socket = runtime.path().join("tmux.sock");
    std::fs::write(
      fleet_dir.join("fleet.toml"),
      format!(
        "[daemon]\ntmux_socket_path = \"{}\"\n\n[messages]\ntick_ms = 100\nenter_delay_ms = 0\n",
        tmux_socket.display()
      ),
    )
    .expect("write project config");
    Self { project, runtime }
  }

  pub fn path(&self) -> &Path {
    self.project.path()
  }

  pub fn socket(&self) -> PathBuf {
    self.runtime.path().join("fleet.sock")
  }

  pub fn sockets_available(&self) -> bool {
    let probe = self.runtime.path().join("probe.sock");
    match std::os::unix::net::UnixListener::bind(&probe) {
      Ok(_l) => {
        let _ = std::fs::remove_file(&probe);
        true
      }
      Err(_) => false,
    }
  }

  pub fn fleet(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("fleet")?;
    cmd.current_dir(self.path());
    cmd.env("FLEET_SOCKET_PATH", self.socket());
    cmd.env("XDG_CONFIG_HOME", self.runtime.path().join("config"));
    cmd.env("NO_COLOR", "1");
    Ok(cmd)
  }
}

impl Drop for CliEnv {
  fn drop(&mut self) {
    if let Ok(mut cmd) = self.fleet() {
      let _ = cmd.args(["daemon", "stop", "--kill-sessions"]).output();
    }
  }
}
