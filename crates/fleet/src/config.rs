use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use toml::Value as TomlValue;

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
  "daemon",
  "tmux",
  "monitor",
  "messages",
  "checkins",
  "broadcast",
  "registry",
];

/// Known keys per section, used to flag typos.
const KNOWN_SECTION_KEYS: &[(&str, &[&str])] = &[
  ("daemon", &["socket_path", "tmux_socket_path"]),
  ("tmux", &["command_timeout_ms", "capture_lines"]),
  (
    "monitor",
    &["poll_interval_ms", "quiet_ms", "idle_markers", "waiting_patterns"],
  ),
  ("messages", &["tick_ms", "enter_delay_ms", "max_log_entries"]),
  ("checkins", &["default_template"]),
  ("broadcast", &["debounce_ms"]),
  ("registry", &["path", "debounce_ms"]),
];

// Embed repository defaults
const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/fleet.toml"));

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix("fleet");
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join("fleet.toml"))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
  #[serde(default)]
  pub socket_path: Option<String>,
  #[serde(default)]
  pub tmux_socket_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
  /// Upper bound for any single tmux invocation.
  pub command_timeout_ms: u64,
  /// Lines of scrollback captured per pane by the activity monitor.
  pub capture_lines: usize,
}

impl Default for TmuxConfig {
  fn default() -> Self {
    Self {
      command_timeout_ms: 5000,
      capture_lines: 40,
    }
  }
}

impl TmuxConfig {
  #[must_use]
  pub fn command_timeout(&self) -> Duration {
    Duration::from_millis(self.command_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  pub poll_interval_ms: u64,
  /// How long a pane must stay unchanged before it counts as quiet.
  pub quiet_ms: u64,
  /// Regexes matched against the last non-empty line to detect an idle prompt.
  pub idle_markers: Vec<String>,
  /// Regexes matched against the captured tail to detect a pending question.
  pub waiting_patterns: Vec<String>,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 2000,
      quiet_ms: 4000,
      idle_markers: Vec::new(),
      waiting_patterns: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
  pub tick_ms: u64,
  /// Gap between typing the message and pressing Enter.
  pub enter_delay_ms: u64,
  /// Delivery log retention; the oldest entries are pruned beyond this.
  pub max_log_entries: usize,
}

impl Default for MessagesConfig {
  fn default() -> Self {
    Self {
      tick_ms: 1000,
      enter_delay_ms: 300,
      max_log_entries: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckinsConfig {
  pub default_template: String,
}

impl Default for CheckinsConfig {
  fn default() -> Self {
    Self {
      default_template: "Check-in for {entity_id}: please report your status.".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
  pub debounce_ms: u64,
}

impl Default for BroadcastConfig {
  fn default() -> Self {
    Self { debounce_ms: 300 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
  /// Registry file, relative paths resolve against the project root.
  pub path: String,
  pub debounce_ms: u64,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      path: ".fleet/registry.json".to_string(),
      debounce_ms: 250,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
  #[serde(default)]
  pub daemon: Option<DaemonConfig>,
  #[serde(default)]
  pub tmux: TmuxConfig,
  #[serde(default)]
  pub monitor: MonitorConfig,
  #[serde(default)]
  pub messages: MessagesConfig,
  #[serde(default)]
  pub checkins: CheckinsConfig,
  #[serde(default)]
  pub broadcast: BroadcastConfig,
  #[serde(default)]
  pub registry: RegistryConfig,
}

/// Filesystem layout of a fleet project.
#[derive(Debug, Clone)]
pub struct FleetPaths {
  root: PathBuf,
}

impl FleetPaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  #[must_use]
  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  #[must_use]
  pub fn state_dir(&self) -> PathBuf {
    self.root.join(".fleet").join("state")
  }

  #[must_use]
  pub fn messages_file(&self) -> PathBuf {
    self.state_dir().join("scheduled-messages.json")
  }

  #[must_use]
  pub fn delivery_log_file(&self) -> PathBuf {
    self.state_dir().join("delivery-log.json")
  }

  #[must_use]
  pub fn registry_file(&self, cfg: &FleetConfig) -> PathBuf {
    let p = PathBuf::from(&cfg.registry.path);
    if p.is_absolute() { p } else { self.root.join(p) }
  }
}

#[derive(Debug, Clone)]
pub struct AppContext {
  pub paths: FleetPaths,
  pub config: FleetConfig,
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match base_tbl.get_mut(&k) {
          Some(existing) => merge_values(existing, v),
          None => {
            base_tbl.insert(k, v);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_v) => *base_slot = new_v,
  }
}

/// Warn about unknown keys in a parsed TOML config file.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}' in {} (did you mean one of: {}?)",
        "warning".yellow(),
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  for (section, known) in KNOWN_SECTION_KEYS {
    let Some(TomlValue::Table(inner)) = table.get(*section) else {
      continue;
    };
    for key in inner.keys() {
      if !known.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key '{}.{}' in {} (known keys: {})",
          "warning".yellow(),
          section,
          key,
          file_path.display(),
          known.join(", ")
        );
      }
    }
  }
}

fn merge_file(merged: &mut TomlValue, path: &Path) -> Result<()> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  let val: TomlValue =
    toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))?;
  warn_unknown_keys(&val, path);
  merge_values(merged, val);
  Ok(())
}

/// Load and merge configuration from defaults, global, and project files.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed.
pub fn load_config(root: &Path) -> Result<FleetConfig> {
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  let xdg = xdg::BaseDirectories::with_prefix("fleet");
  if let Some(global_path) = xdg.find_config_file("fleet.toml") {
    merge_file(&mut merged, &global_path)?;
  }

  let project_cfg = root.join(".fleet").join("fleet.toml");
  if project_cfg.exists() {
    merge_file(&mut merged, &project_cfg)?;
  }

  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: FleetConfig = toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}

fn ensure_private_parent(path: &Path) {
  use std::os::unix::fs::PermissionsExt;
  if let Some(dir) = path.parent() {
    let _ = fs::create_dir_all(dir);
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
  }
}

/// Compute the daemon socket path based on config and environment.
///
/// Precedence:
/// 1) `FLEET_SOCKET_PATH` environment variable
/// 2) `config.daemon.socket_path` if set
/// 3) `$XDG_RUNTIME_DIR/fleet.sock` if the env var is set
/// 4) Fallback to `~/.local/run/fleet.sock`
///
/// Ensures the parent directory exists with 0700 permissions.
#[must_use]
pub fn compute_socket_path(cfg: &FleetConfig) -> PathBuf {
  let path = if let Ok(env_path) = std::env::var("FLEET_SOCKET_PATH") {
    PathBuf::from(env_path)
  } else if let Some(p) = cfg.daemon.as_ref().and_then(|d| d.socket_path.as_ref()) {
    PathBuf::from(p)
  } else if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(xdg_runtime).join("fleet.sock")
  } else {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".local").join("run").join("fleet.sock")
  };
  ensure_private_parent(&path);
  path
}
