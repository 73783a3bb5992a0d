//! JSON persistence for scheduled messages and the delivery log.
//!
//! Both files are replaced atomically (temp file + rename). Only the
//! message scheduler writes them.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::FleetPaths;
use crate::error::{FleetError, FleetResult};

use super::types::{DeliveryLogEntry, ScheduledMessage};

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessagesFile {
  #[serde(default)]
  messages: Vec<ScheduledMessage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeliveryLogFile {
  #[serde(default)]
  entries: Vec<DeliveryLogEntry>,
}

#[derive(Debug, Clone)]
pub struct MessageStore {
  messages_path: PathBuf,
  log_path: PathBuf,
  max_log_entries: usize,
}

impl MessageStore {
  #[must_use]
  pub fn new(paths: &FleetPaths, max_log_entries: usize) -> Self {
    Self {
      messages_path: paths.messages_file(),
      log_path: paths.delivery_log_file(),
      max_log_entries,
    }
  }

  #[must_use]
  pub fn messages_path(&self) -> &Path {
    &self.messages_path
  }

  #[must_use]
  pub fn max_log_entries(&self) -> usize {
    self.max_log_entries
  }

  pub fn load_messages(&self) -> FleetResult<Vec<ScheduledMessage>> {
    let file: MessagesFile = load_json(&self.messages_path)
      .map_err(|e| FleetError::persistence("scheduled messages", e))?;
    Ok(file.messages)
  }

  pub fn save_messages(&self, messages: &[ScheduledMessage]) -> FleetResult<()> {
    let file = MessagesFile {
      messages: messages.to_vec(),
    };
    save_json(&self.messages_path, &file)
      .map_err(|e| FleetError::persistence("scheduled messages", e))
  }

  pub fn load_log(&self) -> FleetResult<Vec<DeliveryLogEntry>> {
    let file: DeliveryLogFile =
      load_json(&self.log_path).map_err(|e| FleetError::persistence("delivery log", e))?;
    Ok(file.entries)
  }

  pub fn save_log(&self, entries: &[DeliveryLogEntry]) -> FleetResult<()> {
    let file = DeliveryLogFile {
      entries: entries.to_vec(),
    };
    save_json(&self.log_path, &file).map_err(|e| FleetError::persistence("delivery log", e))
  }

  /// Drop the oldest entries beyond the retention cap.
  pub fn prune(&self, entries: &mut Vec<DeliveryLogEntry>) {
    if self.max_log_entries > 0 && entries.len() > self.max_log_entries {
      let excess = entries.len() - self.max_log_entries;
      entries.drain(..excess);
    }
  }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
  let data = match fs::read_to_string(path) {
    Ok(d) => d,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
    Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
  };
  if data.trim().is_empty() {
    return Ok(T::default());
  }
  serde_json::from_str(&data).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
  let dir = path
    .parent()
    .with_context(|| format!("{} has no parent directory", path.display()))?;
  fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
  let body = serde_json::to_vec_pretty(value).context("failed to serialize")?;

  let file_name = path
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("state.json");
  let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));
  let mut f = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
  f.write_all(&body)
    .and_then(|()| f.sync_all())
    .with_context(|| format!("failed to write {}", tmp.display()))?;
  drop(f);
  if let Err(err) = fs::rename(&tmp, path) {
    let _ = fs::remove_file(&tmp);
    return Err(err).with_context(|| format!("failed to replace {}", path.display()));
  }
  Ok(())
}
