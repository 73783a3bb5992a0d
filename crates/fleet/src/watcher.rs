//! Watches the registry file and reports each stable, parseable edit.
//!
//! The parent directory is watched rather than the file itself so that
//! editors and writers that save via rename, or briefly delete the file,
//! keep being observed.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use log::{debug, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::{Mutex, RwLock};

use crate::registry::{Registry, load_registry};

pub type ChangeHandler = Arc<dyn Fn(Registry) + Send + Sync>;

struct Running {
  // Dropping the watcher ends event delivery.
  _watcher: RecommendedWatcher,
  stop_tx: Sender<()>,
  handle: JoinHandle<()>,
}

pub struct RegistryWatcher {
  path: PathBuf,
  debounce: Duration,
  handler: Arc<RwLock<Option<ChangeHandler>>>,
  running: Mutex<Option<Running>>,
}

impl RegistryWatcher {
  #[must_use]
  pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
    Self {
      path: path.into(),
      debounce,
      handler: Arc::new(RwLock::new(None)),
      running: Mutex::new(None),
    }
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Replace the handler invoked with each newly parsed registry.
  pub fn set_change_handler<F>(&self, handler: F)
  where
    F: Fn(Registry) + Send + Sync + 'static,
  {
    *self.handler.write() = Some(Arc::new(handler));
  }

  pub fn start(&self) -> Result<()> {
    let mut running = self.running.lock();
    if running.is_some() {
      return Ok(());
    }
    let dir = self
      .path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .ok_or_else(|| anyhow!("registry path {} has no parent directory", self.path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let file_name = self
      .path
      .file_name()
      .map(OsString::from)
      .ok_or_else(|| anyhow!("registry path {} has no file name", self.path.display()))?;

    let (event_tx, event_rx) = unbounded::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
      Ok(event) if is_relevant(&event, &file_name) => {
        let _ = event_tx.send(());
      }
      Ok(_) => {}
      Err(err) => warn!("registry watch error: {err}"),
    })
    .context("failed to create file watcher")?;
    watcher
      .watch(dir, RecursiveMode::NonRecursive)
      .with_context(|| format!("failed to watch {}", dir.display()))?;

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let worker = Worker {
      path: self.path.clone(),
      debounce: self.debounce,
      handler: Arc::clone(&self.handler),
      last: load_registry(&self.path).ok(),
    };
    let handle = thread::Builder::new()
      .name("registry-watch".into())
      .spawn(move || worker.run(&event_rx, &stop_rx))
      .context("failed to spawn registry watch thread")?;
    *running = Some(Running {
      _watcher: watcher,
      stop_tx,
      handle,
    });
    info!("watching registry {}", self.path.display());
    Ok(())
  }

  /// Stop watching. A handler call in flight completes first.
  pub fn stop(&self) {
    let running = self.running.lock().take();
    if let Some(r) = running {
      drop(r._watcher);
      drop(r.stop_tx);
      let _ = r.handle.join();
      debug!("registry watcher stopped");
    }
  }

  #[must_use]
  pub fn is_running(&self) -> bool {
    self.running.lock().is_some()
  }
}

impl Drop for RegistryWatcher {
  fn drop(&mut self) {
    self.stop();
  }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
  !matches!(event.kind, EventKind::Access(_))
    && event
      .paths
      .iter()
      .any(|p| p.file_name().is_some_and(|n| n == file_name.as_os_str()))
}

struct Worker {
  path: PathBuf,
  debounce: Duration,
  handler: Arc<RwLock<Option<ChangeHandler>>>,
  /// Last registry handed to the handler.
  last: Option<Registry>,
}

impl Worker {
  fn run(mut self, events: &Receiver<()>, stop_rx: &Receiver<()>) {
    loop {
      select! {
        recv(stop_rx) -> _ => return,
        recv(events) -> msg => {
          if msg.is_err() {
            return;
          }
        }
      }
      loop {
        select! {
          recv(stop_rx) -> _ => return,
          recv(events) -> msg => {
            if msg.is_err() {
              return;
            }
          }
          default(self.debounce) => break,
        }
      }
      self.reload();
    }
  }

  fn reload(&mut self) {
    let registry = match load_registry(&self.path) {
      Ok(r) => r,
      Err(err) => {
        // Mid-save or hand-edited; the next stable write triggers another read.
        warn!("ignoring registry update: {err}");
        return;
      }
    };
    if self.last.as_ref() == Some(&registry) {
      debug!("registry rewritten without changes");
      return;
    }
    self.last = Some(registry.clone());
    let handler = self.handler.read().clone();
    match handler {
      Some(h) => h(registry),
      None => debug!("registry changed but no handler is set"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn registry_json(member: &str) -> String {
    format!(
      r#"{{"teams":[{{"id":"t1","name":"Core","members":[{{"id":"m1","name":"{member}","sessionName":"core-{member}"}}]}}]}}"#
    )
  }

  fn watch(dir: &Path, debounce_ms: u64) -> (RegistryWatcher, Arc<Mutex<Vec<Registry>>>) {
    let watcher = RegistryWatcher::new(dir.join("registry.json"), Duration::from_millis(debounce_ms));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    watcher.set_change_handler(move |reg| sink.lock().push(reg));
    (watcher, seen)
  }

  #[test]
  fn burst_of_writes_is_reported_once_with_final_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (watcher, seen) = watch(dir.path(), 250);
    watcher.start()?;
    for member in ["ann", "ben", "cat"] {
      fs::write(watcher.path(), registry_json(member))?;
      thread::sleep(Duration::from_millis(80));
    }
    thread::sleep(Duration::from_millis(800));
    watcher.stop();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].teams[0].members[0].name, "cat");
    Ok(())
  }

  #[test]
  fn malformed_write_is_ignored_until_a_good_one_lands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (watcher, seen) = watch(dir.path(), 100);
    watcher.start()?;
    fs::write(watcher.path(), "{\"teams\": [")?;
    thread::sleep(Duration::from_millis(400));
    assert!(seen.lock().is_empty());
    assert!(watcher.is_running());

    fs::write(watcher.path(), registry_json("dee"))?;
    thread::sleep(Duration::from_millis(400));
    watcher.stop();
    assert_eq!(seen.lock().len(), 1);
    Ok(())
  }

  #[test]
  fn rename_into_place_is_seen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (watcher, seen) = watch(dir.path(), 100);
    watcher.start()?;
    let tmp = dir.path().join(".registry.json.tmp");
    fs::write(&tmp, registry_json("eve"))?;
    fs::rename(&tmp, watcher.path())?;
    thread::sleep(Duration::from_millis(400));
    watcher.stop();
    assert_eq!(seen.lock().len(), 1);
    Ok(())
  }

  #[test]
  fn unchanged_rewrite_and_stopped_watcher_stay_silent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry.json");
    fs::write(&path, registry_json("fay"))?;
    let (watcher, seen) = watch(dir.path(), 100);
    watcher.start()?;
    fs::write(&path, registry_json("fay"))?;
    thread::sleep(Duration::from_millis(400));
    assert!(seen.lock().is_empty());

    watcher.stop();
    fs::write(&path, registry_json("gus"))?;
    thread::sleep(Duration::from_millis(300));
    assert!(seen.lock().is_empty());
    Ok(())
  }

  #[test]
  fn other_files_in_the_directory_are_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (watcher, seen) = watch(dir.path(), 100);
    fs::write(watcher.path(), registry_json("hal"))?;
    watcher.start()?;
    fs::write(dir.path().join("notes.txt"), "unrelated")?;
    thread::sleep(Duration::from_millis(300));
    watcher.stop();
    assert!(seen.lock().is_empty());
    Ok(())
  }
}
