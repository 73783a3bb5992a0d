//! Joins activity snapshots with registry metadata and publishes them to a sink.
//!
//! Change signals (new snapshots, registry edits, a sink being attached) are
//! coalesced by a single worker thread: it publishes once the signals have
//! been quiet for the debounce window.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::events::SubscriptionId;
use crate::monitor::{ActivityMonitor, ActivitySnapshot, ActivityState};
use crate::registry::Registry;

/// Receiver of broadcast payloads, typically a transport fanning out to clients.
pub trait BroadcastSink: Send + Sync {
  fn publish(&self, payload: &BroadcastPayload) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberActivity {
  /// Registry member id, or the session name for sessions the registry does not list.
  pub id: String,
  pub session_name: String,
  pub state: ActivityState,
  pub last_output_at: Option<DateTime<Utc>>,
  pub name: Option<String>,
  pub team_id: Option<String>,
  pub team_name: Option<String>,
  pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
  pub members: Vec<MemberActivity>,
  pub updated_at: DateTime<Utc>,
  pub sequence: u64,
  /// Generation of the activity snapshot the payload was built from.
  pub generation: u64,
}

pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Join a snapshot with registry metadata.
///
/// Registry members come first in file order (members without a live session
/// read as unknown), then the orchestrator, then live sessions the registry
/// does not mention, by name.
#[must_use]
pub fn build_members(registry: Option<&Registry>, snapshot: &ActivitySnapshot) -> Vec<MemberActivity> {
  let mut members = Vec::new();
  let mut listed: Vec<&str> = Vec::new();
  let activity = |session: &str| {
    snapshot
      .sessions
      .get(session)
      .map_or((ActivityState::Unknown, None), |a| (a.state, a.last_output_at))
  };

  if let Some(reg) = registry {
    for m in reg.members() {
      let (state, last_output_at) = activity(&m.member.session_name);
      listed.push(&m.member.session_name);
      members.push(MemberActivity {
        id: m.member.id.clone(),
        session_name: m.member.session_name.clone(),
        state,
        last_output_at,
        name: Some(m.member.name.clone()),
        team_id: Some(m.team.id.clone()),
        team_name: Some(m.team.name.clone()),
        role: m.member.role.clone(),
      });
    }
    if let Some(session) = reg.orchestrator_session()
      && !listed.contains(&session)
    {
      let (state, last_output_at) = activity(session);
      listed.push(session);
      members.push(MemberActivity {
        id: ORCHESTRATOR_ID.to_string(),
        session_name: session.to_string(),
        state,
        last_output_at,
        name: Some(ORCHESTRATOR_ID.to_string()),
        team_id: None,
        team_name: None,
        role: Some(ORCHESTRATOR_ID.to_string()),
      });
    }
  }

  for (session, act) in &snapshot.sessions {
    if listed.contains(&session.as_str()) {
      continue;
    }
    members.push(MemberActivity {
      id: session.clone(),
      session_name: session.clone(),
      state: act.state,
      last_output_at: act.last_output_at,
      name: None,
      team_id: None,
      team_name: None,
      role: None,
    });
  }
  members
}

struct Inner {
  monitor: Arc<ActivityMonitor>,
  debounce: Duration,
  sink: RwLock<Option<Arc<dyn BroadcastSink>>>,
  /// Last registry that parsed; a malformed edit never replaces it.
  registry: RwLock<Option<Arc<Registry>>>,
  publish: Mutex<PublishState>,
}

#[derive(Default)]
struct PublishState {
  sequence: u64,
  generation: u64,
  last: Option<BroadcastPayload>,
}

struct Worker {
  stop_tx: Sender<()>,
  handle: JoinHandle<()>,
  subscription: SubscriptionId,
}

pub struct BroadcastService {
  inner: Arc<Inner>,
  signal_tx: Sender<()>,
  signal_rx: Receiver<()>,
  worker: Mutex<Option<Worker>>,
}

impl BroadcastService {
  #[must_use]
  pub fn new(monitor: Arc<ActivityMonitor>, debounce: Duration) -> Self {
    // One slot: any number of signals before the worker wakes is one publish.
    let (signal_tx, signal_rx) = bounded(1);
    Self {
      inner: Arc::new(Inner {
        monitor,
        debounce,
        sink: RwLock::new(None),
        registry: RwLock::new(None),
        publish: Mutex::new(PublishState::default()),
      }),
      signal_tx,
      signal_rx,
      worker: Mutex::new(None),
    }
  }

  /// Subscribe to monitor updates and start the debounce worker.
  pub fn start(&self) -> Result<()> {
    let mut worker = self.worker.lock();
    if worker.is_some() {
      return Ok(());
    }
    let tx = self.signal_tx.clone();
    let subscription = self.inner.monitor.updates().subscribe(move |_| {
      let _ = tx.try_send(());
      Ok(())
    });
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let inner = Arc::clone(&self.inner);
    let signals = self.signal_rx.clone();
    let spawned = thread::Builder::new()
      .name("broadcast".into())
      .spawn(move || inner.run(&signals, &stop_rx));
    let handle = match spawned {
      Ok(h) => h,
      Err(err) => {
        self.inner.monitor.updates().unsubscribe(subscription);
        return Err(err).context("failed to spawn broadcast thread");
      }
    };
    *worker = Some(Worker {
      stop_tx,
      handle,
      subscription,
    });
    debug!("broadcast service started");
    Ok(())
  }

  /// Stop the worker. Signals still pending are dropped.
  pub fn stop(&self) {
    let worker = self.worker.lock().take();
    if let Some(w) = worker {
      self.inner.monitor.updates().unsubscribe(w.subscription);
      drop(w.stop_tx);
      let _ = w.handle.join();
      debug!("broadcast service stopped");
    }
    while self.signal_rx.try_recv().is_ok() {}
  }

  #[must_use]
  pub fn is_running(&self) -> bool {
    self.worker.lock().is_some()
  }

  /// Attach or detach the sink. Attaching one schedules a broadcast of the
  /// current state even if it equals what an earlier sink received.
  pub fn set_broadcast_sink(&self, sink: Option<Arc<dyn BroadcastSink>>) {
    let attached = sink.is_some();
    *self.inner.sink.write() = sink;
    if attached {
      self.inner.publish.lock().last = None;
      let _ = self.signal_tx.try_send(());
    }
  }

  /// Signal a registry edit. `Some` replaces the remembered registry; `None`
  /// keeps the last good one and only re-broadcasts.
  pub fn notify_registry_changed(&self, registry: Option<Registry>) {
    if let Some(reg) = registry {
      *self.inner.registry.write() = Some(Arc::new(reg));
    }
    let _ = self.signal_tx.try_send(());
  }

  #[must_use]
  pub fn registry(&self) -> Option<Arc<Registry>> {
    self.inner.registry.read().clone()
  }

  /// Most recently published payload.
  #[must_use]
  pub fn latest(&self) -> Option<BroadcastPayload> {
    self.inner.publish.lock().last.clone()
  }

  /// Publish immediately, bypassing the debounce. Returns whether a payload went out.
  pub fn broadcast_now(&self) -> Result<bool> {
    self.inner.publish_current()
  }
}

impl Drop for BroadcastService {
  fn drop(&mut self) {
    self.stop();
  }
}

impl Inner {
  fn run(&self, signals: &Receiver<()>, stop_rx: &Receiver<()>) {
    loop {
      select! {
        recv(stop_rx) -> _ => return,
        recv(signals) -> msg => {
          if msg.is_err() {
            return;
          }
        }
      }
      // Wait for the burst to go quiet.
      loop {
        select! {
          recv(stop_rx) -> _ => return,
          recv(signals) -> msg => {
            if msg.is_err() {
              return;
            }
          }
          default(self.debounce) => break,
        }
      }
      if let Err(err) = self.publish_current() {
        warn!("broadcast failed: {err:#}");
      }
    }
  }

  fn publish_current(&self) -> Result<bool> {
    let Some(sink) = self.sink.read().clone() else {
      debug!("no broadcast sink attached, dropping update");
      return Ok(false);
    };
    let snapshot = self.monitor.get_snapshot();
    let registry = self.registry.read().clone();
    let members = build_members(registry.as_deref(), &snapshot);

    let mut state = self.publish.lock();
    if snapshot.generation < state.generation {
      return Ok(false);
    }
    if state.last.as_ref().is_some_and(|p| p.members == members) {
      return Ok(false);
    }
    state.sequence += 1;
    let payload = BroadcastPayload {
      members,
      updated_at: Utc::now(),
      sequence: state.sequence,
      generation: snapshot.generation,
    };
    sink
      .publish(&payload)
      .with_context(|| format!("sink rejected broadcast {}", payload.sequence))?;
    info!(
      "broadcast {} published ({} members)",
      payload.sequence,
      payload.members.len()
    );
    state.generation = snapshot.generation;
    state.last = Some(payload);
    Ok(true)
  }
}
