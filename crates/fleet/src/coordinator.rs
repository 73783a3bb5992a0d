//! The `Fleet`: every component, constructed and wired once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::broadcast::{BroadcastService, BroadcastSink};
use crate::config::{AppContext, FleetConfig, FleetPaths};
use crate::driver::{KillOutcome, SessionDriver};
use crate::error::{FleetError, FleetResult};
use crate::events::{SchedulerEvent, Subscribers};
use crate::messages::{DeliveryLogEntry, DeliveryResult, MessageScheduler, MessageSpec, ScheduledMessage};
use crate::monitor::{ActivityMonitor, ActivitySnapshot};
use crate::registry::load_registry;
use crate::scheduler::{CheckInEntry, CheckInScheduler, CheckInSpec};
use crate::watcher::RegistryWatcher;

pub struct Fleet {
  paths: FleetPaths,
  config: FleetConfig,
  driver: Arc<dyn SessionDriver>,
  events: Arc<Subscribers<SchedulerEvent>>,
  check_ins: CheckInScheduler,
  messages: MessageScheduler,
  monitor: Arc<ActivityMonitor>,
  broadcast: Arc<BroadcastService>,
  watcher: RegistryWatcher,
  started: AtomicBool,
}

impl Fleet {
  /// Build every component around `driver`. Persisted messages are loaded
  /// here; nothing ticks until [`Fleet::start`].
  pub fn new(driver: Arc<dyn SessionDriver>, ctx: &AppContext) -> Result<Self> {
    let cfg = &ctx.config;
    let events = Arc::new(Subscribers::new());
    let check_ins = CheckInScheduler::new(Arc::clone(&driver), Arc::clone(&events), cfg);
    let messages = MessageScheduler::open(Arc::clone(&driver), Arc::clone(&events), &ctx.paths, cfg)?;
    let monitor = Arc::new(ActivityMonitor::with_heuristics(Arc::clone(&driver), cfg)?);
    let broadcast = Arc::new(BroadcastService::new(
      Arc::clone(&monitor),
      Duration::from_millis(cfg.broadcast.debounce_ms),
    ));
    let watcher = RegistryWatcher::new(
      ctx.paths.registry_file(cfg),
      Duration::from_millis(cfg.registry.debounce_ms),
    );
    Ok(Self {
      paths: ctx.paths.clone(),
      config: cfg.clone(),
      driver,
      events,
      check_ins,
      messages,
      monitor,
      broadcast,
      watcher,
      started: AtomicBool::new(false),
    })
  }

  /// Start the background loops: registry watch, broadcast worker, activity
  /// polling and the message tick (whose first tick is the catch-up).
  pub fn start(&self) -> Result<()> {
    if self.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    match load_registry(self.watcher.path()) {
      Ok(reg) => self.broadcast.notify_registry_changed(Some(reg)),
      Err(err) => warn!("starting without registry data: {err}"),
    }
    let broadcast = Arc::clone(&self.broadcast);
    self
      .watcher
      .set_change_handler(move |reg| broadcast.notify_registry_changed(Some(reg)));
    self.watcher.start()?;
    self.broadcast.start()?;
    self.monitor.start_polling(self.monitor.default_interval())?;
    self.messages.start()?;
    info!("fleet started");
    Ok(())
  }

  /// Stop every timer, poller and watcher, then optionally kill all sessions.
  /// Returns the names of the sessions that were killed.
  pub fn shutdown(&self, kill_sessions: bool) -> FleetResult<Vec<String>> {
    self.stop_background();
    if !kill_sessions {
      return Ok(Vec::new());
    }
    let mut killed = Vec::new();
    for session in self.driver.list_sessions()? {
      match self.driver.kill(&session.name) {
        Ok(KillOutcome::Killed) => killed.push(session.name),
        Ok(KillOutcome::NotFound) => {}
        Err(err) => warn!("failed to kill {}: {err}", session.name),
      }
    }
    info!("fleet shut down, killed {} sessions", killed.len());
    Ok(killed)
  }

  fn stop_background(&self) {
    self.watcher.stop();
    self.check_ins.cancel_all();
    self.messages.stop();
    self.monitor.stop_polling();
    self.broadcast.stop();
    self.started.store(false, Ordering::SeqCst);
  }

  #[must_use]
  pub fn paths(&self) -> &FleetPaths {
    &self.paths
  }

  #[must_use]
  pub fn config(&self) -> &FleetConfig {
    &self.config
  }

  #[must_use]
  pub fn driver(&self) -> &Arc<dyn SessionDriver> {
    &self.driver
  }

  /// Check-in and delivery events.
  #[must_use]
  pub fn events(&self) -> &Arc<Subscribers<SchedulerEvent>> {
    &self.events
  }

  #[must_use]
  pub fn monitor(&self) -> &Arc<ActivityMonitor> {
    &self.monitor
  }

  #[must_use]
  pub fn broadcast(&self) -> &Arc<BroadcastService> {
    &self.broadcast
  }

  pub fn set_broadcast_sink(&self, sink: Option<Arc<dyn BroadcastSink>>) {
    self.broadcast.set_broadcast_sink(sink);
  }

  pub fn create_scheduled_message(&self, spec: MessageSpec) -> FleetResult<ScheduledMessage> {
    self.messages.create(spec)
  }

  pub fn update_scheduled_message(&self, id: &str, spec: MessageSpec) -> FleetResult<ScheduledMessage> {
    self.messages.update(id, spec)
  }

  pub fn delete_scheduled_message(&self, id: &str) -> FleetResult<ScheduledMessage> {
    self.messages.delete(id)
  }

  pub fn toggle_scheduled_message(&self, id: &str, is_active: bool) -> FleetResult<ScheduledMessage> {
    self.messages.toggle(id, is_active)
  }

  pub fn run_scheduled_message_now(&self, id: &str) -> FleetResult<DeliveryResult> {
    self.messages.run_now(id)
  }

  pub fn get_scheduled_message(&self, id: &str) -> FleetResult<ScheduledMessage> {
    self.messages.get(id)
  }

  #[must_use]
  pub fn list_scheduled_messages(&self) -> Vec<ScheduledMessage> {
    self.messages.list()
  }

  #[must_use]
  pub fn list_delivery_logs(&self, limit: Option<usize>) -> Vec<DeliveryLogEntry> {
    self.messages.list_delivery_logs(limit)
  }

  pub fn clear_delivery_logs(&self) -> FleetResult<usize> {
    self.messages.clear_delivery_logs()
  }

  pub fn schedule_check_in(&self, spec: CheckInSpec) -> FleetResult<CheckInEntry> {
    self.check_ins.schedule_spec(spec)
  }

  /// Cancel the check-in of `entity_id`; unknown entities are an error.
  pub fn cancel_check_in(&self, entity_id: &str) -> FleetResult<()> {
    if self.check_ins.cancel(entity_id) {
      Ok(())
    } else {
      Err(FleetError::CheckInNotFound(entity_id.to_string()))
    }
  }

  pub fn set_check_in_enabled(&self, entity_id: &str, enabled: bool) -> FleetResult<CheckInEntry> {
    self.check_ins.set_check_in_enabled(entity_id, enabled)
  }

  #[must_use]
  pub fn is_check_in_scheduled(&self, entity_id: &str) -> bool {
    self.check_ins.is_scheduled(entity_id)
  }

  #[must_use]
  pub fn list_check_ins(&self) -> Vec<CheckInEntry> {
    self.check_ins.list_check_ins()
  }

  #[must_use]
  pub fn get_activity_snapshot(&self) -> Arc<ActivitySnapshot> {
    self.monitor.get_snapshot()
  }
}

impl Drop for Fleet {
  fn drop(&mut self) {
    self.stop_background();
  }
}
