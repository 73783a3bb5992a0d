use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::broadcast::{BroadcastPayload, BroadcastSink};
use crate::config::AppContext;
use crate::coordinator::Fleet;
use crate::driver::{SessionDriver, TmuxDriver};
use crate::error::FleetResult;
use crate::events::SubscriptionId;
use crate::protocol::{C2D, C2DControl, D2C, D2CControl, read_frame, write_frame};

/// Subscribers that stop reading are dropped once a write blocks this long.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// A client has this long to send its request after connecting.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run_daemon(socket_path: &Path, ctx: &AppContext) -> Result<()> {
  info!("Starting daemon. Socket path: {}", socket_path.display());
  if UnixStream::connect(socket_path).is_ok() {
    warn!("Daemon is already running");
    return Ok(());
  }

  let driver = Arc::new(TmuxDriver::new(&ctx.config));
  let fleet = Fleet::new(driver, ctx)?;
  let listener = ensure_socket_dir_and_bind(socket_path)?;
  listener.set_nonblocking(true)?;
  let daemon = FleetDaemon::new(listener, fleet, socket_path.to_path_buf());
  daemon.run()
}

/// Connections that asked to stream broadcasts and scheduler events.
#[derive(Default)]
pub struct SocketSink {
  streams: Mutex<Vec<UnixStream>>,
}

impl SocketSink {
  pub fn add(&self, stream: UnixStream) -> Result<()> {
    stream
      .set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT))
      .context("failed to set subscriber write timeout")?;
    self.streams.lock().push(stream);
    Ok(())
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.streams.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Write `frame` to every subscriber, dropping the ones that fail.
  fn fan_out(&self, frame: &D2C) {
    let mut streams = self.streams.lock();
    let before = streams.len();
    streams.retain_mut(|stream| write_frame(&mut *stream, frame).is_ok());
    let dropped = before - streams.len();
    if dropped > 0 {
      debug!("dropped {dropped} disconnected subscribers");
    }
  }
}

impl BroadcastSink for SocketSink {
  fn publish(&self, payload: &BroadcastPayload) -> Result<()> {
    self.fan_out(&D2C::Control(D2CControl::Broadcast {
      payload: payload.clone(),
    }));
    Ok(())
  }
}

pub struct FleetDaemon {
  listener: UnixListener,
  fleet: Fleet,
  sink: Arc<SocketSink>,
  events_subscription: SubscriptionId,
  shutdown: AtomicBool,
  socket_path: PathBuf,
}

impl FleetDaemon {
  #[must_use]
  pub fn new(listener: UnixListener, fleet: Fleet, socket_path: PathBuf) -> Self {
    let sink = Arc::new(SocketSink::default());
    fleet.set_broadcast_sink(Some(sink.clone()));
    let events_sink = Arc::clone(&sink);
    let events_subscription = fleet.events().subscribe(move |event| {
      events_sink.fan_out(&D2C::Control(D2CControl::Event {
        event: event.clone(),
      }));
      Ok(())
    });
    Self {
      listener,
      fleet,
      sink,
      events_subscription,
      shutdown: AtomicBool::new(false),
      socket_path,
    }
  }

  pub fn run(&self) -> Result<()> {
    self.fleet.start()?;

    while !self.shutdown.load(Ordering::Relaxed) {
      match self.listener.accept() {
        Ok((mut stream, _)) => {
          // Accepted sockets inherit non-blocking mode on some platforms.
          let _ = stream.set_nonblocking(false);
          let _ = stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT));
          if let Err(err) = self.handle_connection(&mut stream) {
            error!("Connection error: {err}");
          }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
          std::thread::sleep(Duration::from_millis(50));
        }
        Err(e) => {
          error!("Accept error: {e}");
          std::thread::sleep(Duration::from_millis(100));
        }
      }
    }

    self.fleet.events().unsubscribe(self.events_subscription);
    if let Err(err) = self.fleet.shutdown(false) {
      warn!("shutdown incomplete: {err}");
    }
    // Cleanup socket on shutdown
    let _ = fs::remove_file(&self.socket_path);
    info!("Daemon stopped");
    Ok(())
  }

  fn handle_connection(&self, stream: &mut UnixStream) -> Result<()> {
    let request = match read_frame::<_, C2D>(&mut *stream) {
      Ok(C2D::Control(req)) => req,
      Err(err) => {
        let _ = write_frame(
          &mut *stream,
          &D2C::Control(D2CControl::Error {
            message: format!("Read error: {err}"),
          }),
        );
        return Ok(());
      }
    };

    match request {
      C2DControl::Subscribe => {
        if let Some(payload) = self.fleet.broadcast().latest() {
          write_frame(&mut *stream, &D2C::Control(D2CControl::Broadcast { payload }))?;
        }
        // Keep the stream open until the client disconnects.
        self.sink.add(stream.try_clone()?)?;
        debug!("subscriber added ({} total)", self.sink.len());
      }
      C2DControl::Shutdown { kill_sessions } => {
        let reply = match self.fleet.shutdown(kill_sessions) {
          Ok(killed) => {
            info!("Shutdown requested, killed {} sessions", killed.len());
            D2CControl::Goodbye
          }
          Err(err) => D2CControl::Error {
            message: err.to_string(),
          },
        };
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = write_frame(&mut *stream, &D2C::Control(reply));
      }
      other => {
        let reply = self.dispatch(other).unwrap_or_else(|err| D2CControl::Error {
          message: err.to_string(),
        });
        let _ = write_frame(&mut *stream, &D2C::Control(reply));
      }
    }
    Ok(())
  }

  /// Answer a one-shot request.
  fn dispatch(&self, request: C2DControl) -> FleetResult<D2CControl> {
    let fleet = &self.fleet;
    Ok(match request {
      C2DControl::Ping { nonce } => D2CControl::Pong { nonce },
      C2DControl::GetVersion => D2CControl::Version {
        version: env!("CARGO_PKG_VERSION").to_string(),
      },
      C2DControl::GetSnapshot => D2CControl::Snapshot {
        snapshot: (*fleet.get_activity_snapshot()).clone(),
      },
      C2DControl::ListSessions => D2CControl::Sessions {
        sessions: fleet.driver().list_sessions()?,
      },
      C2DControl::CreateMessage { spec } => D2CControl::Message {
        message: fleet.create_scheduled_message(spec)?,
      },
      C2DControl::UpdateMessage { id, spec } => D2CControl::Message {
        message: fleet.update_scheduled_message(&id, spec)?,
      },
      C2DControl::DeleteMessage { id } => D2CControl::Message {
        message: fleet.delete_scheduled_message(&id)?,
      },
      C2DControl::ToggleMessage { id, is_active } => D2CControl::Message {
        message: fleet.toggle_scheduled_message(&id, is_active)?,
      },
      C2DControl::RunMessageNow { id } => D2CControl::Delivery {
        result: fleet.run_scheduled_message_now(&id)?,
      },
      C2DControl::ListMessages => D2CControl::Messages {
        messages: fleet.list_scheduled_messages(),
      },
      C2DControl::ListDeliveryLogs { limit } => D2CControl::DeliveryLogs {
        entries: fleet.list_delivery_logs(limit.map(|l| l as usize)),
      },
      C2DControl::ClearDeliveryLogs => D2CControl::Cleared {
        count: fleet.clear_delivery_logs()? as u64,
      },
      C2DControl::ScheduleCheckIn { spec } => D2CControl::CheckIn {
        entry: fleet.schedule_check_in(spec)?,
      },
      C2DControl::CancelCheckIn { entity_id } => {
        fleet.cancel_check_in(&entity_id)?;
        D2CControl::Ack
      }
      C2DControl::SetCheckInEnabled { entity_id, enabled } => D2CControl::CheckIn {
        entry: fleet.set_check_in_enabled(&entity_id, enabled)?,
      },
      C2DControl::ListCheckIns => D2CControl::CheckIns {
        entries: fleet.list_check_ins(),
      },
      C2DControl::Subscribe | C2DControl::Shutdown { .. } => D2CControl::Error {
        message: "request must be sent on its own connection".to_string(),
      },
    })
  }
}

pub fn ensure_socket_dir_and_bind(path: &Path) -> Result<UnixListener> {
  if let Some(dir) = path.parent() {
    let _ = fs::create_dir_all(dir);
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
  }
  if path.exists() {
    // Best-effort remove stale
    let _ = fs::remove_file(path);
  }
  let listener =
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;
  Ok(listener)
}
