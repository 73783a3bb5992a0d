use anyhow::{Context, Result};

use crate::commands::messages::local_time;
use crate::commands::snapshot::state_cell;
use crate::config::AppContext;
use crate::events::SchedulerEvent;
use crate::log_info;
use crate::protocol::{C2D, C2DControl, D2C, D2CControl, read_frame, write_frame};
use crate::utils::daemon::connect_daemon;
use crate::utils::log::t;

fn print_event(event: &SchedulerEvent) {
  let subject = event
    .entity_id
    .as_deref()
    .or(event.scheduled_message_id.as_deref())
    .unwrap_or("-");
  let outcome = if event.success { t::ok("ok") } else { t::err("failed") };
  log_info!(
    "{} {} {} -> {} {}{}",
    local_time(Some(event.timestamp)),
    event.kind.as_str(),
    t::id(subject),
    t::session(&event.target_session),
    outcome,
    event
      .detail
      .as_deref()
      .map(|d| format!(" ({d})"))
      .unwrap_or_default()
  );
}

/// Stream broadcasts and scheduler events until the daemon goes away.
pub fn run(ctx: &AppContext) -> Result<()> {
  let mut stream = connect_daemon(ctx)?;
  write_frame(&mut stream, &C2D::Control(C2DControl::Subscribe))
    .context("failed to subscribe")?;
  loop {
    let D2C::Control(frame) = match read_frame(&mut stream) {
      Ok(frame) => frame,
      Err(_) => {
        log_info!("Daemon closed the stream");
        return Ok(());
      }
    };
    match frame {
      D2CControl::Broadcast { payload } => {
        log_info!(
          "#{} at {} ({} members)",
          payload.sequence,
          local_time(Some(payload.updated_at)),
          payload.members.len()
        );
        for m in &payload.members {
          let label = m.name.clone().unwrap_or_else(|| m.id.clone());
          log_info!(
            "  {} {} {}",
            t::session(&m.session_name),
            state_cell(m.state),
            label
          );
        }
      }
      D2CControl::Event { event } => print_event(&event),
      D2CControl::Error { message } => anyhow::bail!(message),
      _ => {}
    }
  }
}
