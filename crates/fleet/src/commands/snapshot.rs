use anyhow::Result;

use crate::commands::messages::local_time;
use crate::config::AppContext;
use crate::log_info;
use crate::monitor::ActivityState;
use crate::protocol::{C2DControl, D2CControl};
use crate::utils::daemon::{request, unexpected};
use crate::utils::log::t;
use crate::utils::term::{print_table, tail_chars};

const EXCERPT_PREVIEW_CHARS: usize = 60;

pub(crate) fn state_cell(state: ActivityState) -> String {
  match state {
    ActivityState::Idle => t::ok(state),
    ActivityState::Working => t::id(state),
    ActivityState::WaitingForInput => t::warn(state),
    ActivityState::Unknown => t::err(state),
  }
}

pub fn run(ctx: &AppContext) -> Result<()> {
  let snapshot = match request(ctx, C2DControl::GetSnapshot)? {
    D2CControl::Snapshot { snapshot } => snapshot,
    other => return Err(unexpected(&other)),
  };
  if snapshot.sessions.is_empty() {
    log_info!("No live sessions (generation {})", snapshot.generation);
    return Ok(());
  }
  let rows: Vec<Vec<String>> = snapshot
    .sessions
    .iter()
    .map(|(name, activity)| {
      let last_line = activity.excerpt.lines().last().unwrap_or_default();
      vec![
        t::session(name),
        state_cell(activity.state),
        local_time(activity.last_output_at),
        tail_chars(last_line, EXCERPT_PREVIEW_CHARS),
      ]
    })
    .collect();
  print_table(&["SESSION", "STATE", "LAST OUTPUT", "TAIL"], &rows);
  log_info!(
    "Generation {} taken {}",
    snapshot.generation,
    local_time(Some(snapshot.taken_at))
  );
  Ok(())
}
