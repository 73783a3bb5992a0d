use anyhow::{Result, anyhow};
use clap::Args as ClapArgs;

use crate::commands::messages::local_time;
use crate::config::AppContext;
use crate::messages::{DelayUnit, parse_delay};
use crate::protocol::{C2DControl, D2CControl};
use crate::scheduler::{CheckInEntry, CheckInSpec};
use crate::utils::daemon::{request, unexpected};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success};

#[derive(Debug, ClapArgs)]
pub struct AddArgs {
  /// Managed entity, e.g. a project id
  pub entity: String,
  /// Session that receives the check-in
  pub session: String,
  /// Interval, e.g. 15m or 1h
  #[arg(long, value_parser = parse_delay, default_value = "15m")]
  pub every: (u32, DelayUnit),
  /// Message template; placeholders like {entity_id} and {session} are filled in
  #[arg(long)]
  pub template: Option<String>,
  /// Extra template placeholder as KEY=VALUE (repeatable)
  #[arg(long = "var", value_parser = parse_var)]
  pub vars: Vec<(String, String)>,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
  if key.trim().is_empty() {
    return Err(format!("empty key in '{s}'"));
  }
  Ok((key.trim().to_string(), value.to_string()))
}

fn expect_entry(reply: D2CControl) -> Result<CheckInEntry> {
  match reply {
    D2CControl::CheckIn { entry } => Ok(entry),
    other => Err(unexpected(&other)),
  }
}

pub fn list(ctx: &AppContext) -> Result<()> {
  let entries = match request(ctx, C2DControl::ListCheckIns)? {
    D2CControl::CheckIns { entries } => entries,
    other => return Err(unexpected(&other)),
  };
  if entries.is_empty() {
    log_info!("No check-ins");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = entries
    .iter()
    .map(|e| {
      let last = match e.last_success {
        Some(true) => t::ok("ok"),
        Some(false) => t::err("failed"),
        None => "-".to_string(),
      };
      vec![
        t::id(&e.entity_id),
        t::session(&e.target_session),
        format!("{}s", e.interval_seconds),
        if e.enabled { t::ok("armed") } else { t::warn("paused") },
        local_time(e.enabled.then_some(e.next_fire_at)),
        last,
      ]
    })
    .collect();
  print_table(&["ENTITY", "SESSION", "EVERY", "STATUS", "NEXT", "LAST"], &rows);
  Ok(())
}

pub fn add(ctx: &AppContext, args: AddArgs) -> Result<()> {
  let (amount, unit) = args.every;
  let interval = u64::from(amount)
    .checked_mul(u64::try_from(unit.seconds()).map_err(|_| anyhow!("invalid interval unit"))?)
    .ok_or_else(|| anyhow!("interval too large"))?;
  let mut spec = CheckInSpec::new(&args.entity, &args.session, interval);
  spec.message_template = args.template;
  spec.vars = args.vars.into_iter().collect();
  let entry = expect_entry(request(ctx, C2DControl::ScheduleCheckIn { spec })?)?;
  log_success!(
    "Check-in for {} armed every {}s into {}",
    entry.entity_id,
    entry.interval_seconds,
    entry.target_session
  );
  Ok(())
}

pub fn remove(ctx: &AppContext, entity: &str) -> Result<()> {
  match request(
    ctx,
    C2DControl::CancelCheckIn {
      entity_id: entity.to_string(),
    },
  )? {
    D2CControl::Ack => {
      log_success!("Cancelled check-in for {}", entity);
      Ok(())
    }
    other => Err(unexpected(&other)),
  }
}

pub fn set_enabled(ctx: &AppContext, entity: &str, enabled: bool) -> Result<()> {
  let entry = expect_entry(request(
    ctx,
    C2DControl::SetCheckInEnabled {
      entity_id: entity.to_string(),
      enabled,
    },
  )?)?;
  if entry.enabled {
    log_success!("Resumed check-in for {}", entry.entity_id);
  } else {
    log_success!("Paused check-in for {}", entry.entity_id);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_var_splits_on_first_equals() {
    assert_eq!(
      parse_var("goal=ship a=b").unwrap(),
      ("goal".to_string(), "ship a=b".to_string())
    );
    assert!(parse_var("novalue").is_err());
    assert!(parse_var("=x").is_err());
  }
}
