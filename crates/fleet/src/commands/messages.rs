use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use clap::Args as ClapArgs;

use crate::config::AppContext;
use crate::messages::{DelayUnit, MessageSpec, ScheduledMessage, format_delay, parse_delay};
use crate::protocol::{C2DControl, D2CControl};
use crate::utils::daemon::{request, unexpected};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success, log_warn};

#[derive(Debug, ClapArgs)]
pub struct AddArgs {
  /// Display name
  #[arg(long)]
  pub name: String,
  /// Target session
  #[arg(long = "to")]
  pub target_session: String,
  /// Delay before delivery, e.g. 30s, 5m, 2h, 1d
  #[arg(long = "in", value_parser = parse_delay)]
  pub delay: (u32, DelayUnit),
  /// Repeat every delay instead of firing once
  #[arg(long)]
  pub recurring: bool,
  /// Project the message belongs to
  #[arg(long)]
  pub project: Option<String>,
  /// Create the message inactive
  #[arg(long)]
  pub paused: bool,
  pub message: String,
}

#[derive(Debug, ClapArgs)]
pub struct EditArgs {
  pub id: String,
  #[arg(long)]
  pub name: Option<String>,
  #[arg(long = "to")]
  pub target_session: Option<String>,
  #[arg(long = "in", value_parser = parse_delay)]
  pub delay: Option<(u32, DelayUnit)>,
  #[arg(long)]
  pub recurring: Option<bool>,
  #[arg(long)]
  pub project: Option<String>,
  #[arg(long)]
  pub message: Option<String>,
}

fn expect_message(reply: D2CControl) -> Result<ScheduledMessage> {
  match reply {
    D2CControl::Message { message } => Ok(message),
    other => Err(unexpected(&other)),
  }
}

fn fetch_all(ctx: &AppContext) -> Result<Vec<ScheduledMessage>> {
  match request(ctx, C2DControl::ListMessages)? {
    D2CControl::Messages { messages } => Ok(messages),
    other => Err(unexpected(&other)),
  }
}

pub(crate) fn local_time(at: Option<DateTime<Utc>>) -> String {
  at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "-".to_string())
}

pub fn list(ctx: &AppContext) -> Result<()> {
  let messages = fetch_all(ctx)?;
  if messages.is_empty() {
    log_info!("No scheduled messages");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = messages
    .iter()
    .map(|m| {
      vec![
        t::id(&m.id),
        m.name.clone(),
        t::session(&m.target_session),
        format_delay(m.delay_amount, m.delay_unit),
        if m.is_recurring { "recurring" } else { "once" }.to_string(),
        if m.is_active { t::ok("active") } else { t::warn("inactive") },
        local_time(m.next_run),
        local_time(m.last_run),
      ]
    })
    .collect();
  print_table(
    &["ID", "NAME", "SESSION", "DELAY", "KIND", "STATUS", "NEXT RUN", "LAST RUN"],
    &rows,
  );
  Ok(())
}

pub fn add(ctx: &AppContext, args: AddArgs) -> Result<()> {
  let (delay_amount, delay_unit) = args.delay;
  let spec = MessageSpec {
    name: args.name,
    target_session: args.target_session,
    target_project: args.project,
    message: args.message,
    delay_amount,
    delay_unit,
    is_recurring: args.recurring,
    is_active: !args.paused,
  };
  let msg = expect_message(request(ctx, C2DControl::CreateMessage { spec })?)?;
  log_success!(
    "Scheduled {} for {} in {}",
    msg.name,
    msg.target_session,
    format_delay(msg.delay_amount, msg.delay_unit)
  );
  log_info!("ID: {}", t::id(&msg.id));
  Ok(())
}

pub fn edit(ctx: &AppContext, args: EditArgs) -> Result<()> {
  let current = fetch_all(ctx)?
    .into_iter()
    .find(|m| m.id == args.id)
    .ok_or_else(|| anyhow::anyhow!("scheduled message '{}' not found", args.id))?;
  let mut spec = current.to_spec();
  if let Some(name) = args.name {
    spec.name = name;
  }
  if let Some(target) = args.target_session {
    spec.target_session = target;
  }
  if let Some((amount, unit)) = args.delay {
    spec.delay_amount = amount;
    spec.delay_unit = unit;
  }
  if let Some(recurring) = args.recurring {
    spec.is_recurring = recurring;
  }
  if let Some(project) = args.project {
    spec.target_project = Some(project).filter(|p| !p.is_empty());
  }
  if let Some(message) = args.message {
    spec.message = message;
  }
  if spec == current.to_spec() {
    log_warn!("Nothing to change");
    return Ok(());
  }
  let msg = expect_message(request(
    ctx,
    C2DControl::UpdateMessage {
      id: args.id,
      spec,
    },
  )?)?;
  log_success!("Updated {}", msg.name);
  Ok(())
}

pub fn remove(ctx: &AppContext, id: &str) -> Result<()> {
  let msg = expect_message(request(ctx, C2DControl::DeleteMessage { id: id.to_string() })?)?;
  log_success!("Deleted {}", msg.name);
  Ok(())
}

pub fn toggle(ctx: &AppContext, id: &str, is_active: bool) -> Result<()> {
  let msg = expect_message(request(
    ctx,
    C2DControl::ToggleMessage {
      id: id.to_string(),
      is_active,
    },
  )?)?;
  if msg.is_active {
    log_success!("Activated {}, next run {}", msg.name, local_time(msg.next_run));
  } else {
    log_success!("Deactivated {}", msg.name);
  }
  Ok(())
}

pub fn run_now(ctx: &AppContext, id: &str) -> Result<()> {
  match request(ctx, C2DControl::RunMessageNow { id: id.to_string() })? {
    D2CControl::Delivery { result } if result.success => {
      log_success!("Delivered at {}", local_time(Some(result.sent_at)));
      Ok(())
    }
    D2CControl::Delivery { result } => {
      anyhow::bail!(
        "delivery failed: {}",
        result.error.unwrap_or_else(|| "unknown error".to_string())
      )
    }
    other => Err(unexpected(&other)),
  }
}
