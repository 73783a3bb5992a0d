use anyhow::Result;

use crate::commands::messages::local_time;
use crate::config::AppContext;
use crate::protocol::{C2DControl, D2CControl};
use crate::utils::daemon::{request, unexpected};
use crate::utils::log::t;
use crate::utils::term::{print_table, tail_chars};
use crate::{log_info, log_success};

const MESSAGE_PREVIEW_CHARS: usize = 48;

pub fn run(ctx: &AppContext, limit: Option<u32>, clear: bool) -> Result<()> {
  if clear {
    return match request(ctx, C2DControl::ClearDeliveryLogs)? {
      D2CControl::Cleared { count } => {
        log_success!("Cleared {} delivery log entries", count);
        Ok(())
      }
      other => Err(unexpected(&other)),
    };
  }

  let entries = match request(ctx, C2DControl::ListDeliveryLogs { limit })? {
    D2CControl::DeliveryLogs { entries } => entries,
    other => return Err(unexpected(&other)),
  };
  if entries.is_empty() {
    log_info!("Delivery log is empty");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = entries
    .iter()
    .map(|e| {
      vec![
        local_time(Some(e.sent_at)),
        e.message_name.clone(),
        t::session(&e.target_session),
        if e.success { t::ok("ok") } else { t::err("failed") },
        tail_chars(&e.message.replace('\n', " "), MESSAGE_PREVIEW_CHARS),
        e.error.clone().unwrap_or_default(),
      ]
    })
    .collect();
  print_table(&["SENT", "NAME", "SESSION", "RESULT", "MESSAGE", "ERROR"], &rows);
  Ok(())
}
