use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::AppContext;
use crate::driver::{KillOutcome, SessionDriver, StartCommand, TmuxDriver, submit};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success, log_warn};

fn driver(ctx: &AppContext) -> TmuxDriver {
  TmuxDriver::new(&ctx.config)
}

pub fn list(ctx: &AppContext) -> Result<()> {
  let sessions = driver(ctx).list_sessions()?;
  if sessions.is_empty() {
    log_info!("No live sessions");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = sessions
    .iter()
    .map(|s| {
      vec![
        t::session(&s.name),
        s.windows.to_string(),
        if s.attached > 0 { t::ok("yes") } else { "no".to_string() },
        s.created_at
          .with_timezone(&chrono::Local)
          .format("%Y-%m-%d %H:%M:%S")
          .to_string(),
      ]
    })
    .collect();
  print_table(&["SESSION", "WINDOWS", "ATTACHED", "CREATED"], &rows);
  Ok(())
}

pub fn start(ctx: &AppContext, name: &str, cwd: Option<PathBuf>, command: &[String]) -> Result<()> {
  let mut cmd = StartCommand::from_argv(command)?;
  let cwd = cwd.unwrap_or_else(|| ctx.paths.root().clone());
  cmd = cmd.with_cwd(cwd);
  let outcome = driver(ctx).start(name, &cmd)?;
  if outcome.already_existed() {
    log_warn!("Session {} already running", t::session(name));
  } else {
    log_success!("Started session {}", name);
  }
  Ok(())
}

pub fn kill(ctx: &AppContext, name: &str) -> Result<()> {
  match driver(ctx).kill(name)? {
    KillOutcome::Killed => log_success!("Killed session {}", name),
    KillOutcome::NotFound => log_warn!("Session {} not found", name),
  }
  Ok(())
}

pub fn send(ctx: &AppContext, name: &str, text: &str, press_enter: bool) -> Result<()> {
  let driver = driver(ctx);
  if press_enter {
    let delay = Duration::from_millis(ctx.config.messages.enter_delay_ms);
    submit(&driver, name, text, delay)?;
  } else {
    driver.send(name, text, false)?;
  }
  Ok(())
}

pub fn capture(ctx: &AppContext, name: &str, lines: usize) -> Result<()> {
  let content = driver(ctx).capture_pane(name, lines)?;
  print!("{content}");
  if !content.ends_with('\n') {
    println!();
  }
  Ok(())
}

pub fn attach(ctx: &AppContext, name: &str) -> Result<()> {
  let driver = driver(ctx);
  if !driver.has_session(name)? {
    bail!("session '{name}' not found");
  }
  let status = driver.attach_command(name).status()?;
  if !status.success() {
    bail!("tmux attach exited with {status}");
  }
  Ok(())
}
