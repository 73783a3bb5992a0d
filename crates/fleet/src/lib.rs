use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};

pub mod broadcast;
mod commands;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod events;
pub mod messages;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod utils;
pub mod watcher;

pub use config::{AppContext, FleetConfig, FleetPaths};
pub use coordinator::Fleet;
pub use error::{FleetError, FleetResult};

/// Fleet - Coordinate terminal AI agents running in tmux.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, bin_name = "fleet")]
pub struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Manage the background daemon
  Daemon(DaemonArgs),
  /// Manage scheduled messages
  Messages(MessagesArgs),
  /// Show or clear the delivery log
  Logs {
    /// Show at most this many entries, newest first
    #[arg(long)]
    limit: Option<u32>,
    /// Remove every entry instead of listing
    #[arg(long)]
    clear: bool,
  },
  /// Manage recurring check-ins
  Checkins(CheckinsArgs),
  /// Drive tmux sessions directly, without the daemon
  Sessions(SessionsArgs),
  /// Print the latest activity snapshot
  Snapshot,
  /// Stream broadcasts and scheduler events until interrupted
  Watch,
}

#[derive(Debug, ClapArgs)]
struct DaemonArgs {
  #[command(subcommand)]
  command: DaemonSubcommand,
}

#[derive(Debug, Subcommand)]
enum DaemonSubcommand {
  /// Run the daemon (foreground)
  Run,
  /// Start the daemon in the background
  Start,
  /// Show whether the daemon and the tmux server are up
  Status,
  /// Stop the daemon
  Stop {
    /// Also kill every session on the fleet's tmux server
    #[arg(long)]
    kill_sessions: bool,
  },
}

#[derive(Debug, ClapArgs)]
struct MessagesArgs {
  #[command(subcommand)]
  command: MessagesSubcommand,
}

#[derive(Debug, Subcommand)]
enum MessagesSubcommand {
  /// List scheduled messages
  Ls,
  /// Schedule a new message
  Add(commands::messages::AddArgs),
  /// Change fields of a scheduled message
  Edit(commands::messages::EditArgs),
  /// Delete a scheduled message
  Rm { id: String },
  /// Activate or deactivate a scheduled message
  Toggle {
    id: String,
    /// Deactivate instead of activate
    #[arg(long)]
    off: bool,
  },
  /// Deliver a message immediately
  Run { id: String },
}

#[derive(Debug, ClapArgs)]
struct CheckinsArgs {
  #[command(subcommand)]
  command: CheckinsSubcommand,
}

#[derive(Debug, Subcommand)]
enum CheckinsSubcommand {
  /// List check-ins
  Ls,
  /// Arm (or re-arm) the check-in of an entity
  Add(commands::checkins::AddArgs),
  /// Cancel the check-in of an entity
  Rm { entity: String },
  /// Pause a check-in, keeping its settings
  Pause { entity: String },
  /// Resume a paused check-in
  Resume { entity: String },
}

#[derive(Debug, ClapArgs)]
struct SessionsArgs {
  #[command(subcommand)]
  command: SessionsSubcommand,
}

#[derive(Debug, Subcommand)]
enum SessionsSubcommand {
  /// List live sessions
  Ls,
  /// Start a session running COMMAND (default: the login shell)
  Start {
    name: String,
    /// Working directory of the new session
    #[arg(long)]
    cwd: Option<std::path::PathBuf>,
    #[arg(last = true)]
    command: Vec<String>,
  },
  /// Kill a session
  Kill { name: String },
  /// Type text into a session and submit it
  Send {
    name: String,
    text: String,
    /// Type the text without pressing Enter
    #[arg(long)]
    no_enter: bool,
  },
  /// Print the tail of a session's pane
  Capture {
    name: String,
    #[arg(long, default_value_t = 40)]
    lines: usize,
  },
  /// Attach the terminal to a session
  Attach { name: String },
}

pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  let cli = parse();
  let cwd = std::env::current_dir()?;
  let config = config::load_config(&cwd)?;
  let ctx = AppContext {
    paths: FleetPaths::new(cwd),
    config,
  };

  let Some(command) = cli.command else {
    use clap::CommandFactory as _;
    Cli::command().print_help()?;
    println!();
    return Ok(());
  };

  match command {
    Commands::Daemon(args) => match args.command {
      DaemonSubcommand::Run => commands::daemon::run_blocking(&ctx)?,
      DaemonSubcommand::Start => commands::daemon::start(&ctx)?,
      DaemonSubcommand::Status => commands::daemon::status(&ctx)?,
      DaemonSubcommand::Stop { kill_sessions } => commands::daemon::stop(&ctx, kill_sessions)?,
    },
    Commands::Messages(args) => match args.command {
      MessagesSubcommand::Ls => commands::messages::list(&ctx)?,
      MessagesSubcommand::Add(add) => commands::messages::add(&ctx, add)?,
      MessagesSubcommand::Edit(edit) => commands::messages::edit(&ctx, edit)?,
      MessagesSubcommand::Rm { id } => commands::messages::remove(&ctx, &id)?,
      MessagesSubcommand::Toggle { id, off } => commands::messages::toggle(&ctx, &id, !off)?,
      MessagesSubcommand::Run { id } => commands::messages::run_now(&ctx, &id)?,
    },
    Commands::Logs { limit, clear } => commands::logs::run(&ctx, limit, clear)?,
    Commands::Checkins(args) => match args.command {
      CheckinsSubcommand::Ls => commands::checkins::list(&ctx)?,
      CheckinsSubcommand::Add(add) => commands::checkins::add(&ctx, add)?,
      CheckinsSubcommand::Rm { entity } => commands::checkins::remove(&ctx, &entity)?,
      CheckinsSubcommand::Pause { entity } => commands::checkins::set_enabled(&ctx, &entity, false)?,
      CheckinsSubcommand::Resume { entity } => commands::checkins::set_enabled(&ctx, &entity, true)?,
    },
    Commands::Sessions(args) => match args.command {
      SessionsSubcommand::Ls => commands::sessions::list(&ctx)?,
      SessionsSubcommand::Start { name, cwd, command } => {
        commands::sessions::start(&ctx, &name, cwd, &command)?;
      }
      SessionsSubcommand::Kill { name } => commands::sessions::kill(&ctx, &name)?,
      SessionsSubcommand::Send {
        name,
        text,
        no_enter,
      } => commands::sessions::send(&ctx, &name, &text, !no_enter)?,
      SessionsSubcommand::Capture { name, lines } => commands::sessions::capture(&ctx, &name, lines)?,
      SessionsSubcommand::Attach { name } => commands::sessions::attach(&ctx, &name)?,
    },
    Commands::Snapshot => commands::snapshot::run(&ctx)?,
    Commands::Watch => commands::watch::run(&ctx)?,
  }

  Ok(())
}
