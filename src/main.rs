mod commands;

use bookdesk::api::{BookstoreClient, ReadMode};
use bookdesk::config::Config;
use bookdesk::session::{AuthState, Session};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "bookdesk")]
#[command(about = "Admin client for the bookstore backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bookdesk/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the API base URL
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

/// Log to a daily rolling file under the data directory, filtered by
/// `BOOKDESK_LOG` (default `info`). Stdout is left to command output.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("bookdesk")
    .join("logs");
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "bookdesk.log"));
  let filter = EnvFilter::try_from_env("BOOKDESK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }

  let session = match &config.session.path {
    Some(path) => Session::open(path)?,
    None => Session::open_default()?,
  };
  if let Some(token) = Config::env_token() {
    session.use_token(&token);
  }
  let auth = session.subscribe();

  // Each invocation is a single read, so wait for fresh data rather than
  // print whatever was cached.
  let client = BookstoreClient::new(&config, session)?.with_read_mode(ReadMode::WaitForFresh);
  let result = commands::run(&client, args.command).await;
  client.clear_cache();

  if *auth.borrow() == AuthState::Expired {
    eprintln!("Your session has expired. Run `bookdesk login` to sign in again.");
  }
  result
}
