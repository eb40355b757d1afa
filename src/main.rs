mod commands;

use carelink::{ApiClient, Config};
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "carelink")]
#[command(about = "Resilient command-line client for the CareLink API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/carelink/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL; used instead of a config file when none is found
  #[arg(long)]
  base_url: Option<String>,

  /// Keep cache, queue and credentials in memory only
  #[arg(long)]
  ephemeral: bool,

  /// Debug logging on stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load_with_base_url(args.config.as_deref(), args.base_url.as_deref())?;

  // Console (human-readable) + daily rotating JSON file under the data dir
  let filter = if args.verbose { "carelink=debug,info" } else { "carelink=warn,warn" };
  let console_filter =
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

  let log_dir = config.data_dir()?.join("logs");
  let file_appender = tracing_appender::rolling::daily(&log_dir, "carelink.log");
  let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

  use tracing_subscriber::prelude::*;
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(console_filter),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(tracing_subscriber::EnvFilter::new("carelink=debug,info")),
    )
    .init();

  let client = ApiClient::open(config, args.ephemeral).await?;
  let mut failures = client.auth().on_auth_failure();

  let result = commands::run(args.command, &client).await;

  if let Ok(failure) = failures.try_recv() {
    warn!(status = failure.status, reason = %failure.reason, "session ended, log in again");
    eprintln!("Session ended: {}. Run `carelink login` again.", failure.reason);
  }
  client.shutdown().await;

  result
}
