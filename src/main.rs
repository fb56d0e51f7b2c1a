use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use ordersync::{logging, Config, SyncClient};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ordersync")]
#[command(about = "Inspect and operate the order sync client state")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ordersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the API base URL
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a path and print the response data
  Get { path: String },
  /// Inspect or operate the offline queue
  Queue {
    #[command(subcommand)]
    action: QueueCommand,
  },
  /// Forget stored credentials and queued mutations
  Logout,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List queued mutations
  List,
  /// Replay queued mutations now
  Drain,
  /// Drop every queued mutation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }

  let _guard = logging::init(&config.log)?;
  let client = SyncClient::open(&config)?;

  match args.command {
    Command::Get { path } => {
      let data = client
        .transport()
        .get(&path)
        .await
        .map_err(|e| eyre!("GET {} failed: {}", path, e))?;
      println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Command::Queue { action } => match action {
      QueueCommand::List => {
        let pending = client.queue().pending();
        if pending.is_empty() {
          println!("Offline queue is empty");
        }
        for action in pending {
          println!(
            "{}  {:<6} {:<10} {:<12} retries {}/{}  queued {}",
            action.id,
            format!("{:?}", action.action_type).to_uppercase(),
            action.resource,
            action.resource_id.as_deref().unwrap_or("-"),
            action.retry_count,
            action.max_retries,
            action.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          );
        }
      }
      QueueCommand::Drain => {
        let report = client.drain_queue().await?;
        println!(
          "Replayed {}, failed {}, remaining {}",
          report.replayed.len(),
          report.failed.len(),
          report.remaining
        );
        for failed in report.failed {
          println!("  {} {}: {}", failed.action.id, failed.action.resource, failed.error);
        }
      }
      QueueCommand::Clear => {
        let count = client.queue().len();
        client.queue().clear()?;
        println!("Dropped {} queued mutation(s)", count);
      }
    },
    Command::Logout => {
      client.logout()?;
      println!("Logged out");
    }
  }

  Ok(())
}
