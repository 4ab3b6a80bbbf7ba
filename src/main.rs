//! Binary entrypoint for the meshcord CLI.
//!
//! Commands:
//! - `start [--dry-run]` - run the relay (dry run prints instead of posting to Discord)
//! - `init` - write a starter `config.toml`
//! - `status` - print de-duplication store statistics as JSON
//!
//! See the library crate docs for module-level details: `meshcord::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;

use meshcord::config::Config;
use meshcord::relay::service::{spawn_ctrl_c, RelayService};
use meshcord::sink::{DiscordSink, Sink, StdoutSink};
use meshcord::storage::DedupStore;

#[derive(Parser)]
#[command(name = "meshcord")]
#[command(about = "Relay Meshtastic mesh traffic to a Discord channel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start relaying
    Start {
        /// Print messages to stdout instead of posting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a default configuration file
    Init,
    /// Show de-duplication store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Start { dry_run } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            config.apply_env_overrides();
            info!("Starting meshcord v{}", env!("CARGO_PKG_VERSION"));

            let sink: Arc<dyn Sink> = if dry_run {
                config.validate_transports()?;
                info!("Dry run: messages go to stdout");
                Arc::new(StdoutSink)
            } else {
                let creds = config.validate()?;
                info!("Discord channel: {}", creds.channel_id);
                Arc::new(DiscordSink::new(&creds)?)
            };
            info!(
                "Connection method: {:?}; enabled filters: {}",
                config.connection.method,
                config.filters.enabled().join(", ")
            );

            let (tx, rx) = watch::channel(false);
            let _signal = spawn_ctrl_c(tx);
            RelayService::new(config, sink)?.run(rx).await?;
        }
        Commands::Init => {
            if std::path::Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config);
            println!("Set DISCORD_BOT_TOKEN and DISCORD_CHANNEL_ID, then run: meshcord start");
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("No readable config at {}; using defaults", cli.config);
                    Config::default()
                }
            };
            let path = config.storage.db_path();
            let store = DedupStore::open(&path)
                .map_err(|e| anyhow!("Failed to open store at {}: {}", path.display(), e))?;
            let stats = store.stats()?;
            let payload = serde_json::json!({
                "store": path.display().to_string(),
                "connection": config.connection.method,
                "radios": config.radios.iter().map(|r| &r.name).collect::<Vec<_>>(),
                "retention_hours": config.storage.retention_hours,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Config level is the floor; each -v raises it.
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => configured.max(log::LevelFilter::Debug),
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs also echo to the console.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
