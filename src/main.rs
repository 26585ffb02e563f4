//! Binary entrypoint for the meshping CLI.
//!
//! Commands:
//! - `start [--host <addr>] [--serial <path>]` - run the bot until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print peer directory statistics and the effective settings
//! - `smoke-test [--timeout <s>]` - connect once, print identity and node count as JSON
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshping::bot::BotServer;
use meshping::config::{Config, ConnectionKind};
use meshping::meshtastic::{Connector, StreamConnector};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

#[derive(Parser)]
#[command(name = "meshping")]
#[command(about = "Ping and traceroute bot for Meshtastic mesh networks")]
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
    /// Start the bot
    Start {
        /// Connect over TCP to this radio address (overrides config)
        #[arg(long, conflicts_with = "serial")]
        host: Option<String>,

        /// Connect to a radio on this serial device (overrides config)
        #[arg(long)]
        serial: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show peer directory statistics and settings
    Status,
    /// Connect once, dump identity and node count, then exit
    SmokeTest {
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 45)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        info!("Writing default configuration");
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load_or_default(&cli.config).await?;
    config.apply_env_overrides();
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Start { host, serial } => {
            if let Some(host) = host {
                config.meshtastic.connection = ConnectionKind::Tcp;
                config.meshtastic.host = host;
            }
            if let Some(device) = serial {
                config.meshtastic.connection = ConnectionKind::Serial;
                config.meshtastic.serial_device = device;
            }
            info!("Using radio at {}", config.meshtastic.link_params());
            let mut server = BotServer::new(config).await?;
            server.run().await?;
        }
        Commands::Status => {
            let server = BotServer::new(config).await?;
            server.show_status();
        }
        Commands::SmokeTest { timeout: secs } => {
            let ok = smoke_test(&config, Duration::from_secs(secs)).await;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Commands::Init => {}
    }

    Ok(())
}

async fn smoke_test(config: &Config, wait: Duration) -> bool {
    let params = config.meshtastic.link_params();
    let connector = StreamConnector::new(params.clone()).with_handshake_timeout(wait);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    info!("Starting smoke test against {}", params);

    let transport = match timeout(wait, connector.open(events_tx)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            error!("Smoke test failed to connect: {}", e);
            print_result(&params.to_string(), None, 0, wait, Some(e.to_string()));
            return false;
        }
        Err(_) => {
            error!("Smoke test timed out after {}s", wait.as_secs());
            print_result(&params.to_string(), None, 0, wait, Some("timed out".into()));
            return false;
        }
    };

    let identity = transport.identity().await;
    let nodes = transport.node_db().await.map(|n| n.len()).unwrap_or(0);
    transport.close().await;
    match identity {
        Ok(ident) => {
            print_result(&params.to_string(), Some(&ident), nodes, wait, None);
            true
        }
        Err(e) => {
            warn!("Radio identity unavailable: {}", e);
            print_result(&params.to_string(), None, nodes, wait, Some(e.to_string()));
            false
        }
    }
}

fn print_result(
    link: &str,
    identity: Option<&meshping::meshtastic::Identity>,
    node_count: usize,
    wait: Duration,
    error: Option<String>,
) {
    let payload = serde_json::json!({
        "status": if error.is_none() { "ok" } else { "failed" },
        "link": link,
        "node": identity.and_then(|i| i.node).map(|n| n.to_string()),
        "name": identity.map(|i| i.display_name()),
        "node_count": node_count,
        "timeout_seconds": wait.as_secs(),
        "error": error,
    });
    println!("{}", payload);
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only in the foreground
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
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
