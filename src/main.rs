//! Binary entrypoint for the groundlink CLI.
//!
//! Commands:
//! - `start [--endpoint <tcp:HOST:PORT|serial:PATH:BAUD>]` - connect, run the supervisor
//!   until Ctrl-C
//! - `init` - write a starter `groundlink.toml`
//! - `navigate --longitude <deg> --latitude <deg> [--timeout <s>]` - reposition and exit
//! - `status [--seconds <s>]` - listen for telemetry and print a JSON snapshot
//!
//! See the library crate docs for module-level details: `groundlink::`.
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use groundlink::channel::{open_link, Endpoint};
use groundlink::config::Config;
use groundlink::link::Link;
use groundlink::metrics;
use groundlink::vehicle::{CommandOutcome, Vehicle};

#[derive(Parser)]
#[command(name = "groundlink")]
#[command(about = "Ground-control link for MAVLink vehicles")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "groundlink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and supervise the vehicle until interrupted
    Start {
        /// Override the configured endpoint
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Reposition the vehicle and exit once it acknowledges
    Navigate {
        #[arg(long, allow_negative_numbers = true)]
        longitude: f64,
        #[arg(long, allow_negative_numbers = true)]
        latitude: f64,
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Listen for telemetry and print a JSON status snapshot
    Status {
        #[arg(short, long, default_value_t = 3)]
        seconds: u64,
        #[arg(short, long)]
        endpoint: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        println!("Wrote default configuration to {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => {}
        Commands::Start { endpoint } => {
            info!("Starting groundlink v{}", env!("CARGO_PKG_VERSION"));
            let link = connect(&config, endpoint.as_deref()).await?;
            let vehicle = Vehicle::attach(link, &config);
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| anyhow!("Failed to wait for Ctrl-C: {}", e))?;
            info!("Interrupted; shutting down");
            vehicle.shutdown().await;
        }
        Commands::Navigate {
            longitude,
            latitude,
            timeout,
            endpoint,
        } => {
            let link = connect(&config, endpoint.as_deref()).await?;
            let mut one_shot = config.clone();
            one_shot.supervisor.enabled = false;
            let vehicle = Vehicle::attach(link, &one_shot);

            let cancel = vehicle.cancel_token();
            let deadline = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout)).await;
                deadline.cancel();
            });
            let outcome = vehicle
                .commander()
                .navigate([longitude, latitude, 0.0], &cancel)
                .await;
            vehicle.shutdown().await;
            match outcome? {
                CommandOutcome::Accepted => println!("Navigation accepted"),
                CommandOutcome::Rejected(result) => {
                    return Err(anyhow!("Navigation rejected: {:?}", result))
                }
                CommandOutcome::Cancelled => {
                    return Err(anyhow!("No acknowledgement within {}s", timeout))
                }
            }
        }
        Commands::Status { seconds, endpoint } => {
            let link = connect(&config, endpoint.as_deref()).await?;
            let mut listen_only = config.clone();
            listen_only.supervisor.enabled = false;
            let vehicle = Vehicle::attach(link, &listen_only);
            tokio::time::sleep(Duration::from_secs(seconds)).await;

            let state = vehicle.state();
            let report = serde_json::json!({
                "time": state.time,
                "boot_time_ms": state.boot_time,
                "armed": state.armed,
                "position": state.position,
                "orientation": state.orientation,
                "target": state.target,
                "path_len": state.path.len(),
                "metrics": metrics::snapshot(),
            });
            vehicle.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn connect(config: &Config, endpoint: Option<&str>) -> Result<Link> {
    let endpoint: Endpoint = endpoint.unwrap_or(config.link.endpoint.as_str()).parse()?;
    open_link(&endpoint, config.link.identity(), config.retry.tuning())
        .await
        .map_err(|e| {
            warn!("Connection to {} failed: {}", endpoint, e);
            e
        })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = file {
        let write_mutex = std::sync::Mutex::new(f);
        // Mirror to the console only when attached to a terminal
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
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
