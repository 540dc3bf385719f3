//! `magcue` – relay between a MagCue sensor board and its UI clients.
//!
//! 1. Loads `~/.magcue/config.toml` (defaults when absent), then `MAGCUE_*`
//!    overrides, then command-line flags.
//! 2. `serve` (the default) locates the board, starts the HTTP/WebSocket
//!    relay, and on **Ctrl-C** parks the actuator at level 0 before exiting.
//! 3. `ports` and `monitor` are bench diagnostics that never start the relay.

mod config;
mod telemetry;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use magcue_hal::framing::{LineRead, read_crlf_line};
use magcue_hal::locator::select_port;
use magcue_hal::{
    DeviceSession, ParsedLine, PortEnumerator, SerialConnector, SessionState, SimulatedConnector, SimulatedPorts,
    SystemPorts, TokioSerialConnector, locate, parse,
};
use magcue_hub::BroadcastHub;
use magcue_server::RelayServer;
use magcue_types::{DistanceReading, RelayError};
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;

type CliResult = Result<(), Box<dyn Error>>;

/// Cadence of the simulated board's telemetry lines.
const SIM_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "magcue", version, about = "Relay between a MagCue sensor board and its UI clients")]
struct Cli {
    /// Config file to use instead of ~/.magcue/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay (default)
    Serve(ServeArgs),
    /// List serial ports and mark the one the relay would open
    Ports,
    /// Print each device line with its parse result
    Monitor {
        /// How long to listen
        #[arg(long, default_value_t = 30)]
        seconds: u64,
        /// Serial path to open instead of locating the board
        #[arg(long, value_name = "PATH")]
        device: Option<String>,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// HTTP + WebSocket port
    #[arg(long)]
    port: Option<u16>,
    /// Use a simulated sensor board instead of a serial device
    #[arg(long)]
    simulate: bool,
    /// Serial path to open instead of locating the board
    #[arg(long, value_name = "PATH")]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = telemetry::init_tracing("magcue");
    let cfg = config::resolve(cli.config.as_deref());
    debug!(?cfg, "effective configuration");

    let result = match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(cfg, args).await,
        Command::Ports => ports(&cfg),
        Command::Monitor { seconds, device } => monitor(&cfg, device, Duration::from_secs(seconds)).await,
        Command::Init { force } => init(cli.config.as_deref(), force),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

#[instrument(name = "relay", skip_all, fields(simulated = args.simulate))]
async fn serve(cfg: Config, args: ServeArgs) -> CliResult {
    let mut session_cfg = cfg.session_config();
    if args.device.is_some() {
        session_cfg.port_override = args.device;
    }
    let port = args.port.unwrap_or(cfg.http_port);

    let (session, events) = if args.simulate {
        info!("using simulated sensor board");
        DeviceSession::with_backends(
            session_cfg,
            Arc::new(SimulatedPorts),
            Arc::new(SimulatedConnector::new(SIM_TICK)),
        )
    } else {
        DeviceSession::new(session_cfg)
    };
    let hub = Arc::new(BroadcastHub::with_capacity(Arc::new(session), cfg.subscriber_capacity));
    let pump = hub.spawn_pump(events);

    print_banner(port, args.simulate);
    if hub.connect_device().await {
        println!("  {} device connected", "✓".green());
    } else {
        println!("  {} no device yet; POST /connect to retry", "!".yellow().bold());
    }

    let poller = cfg
        .reconnect_interval()
        .map(|every| spawn_reconnect_poller(Arc::clone(&hub), every));

    let result = RelayServer::new(Arc::clone(&hub))
        .with_port(port)
        .run_until(shutdown_signal())
        .await;

    println!();
    println!("{}", "Shutting down; parking the actuator at level 0 …".yellow());
    if let Some(poller) = poller {
        poller.abort();
    }
    hub.shutdown(cfg.shutdown_wait()).await;
    pump.abort();

    result.map_err(Into::into)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}

/// Caller-side retry: the session itself never reconnects.
fn spawn_reconnect_poller(hub: Arc<BroadcastHub>, every: Duration) -> JoinHandle<()> {
    info!(every_secs = every.as_secs(), "device reconnect polling enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; startup already tried.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let state = hub.device_snapshot().state;
            if matches!(state, SessionState::Idle | SessionState::Faulted) {
                debug!("device idle; attempting reconnect");
                hub.connect_device().await;
            }
        }
    })
}

fn print_banner(port: u16, simulated: bool) {
    println!();
    println!("{}", "  MagCue relay".bold().cyan());
    println!("  http://localhost:{port}  (WebSocket on the same port)");
    if simulated {
        println!("  {}", "simulated sensor board".dimmed());
    }
    println!("  Press Ctrl-C to stop.");
    println!();
}

// ---------------------------------------------------------------------------
// ports
// ---------------------------------------------------------------------------

fn ports(cfg: &Config) -> CliResult {
    let ports = SystemPorts.list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    let chosen = match &cfg.port_override {
        Some(path) => Some(path.clone()),
        None => select_port(&ports, &cfg.vendor_signatures).map(|p| p.path.clone()),
    };
    for port in &ports {
        let marker = if chosen.as_deref() == Some(port.path.as_str()) {
            "→".green().bold()
        } else {
            " ".normal()
        };
        let vendor = port.manufacturer.as_deref().unwrap_or("(unknown manufacturer)");
        let product = port.product.as_deref().unwrap_or("");
        println!("{marker} {:<24} {} {}", port.path.bold(), vendor, product.dimmed());
    }

    println!();
    match chosen {
        Some(path) => println!("The relay would open {}", path.bold()),
        None => println!(
            "{}",
            format!("No port matches {:?}", cfg.vendor_signatures).yellow()
        ),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// monitor
// ---------------------------------------------------------------------------

async fn monitor(cfg: &Config, device: Option<String>, duration: Duration) -> CliResult {
    let path = match device.or_else(|| cfg.port_override.clone()) {
        Some(path) => path,
        None => {
            locate(&SystemPorts, &cfg.vendor_signatures)?
                .ok_or(RelayError::DeviceNotFound)?
                .path
        }
    };
    println!(
        "Listening on {} at {} baud for {}s …",
        path.bold(),
        cfg.baud_rate,
        duration.as_secs()
    );

    let stream = TokioSerialConnector.open(&path, cfg.baud_rate).await?;
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut readings = 0usize;
    let mut other = 0usize;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            read = read_crlf_line(&mut reader, &mut line) => match read? {
                LineRead::Line => {
                    let text = String::from_utf8_lossy(&line);
                    if describe_line(&text) {
                        readings += 1;
                    } else {
                        other += 1;
                    }
                }
                LineRead::Overflow => {
                    other += 1;
                    println!("  {}", "oversized line discarded".yellow());
                }
                LineRead::Eof => {
                    println!("{}", "Device closed the stream.".yellow());
                    break;
                }
            },
        }
    }

    println!();
    println!("{readings} readings, {other} other lines");
    Ok(())
}

/// Print one line with its classification.  Returns whether it would be
/// forwarded as a reading.
fn describe_line(text: &str) -> bool {
    match parse(text) {
        ParsedLine::DistanceLine { percent } => match DistanceReading::new(percent, Utc::now()) {
            Ok(reading) => {
                println!("  {} {:>6.2} %", "reading".green(), reading.percent());
                true
            }
            Err(_) => {
                println!("  {} {percent} (out of range)", "rejected".yellow());
                false
            }
        },
        ParsedLine::InfoLine { text } => {
            println!("  {} {text}", "info".dimmed());
            false
        }
        ParsedLine::Unrecognized { raw } => {
            println!("  {} {raw}", "other".dimmed());
            false
        }
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(path: Option<&Path>, force: bool) -> CliResult {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config::config_path);
    if path.exists() && !force {
        return Err(format!("{} already exists; pass --force to overwrite", path.display()).into());
    }
    config::save_to(&Config::default(), &path)?;
    println!("{} wrote {}", "✓".green(), path.display());
    Ok(())
}
