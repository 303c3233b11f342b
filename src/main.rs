//! hcitap - Bluetooth HCI capture and command tool
//!
//! Lists and activates local adapters, captures HCI traffic to a btsnoop
//! log, and sends raw HCI packets.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hcitap::reporter::{ConsoleReporter, RecordReporter};
use hcitap::{bring_up, list_devices, Config, Session, TransportMode};

#[derive(Parser)]
#[command(name = "hcitap")]
#[command(about = "Bluetooth HCI tap: capture, log and inject HCI traffic")]
#[command(version)]
struct Cli {
    /// Log level (overrides the configured level, RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List local Bluetooth adapters
    List,
    /// Bring an adapter up (requires root)
    Up {
        /// Device id, e.g. 0 for hci0
        id: i32,
    },
    /// Capture HCI traffic until Ctrl+C
    Capture {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Print a hex dump of every packet
        #[arg(short, long)]
        verbose: bool,
    },
    /// Send one HCI packet and print the reply payload
    Send {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Milliseconds to wait for the reply (0 sends without waiting)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// H4 packet type (1 = command, 2 = ACL, ...)
        h4_type: u8,

        /// Payload as hex, e.g. 030c00 for HCI_Reset
        payload: String,
    },
}

#[derive(Args)]
struct ConnectionArgs {
    /// Adapter name
    #[arg(short, long)]
    interface: Option<String>,

    /// Transport: hci, user or loopback
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// btsnoop log file
    #[arg(short = 'w', long)]
    write: Option<PathBuf>,

    /// Do not write a btsnoop log
    #[arg(long, conflicts_with = "write")]
    no_log: bool,
}

impl ConnectionArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(path) = &self.write {
            config.btsnoop_path = path.clone();
            config.write_btsnoop = true;
        }
        if self.no_log {
            config.write_btsnoop = false;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, mut config: Config) -> Result<()> {
    match command {
        Commands::List => list(),
        Commands::Up { id } => {
            bring_up(id).with_context(|| format!("failed to bring up hci{}", id))?;
            println!("hci{} is up", id);
            Ok(())
        }
        Commands::Capture {
            connection,
            verbose,
        } => {
            connection.apply(&mut config);
            capture(config, verbose)
        }
        Commands::Send {
            connection,
            timeout_ms,
            h4_type,
            payload,
        } => {
            connection.apply(&mut config);
            let timeout = match timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => Some(config.response_timeout),
            };
            let payload = hex::decode(payload.trim_start_matches("0x"))
                .context("payload is not valid hex")?;
            send(config, h4_type, &payload, timeout)
        }
    }
}

fn list() -> Result<()> {
    let devices = list_devices().context("failed to enumerate HCI devices")?;
    if devices.is_empty() {
        println!("No Bluetooth adapters found.");
    }
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

fn connect(config: Config) -> Result<Session> {
    let mode = config.mode;
    let interface = config.interface.clone();
    let session = Session::new(config).context("failed to open btsnoop log")?;
    session
        .connect(mode, &interface)
        .with_context(|| format!("failed to connect to {} via {}", interface, mode))?;
    Ok(session)
}

fn capture(config: Config, verbose: bool) -> Result<()> {
    let poll_interval = config.poll_interval;
    let session = connect(config)?;

    let reporter = Arc::new(ConsoleReporter::new().with_hex_dump(verbose));
    let sink = Arc::clone(&reporter);
    session.register_callback(move |record| sink.report(record));
    reporter.on_start(&session.config().interface);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    while !stop.load(Ordering::SeqCst) && session.is_running() {
        std::thread::sleep(poll_interval);
    }

    reporter.on_stop();
    match session.shutdown() {
        Some(end @ hcitap::SessionEnd::TransportLost(_)) => bail!("capture ended: {}", end),
        _ => {
            info!("Capture finished");
            Ok(())
        }
    }
}

fn send(config: Config, h4_type: u8, payload: &[u8], timeout: Option<Duration>) -> Result<()> {
    let session = connect(config)?;

    let reply = session
        .send(h4_type, payload, timeout)
        .context("failed to send packet")?;
    match (timeout, reply) {
        (None, _) => println!("sent"),
        (Some(_), Some(reply)) => println!("{}", hex::encode(reply)),
        (Some(timeout), None) => println!("no reply within {:?}", timeout),
    }

    if timeout.is_none() {
        // Give the send engine one poll to transmit before closing
        std::thread::sleep(session.config().poll_interval);
    }
    session.shutdown();
    Ok(())
}
