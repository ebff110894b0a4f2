//! Binary entrypoint for the sbdlink CLI.
//!
//! Commands:
//! - `run [--once]` - periodic outbound exchange loop against the modem
//! - `inbound [--once]` - periodic dispatcher loop over the inbound drop
//! - `encode <file> [-x] [-r] [-f <name>] [-o <stem>]` - build FILE_UPLOAD part files
//! - `check` - modem readiness and signal smoke test, JSON summary
//! - `init` - write a starter `sbdlink.toml`
//!
//! See the library crate docs for module-level details: `sbdlink::`.
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sbdlink::config::Config;
use sbdlink::inbound::Dispatcher;
use sbdlink::transfer::{encode_file, Reassembler, TransferOptions};
use sbdlink::transport::FileDrop;

#[derive(Parser)]
#[command(name = "sbdlink")]
#[command(about = "Store-and-forward messaging over Iridium SBD")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "sbdlink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Send queued files and poll for inbound traffic
    Run {
        /// Run a single exchange cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Dispatch received messages from the inbound drop
    Inbound {
        /// Drain the inbox once and exit
        #[arg(long)]
        once: bool,
    },
    /// Split a file into FILE_UPLOAD part files
    Encode {
        /// File to send
        input: PathBuf,
        /// Execute the file after it is written on the receiver
        #[arg(short = 'x', long)]
        execute: bool,
        /// Remove the file on the receiver after processing
        #[arg(short, long)]
        remove: bool,
        /// Destination filename on the receiver (defaults to the input path)
        #[arg(short, long)]
        filename: Option<String>,
        /// Output stem; parts are written as <stem>_NNN.sbd
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Probe the modem: readiness, signal and SBD status
    Check,
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init | Commands::Encode { .. } => None,
        _ => Some(Config::load(&cli.config).await?),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new sbdlink configuration");
            if Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists, not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Encode {
            input,
            execute,
            remove,
            filename,
            output,
        } => {
            encode_command(&input, TransferOptions { execute, remove }, filename, output).await?;
        }
        Commands::Run { once } => {
            let config = require_config(pre_config)?;
            run_exchange(config, once).await?;
        }
        Commands::Inbound { once } => {
            let config = require_config(pre_config)?;
            run_inbound(config, once).await?;
        }
        Commands::Check => {
            let config = require_config(pre_config)?;
            check_modem(config).await?;
        }
    }

    Ok(())
}

fn require_config(config: Option<Config>) -> Result<Config> {
    let config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
    config.validate()?;
    Ok(config)
}

/// Shared liveness flag, cleared on Ctrl-C so in-flight modem waits abort.
fn shutdown_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested");
            flag.store(false, Ordering::SeqCst);
        }
    });
    running
}

async fn encode_command(
    input: &Path,
    options: TransferOptions,
    filename: Option<String>,
    output: Option<String>,
) -> Result<()> {
    let contents = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    let filename = filename.unwrap_or_else(|| input.to_string_lossy().into_owned());
    let stem = output.unwrap_or_else(|| {
        input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "transfer".to_string())
    });

    let transfer = encode_file(&contents, &filename, options)?;

    for (index, part) in transfer.parts.iter().enumerate() {
        let path = format!("{}_{:03}.sbd", stem, index);
        tokio::fs::write(&path, part)
            .await
            .with_context(|| format!("writing {}", path))?;
        info!("Wrote {} ({} bytes)", path, part.len());
    }

    println!("Serial number: {}", transfer.serial);
    println!("Parts:         {}", transfer.parts.len());
    println!("Length:        {}", transfer.original_len);
    println!("CRC32:         0x{:08x}", transfer.crc32);
    println!("Flags:         0x{:02x}", transfer.flags.bits());
    Ok(())
}

async fn run_inbound(config: Config, once: bool) -> Result<()> {
    let running = shutdown_flag();
    let reassembler = Reassembler::new(&config.inbound.staging_dir, &config.inbound.output_root)
        .with_context(|| format!("creating staging dir {}", config.inbound.staging_dir))?
        .with_stale_age(config.inbound.stale_transfer_age());
    let mut dispatcher = Dispatcher::new(reassembler, config.inbound.ack_path.clone());
    let inbox = FileDrop::new(&config.inbound.inbox_dir);
    let interval = Duration::from_secs(config.inbound.poll_interval_secs);

    info!("Inbound dispatcher watching {}", inbox.dir().display());

    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::SeqCst) {
            match dispatcher.process_pending(&inbox) {
                Ok(0) => {}
                Ok(n) => info!("Processed {} inbound messages", n),
                Err(e) => error!("Inbound dispatch failed: {:#}", e),
            }
            if once {
                break;
            }
            sleep_while(&running, interval);
        }
    })
    .await?;
    Ok(())
}

fn sleep_while(running: &AtomicBool, delay: Duration) {
    let end = Instant::now() + delay;
    while running.load(Ordering::SeqCst) {
        let left = end.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(Duration::from_millis(250)));
    }
}

#[cfg(feature = "serial")]
fn open_modem(config: &Config, running: Arc<AtomicBool>) -> Result<sbdlink::modem::Modem> {
    use sbdlink::modem::Modem;

    info!("Scanning for modems:");
    let (device, lock) = config
        .modem
        .find_device()
        .ok_or_else(|| anyhow!("No modem found"))?;
    info!("Iridium device found: {}", device.display());

    Modem::open(
        &device,
        &lock,
        config.modem.baud_rate,
        config.modem.serial_timeout(),
        config.modem.settings(),
        running,
    )
    .with_context(|| format!("opening modem {}", device.display()))
}

#[cfg(feature = "serial")]
async fn run_exchange(config: Config, once: bool) -> Result<()> {
    use sbdlink::exchange::ExchangeScheduler;

    let running = shutdown_flag();
    let modem = open_modem(&config, running.clone())?;
    let sources = config.sources()?;
    for source in &sources {
        info!(
            "Source {} (code {}, priority {}): {}",
            source.name, source.code, source.priority, source.pattern
        );
    }

    let inbound = FileDrop::new(&config.exchange.inbound_dir);
    let mut scheduler = ExchangeScheduler::new(sources, modem, inbound);
    let interval = Duration::from_secs(config.exchange.interval_secs);

    tokio::task::spawn_blocking(move || {
        if once {
            let report = scheduler.tick();
            info!("Exchange cycle: {:?}, {} inbound", report.outcome, report.inbound);
        } else {
            scheduler.run(interval, &running);
        }
        let counters = scheduler.counters();
        info!(
            "Exchange stopped: {} cycles, {} files sent ({} bytes), {} failed, {} messages received",
            counters.cycles,
            counters.files_sent,
            counters.bytes_sent,
            counters.files_failed,
            counters.messages_received
        );
    })
    .await?;
    Ok(())
}

#[cfg(feature = "serial")]
async fn check_modem(config: Config) -> Result<()> {
    let running = shutdown_flag();
    let mut modem = open_modem(&config, running)?;

    let payload = tokio::task::spawn_blocking(move || {
        let ready = modem.ready();
        let signal = modem.get_signal_level();
        let status = modem.status();
        serde_json::json!({
            "status": if ready.is_ok() { "ok" } else { "unavailable" },
            "ready_error": ready.as_ref().err().map(|e| e.to_string()),
            "signal": signal.as_ref().ok(),
            "ring_alert": status.as_ref().ok().map(|s| s.ring_alert),
            "messages_waiting": status.as_ref().ok().map(|s| s.messages_waiting),
            "mo_buffer_full": status.as_ref().ok().map(|s| s.mo_flag),
        })
    })
    .await?;

    let ok = payload["status"] == "ok";
    println!("{}", payload);
    std::process::exit(if ok { 0 } else { 1 });
}

#[cfg(not(feature = "serial"))]
async fn run_exchange(_config: Config, _once: bool) -> Result<()> {
    error!("The exchange loop requires the 'serial' feature");
    std::process::exit(2);
}

#[cfg(not(feature = "serial"))]
async fn check_modem(_config: Config) -> Result<()> {
    error!("Modem check requires the 'serial' feature");
    std::process::exit(2);
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

        // Foreground runs also echo to the console
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
