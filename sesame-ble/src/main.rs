//! Command line controller for Sesame 5 locks
//!
//! Scans for locks, keeps a logged in session open, or sends a single
//! lock/unlock/history command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use data_encoding::HEXLOWER;
use sesame_ble_controller::{ControllerConfig, ble, runner};
use sesame_central::{AppCommand, AutoLock, DeviceStatus, OneShot, StatusObserver};
use sesame_proto::{ItemCode, ResultCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sesame-ble")]
#[command(about = "BLE controller for Sesame 5 locks")]
struct Cli {
    /// Config file (default: $SESAME_HOME/config.json)
    #[arg(short, long, env = "SESAME_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Bluetooth adapter index, overrides the config file
    #[arg(short, long, global = true)]
    adapter: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Sesame locks
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// List every device, not only locks
        #[arg(long)]
        all: bool,
    },
    /// Stay connected and report status changes until interrupted
    Run {
        /// Lock again whenever the lock reports unlocked
        #[arg(long)]
        auto_lock: bool,
        /// History tag for commands issued by auto-lock
        #[arg(short, long)]
        tag: Option<String>,
        /// Drop a link that makes no progress for this many seconds
        #[arg(long)]
        stall_timeout: Option<u64>,
    },
    /// Lock the door
    Lock {
        /// History tag recorded by the lock
        #[arg(short, long)]
        tag: Option<String>,
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Unlock the door
    Unlock {
        /// History tag recorded by the lock
        #[arg(short, long)]
        tag: Option<String>,
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Ask the lock for its newest history entry
    History {
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

/// Prints every status change and hands commands to an optional inner observer
struct Report<O>(Option<O>);

impl<O: StatusObserver> StatusObserver for Report<O> {
    fn on_status(&mut self, status: DeviceStatus) -> Option<AppCommand> {
        println!("status: {status}");
        self.0.as_mut().and_then(|inner| inner.on_status(status))
    }

    fn on_response(&mut self, item_code: ItemCode, result: ResultCode) {
        println!("{item_code}: {result}");
        if let Some(inner) = self.0.as_mut() {
            inner.on_response(item_code, result);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => ControllerConfig::default_path()?,
    };
    let mut config = ControllerConfig::load(&path)?;
    if let Some(adapter) = cli.adapter {
        config.adapter = adapter;
    }

    match cli.command {
        Commands::Scan { duration, all } => scan_devices(&config, duration, all).await,
        Commands::Run {
            auto_lock,
            tag,
            stall_timeout,
        } => {
            if let Some(tag) = tag {
                config.default_tag = tag;
            }
            if stall_timeout.is_some() {
                config.stall_timeout_secs = stall_timeout;
            }
            run_forever(&config, auto_lock || config.auto_lock).await
        }
        Commands::Lock { tag, timeout } => {
            let tag = tag.map(String::into_bytes);
            one_shot(&config, AppCommand::Lock { tag }, timeout).await
        }
        Commands::Unlock { tag, timeout } => {
            let tag = tag.map(String::into_bytes);
            one_shot(&config, AppCommand::Unlock { tag }, timeout).await
        }
        Commands::History { timeout } => one_shot(&config, AppCommand::ReadHistory, timeout).await,
    }
}

async fn scan_devices(config: &ControllerConfig, duration: u64, all: bool) -> anyhow::Result<()> {
    println!("Scanning for Sesame locks ({duration} seconds)...");

    let adapter = ble::get_adapter(config.adapter).await?;
    let devices = ble::scan(&adapter, Duration::from_secs(duration)).await?;
    let shown: Vec<_> = devices.iter().filter(|d| all || d.is_sesame).collect();

    println!("\nFound {} devices:", shown.len());
    for device in shown {
        let rssi = device
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_sesame { " [SESAME]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
        println!("    ad: {}", HEXLOWER.encode(&device.advertisement));
    }
    Ok(())
}

/// Resolves on Ctrl-C
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("interrupted");
}

async fn run_forever(config: &ControllerConfig, auto_lock: bool) -> anyhow::Result<()> {
    let observer = Report(auto_lock.then_some(AutoLock));
    runner::run(config, observer, |_| false, interrupted()).await?;
    Ok(())
}

async fn one_shot(config: &ControllerConfig, command: AppCommand, timeout: u64) -> anyhow::Result<()> {
    let observer = Report(Some(OneShot::new(command)));
    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    let shutdown = async {
        tokio::select! {
            () = deadline => {}
            () = interrupted() => {}
        }
    };
    let observer = runner::run(
        config,
        observer,
        |c| c.observer().0.as_ref().is_some_and(OneShot::is_done),
        shutdown,
    )
    .await?;

    match observer.0.and_then(|shot| shot.result()) {
        Some(result) if result.is_success() => Ok(()),
        Some(result) => bail!("lock refused the command: {result}"),
        None => bail!("no answer from the lock within {timeout}s"),
    }
}
