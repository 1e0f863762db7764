use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use uuc_core::daemon::{Daemon, DaemonConfig, TransportKind};
use uuc_core::transport::{FfsTransport, UtpTransport};
use uuc_core::{Watchdog, reboot_system, write_boot_stream};

#[derive(Parser, Debug)]
#[command(author, version, about = "i.MX Update Utility daemon (Pure Rust)", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve host commands until a reboot is requested
    Daemon {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Host channel (overrides the config file)
        #[arg(short, long, value_enum)]
        transport: Option<TransportArg>,

        /// UTP device node or FunctionFS ep0 path (overrides the config file)
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// Write a boot stream into the 'S' partition of an SD card
    Sdimage {
        /// Firmware image
        #[arg(short, long)]
        firmware: PathBuf,

        /// Block device (e.g. /dev/mmcblk0)
        #[arg(short, long)]
        device: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransportArg {
    Utp,
    Ffs,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Utp => TransportKind::Utp,
            TransportArg::Ffs => TransportKind::Ffs,
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    let result = match args.command {
        Mode::Daemon {
            config,
            transport,
            device,
        } => run_daemon(config, transport, device),
        Mode::Sdimage { firmware, device } => run_sdimage(&firmware, &device),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_daemon(
    config_path: Option<PathBuf>,
    transport: Option<TransportArg>,
    device: Option<PathBuf>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => DaemonConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(kind) = transport {
        config.transport.kind = kind.into();
    }
    if let Some(device) = device {
        match config.transport.kind {
            TransportKind::Utp => config.transport.utp_device = device,
            TransportKind::Ffs => config.transport.ffs_ep0 = device,
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?config.transport.kind,
        "Starting UUC daemon"
    );

    let grace = config.timing.reboot_grace();
    match config.transport.kind {
        TransportKind::Utp => {
            let transport = UtpTransport::wait_and_open(
                &config.transport.utp_device,
                &config.sys_root,
                config.timing.device_retry(),
            )?;
            let cpu_id = match transport.cpu_id() {
                Ok(id) => {
                    info!(cpu_id = id, "SoC identified");
                    Some(id)
                }
                Err(e) => {
                    warn!(error = %e, "Could not read SoC id");
                    None
                }
            };
            let _watchdog = start_watchdog(&config, cpu_id);
            Daemon::new(transport, config).run()?;
        }
        TransportKind::Ffs => {
            let transport = FfsTransport::open(&config.transport.ffs_ep0)?;
            let _watchdog = start_watchdog(&config, None);
            Daemon::new(transport, config).run()?;
        }
    }

    reboot_system(grace)
}

fn start_watchdog(config: &DaemonConfig, cpu_id: Option<i32>) -> Option<Watchdog> {
    let wd = &config.watchdog;
    if !wd.enabled_for(cpu_id) {
        return None;
    }
    if let Err(e) = uuc_core::devnode::mk_devnode(
        &config.sys_root,
        "class/misc",
        "watchdog",
        &wd.device,
        uuc_core::devnode::NodeKind::Char,
    ) {
        warn!(error = %e, "Watchdog node unavailable");
    }
    match Watchdog::start(
        &wd.device,
        wd.timeout_secs,
        Duration::from_secs(wd.interval_secs),
    ) {
        Ok(dog) => Some(dog),
        Err(e) => {
            warn!(error = %e, "Watchdog not started");
            None
        }
    }
}

fn run_sdimage(firmware: &Path, device: &Path) -> Result<()> {
    let image = std::fs::read(firmware)
        .with_context(|| format!("Failed to read {}", firmware.display()))?;
    let mut disk = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .with_context(|| format!("Failed to open {}", device.display()))?;

    let bcb = write_boot_stream(&mut disk, &image)?;
    disk.sync_all()?;
    info!(
        device = %device.display(),
        primary = bcb.first_sectors[0],
        secondary = bcb.first_sectors[1],
        "Boot stream installed"
    );
    Ok(())
}
