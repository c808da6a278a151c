//! Peripheral tool - create disk images, attach a configured machine and
//! inspect snapshot files
//!
//! Usage:
//!   periph create <PATH> [--size-mb N] [--block-size N]
//!   periph geometry --size <BYTES> [--block-size N]
//!   periph attach <CONFIG> [--save <SNAPSHOT>]
//!   periph inspect <SNAPSHOT> [--json]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use periph_core::config::Config;
use periph_core::port::LatchPort;
use periph_core::scsi::ScsiDisk;
use periph_core::storage::{self, BackingStore, FileStore};
use periph_core::{snapshot, Bus, Disk, Machine, Snapshot};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "periph")]
#[command(about = "Emulated peripheral bus, disks and snapshots", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a zero-filled disk image
    Create {
        /// Image path
        path: PathBuf,

        /// Size in MB
        #[arg(short, long, default_value_t = storage::DEFAULT_CREATE_SIZE_MB)]
        size_mb: u64,

        /// Logical block size
        #[arg(short, long, default_value_t = storage::DEFAULT_BLOCK_SIZE)]
        block_size: u32,
    },

    /// Print the disk layout for a size
    Geometry {
        /// Size in bytes
        #[arg(short, long)]
        size: u64,

        /// Logical block size
        #[arg(short, long, default_value_t = storage::DEFAULT_BLOCK_SIZE)]
        block_size: u32,
    },

    /// Attach the disks and ports of a configuration and probe each disk
    Attach {
        /// Configuration file (TOML)
        config: PathBuf,

        /// Write a snapshot of the attached machine
        #[arg(short, long)]
        save: Option<PathBuf>,
    },

    /// List the records in a snapshot file
    Inspect {
        /// Snapshot file
        path: PathBuf,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Create {
            path,
            size_mb,
            block_size,
        } => {
            init_logging("info");
            create(&path, size_mb, block_size)
        }
        Command::Geometry { size, block_size } => {
            init_logging("info");
            storage::validate_block_size(block_size)?;
            let geometry = storage::determine_layout(size, block_size);
            println!(
                "C/H/S {}/{}/{}, {} byte blocks, {} bytes addressable",
                geometry.cylinders,
                geometry.heads,
                geometry.sectors,
                geometry.block_size,
                geometry.capacity()
            );
            Ok(())
        }
        Command::Attach { config, save } => attach(&config, save),
        Command::Inspect { path, json } => {
            init_logging("info");
            inspect(&path, json)
        }
    }
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();
}

fn create(path: &Path, size_mb: u64, block_size: u32) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }

    let mut store = FileStore::open_or_create(path, size_mb, false, &mut std::io::stderr())
        .with_context(|| format!("failed to create {}", path.display()))?;
    store.set_block_size(block_size)?;

    let geometry = store.geometry();
    println!(
        "{}: {} bytes, C/H/S {}/{}/{}",
        path.display(),
        store.byte_size(),
        geometry.cylinders,
        geometry.heads,
        geometry.sectors
    );
    Ok(())
}

fn attach(config_path: &Path, save: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    env_logger::Builder::new()
        .filter_level(parse_log_level(&config.machine.log_level))
        .init();

    log::info!("periph v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Loaded configuration from {}", config_path.display());

    let mut machine = Machine::from_config(&config, &mut std::io::stderr())
        .context("failed to attach machine")?;

    let targets: Vec<_> = machine.disks().iter().map(|d| d.target).collect();
    for target in targets {
        match machine.probe(target).context("bus protocol error")? {
            Some(probe) => {
                let disk = machine.disks().iter().find(|d| d.target == target);
                let model = disk
                    .map(|d| d.device.borrow().disk().model().to_string())
                    .unwrap_or_default();
                println!(
                    "target {}: {} {} blocks of {} bytes{}",
                    target,
                    model,
                    probe.last_lba as u64 + 1,
                    probe.block_size,
                    if probe.ready { "" } else { " (not ready)" }
                );
            }
            None => println!("target {}: no response", target),
        }
    }

    let save = save.or_else(|| config.machine.snapshot.as_ref().map(PathBuf::from));
    if let Some(path) = save {
        let file = File::create(&path)
            .with_context(|| format!("failed to create snapshot {}", path.display()))?;
        let mut sink = BufWriter::new(file);
        let written = machine.save_snapshot(&mut sink)?;
        sink.flush()?;
        println!("snapshot: {} bytes written to {}", written, path.display());
    }

    machine.detach();
    Ok(())
}

fn record_name(magic: u32) -> &'static str {
    match magic {
        m if m == Bus::MAGIC_START => "bus",
        m if m == Disk::MAGIC_START => "disk",
        m if m == ScsiDisk::MAGIC_START => "scsi-disk",
        m if m == LatchPort::MAGIC_START => "latch-port",
        _ => "unknown",
    }
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("failed to open snapshot {}", path.display()))?;
    let records = snapshot::scan_records(&mut BufReader::new(file))
        .with_context(|| format!("corrupt snapshot {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        println!(
            "{:>8}  {:<10}  {:#010x}  {:>6} bytes  {:#010x}",
            record.offset,
            record_name(record.magic_start),
            record.magic_start,
            record.size,
            record.magic_end
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}

/// Parse log level string
fn parse_log_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => {
            eprintln!("Unknown log level '{}', defaulting to 'info'", level);
            log::LevelFilter::Info
        }
    }
}
