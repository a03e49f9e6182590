//! softmig-smi - inspect and administer a shared region
//!
//! # Commands
//!
//! - `info`: header, limits and lock state
//! - `list`: registered processes and their per-device usage
//! - `usage`: aggregate usage against the limit per device
//! - `reap`: evict slots whose owner is dead
//! - `suspend` / `resume`: signal every registered process

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use softmig_core::constants::DEFAULT_REGION_PATH;
use softmig_runtime::{RegionHandle, RegionResult};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "softmig-smi")]
#[command(version)]
#[command(about = "Inspect and administer a softmig shared region")]
struct Cli {
    /// Region backing file
    #[arg(long, env = "CUDA_DEVICE_MEMORY_SHARED_CACHE", default_value = DEFAULT_REGION_PATH)]
    path: PathBuf,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the region header
    Info,
    /// List registered processes
    List,
    /// Show aggregate usage per device
    Usage,
    /// Evict slots of dead processes
    Reap,
    /// Ask every registered process to release device memory
    Suspend,
    /// Let suspended processes continue
    Resume,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("softmig-smi: {}: {}", cli.path.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> RegionResult<()> {
    let region = RegionHandle::inspect(&cli.path)?;
    match cli.command {
        Commands::Info => info(&region),
        Commands::List => list(&region),
        Commands::Usage => usage(&region)?,
        Commands::Reap => {
            let reaped = region.clear_dead_slots();
            println!("reaped {} slot(s), {} registered", reaped, region.proc_num());
        }
        Commands::Suspend => println!("signalled {} process(es)", region.suspend_all()),
        Commands::Resume => println!("signalled {} process(es)", region.resume_all()),
    }
    Ok(())
}

fn info(region: &RegionHandle) {
    let (major, minor) = region.version();
    println!("path:               {}", region.path().display());
    match region.init_state() {
        Some(state) => println!("state:              {}", state),
        None => println!("state:              unknown"),
    }
    println!("version:            {}.{}", major, minor);
    println!("devices:            {}", region.device_count());
    println!("processes:          {}", region.proc_num());
    println!("lock:               {}", region.lock_state());
    println!("priority:           {}", region.priority());
    println!("utilization switch: {}", region.utilization_switch());
    println!("recent kernel:      {}", region.recent_kernel());
    println!("last kernel time:   {}", region.last_kernel_time());
    for dev in 0..region.device_count() {
        let mem = region.configured_limit(dev).unwrap_or(0);
        let sm = region.configured_sm_limit(dev).unwrap_or(0);
        println!("  dev {:2}: memory {:>14}  sm {:>3}%", dev, format_limit(mem), sm);
    }
}

fn list(region: &RegionHandle) {
    let slots = region.snapshot();
    if slots.is_empty() {
        println!("no registered processes");
        return;
    }
    println!(
        "{:>5} {:>8} {:>8} {:>10} {:>4} {:>12} {:>12} {:>12} {:>12} {:>5}",
        "slot", "pid", "hostpid", "status", "dev", "context", "module", "data", "monitor", "sm%"
    );
    for slot in slots {
        for d in slot.devices.iter().filter(|d| d.usage.total > 0 || d.monitor > 0 || d.sm_util > 0) {
            println!(
                "{:>5} {:>8} {:>8} {:>10} {:>4} {:>12} {:>12} {:>12} {:>12} {:>5}{}",
                slot.index,
                slot.pid,
                slot.hostpid,
                format!("{:?}", slot.status),
                d.dev,
                d.usage.context,
                d.usage.module,
                d.usage.data,
                d.monitor,
                d.sm_util,
                if d.consistent { "" } else { " ~" },
            );
        }
        if slot.devices.iter().all(|d| d.usage.total == 0) {
            println!(
                "{:>5} {:>8} {:>8} {:>10}    -",
                slot.index,
                slot.pid,
                slot.hostpid,
                format!("{:?}", slot.status)
            );
        }
    }
}

fn usage(region: &RegionHandle) -> RegionResult<()> {
    println!("{:>4} {:>14} {:>14} {:>14}", "dev", "used", "limit", "monitor");
    for dev in 0..region.device_count() {
        let reading = region.usage_reading(dev)?;
        let limit = region.configured_limit(dev)?;
        let monitor = region.monitor_usage(dev)?;
        println!(
            "{:>4} {:>14} {:>14} {:>14}{}",
            dev,
            reading.bytes,
            format_limit(limit),
            monitor,
            if reading.is_exact() { "" } else { "  (approximate)" },
        );
    }
    Ok(())
}

fn format_limit(bytes: u64) -> String {
    if bytes == 0 {
        "unlimited".to_string()
    } else {
        bytes.to_string()
    }
}
