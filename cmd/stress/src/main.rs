//! Stress test - many processes racing for one memory quota
//!
//! Forks worker processes that allocate and free against a shared limit
//! through a simulated driver, then checks with every worker paused
//! holding its allocations that the aggregate never went past the limit.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use softmig::{init_logging, Allocator, DeviceSpec, RegionConfig, RegionHandle};
use softmig_core::parse_limit;
use softmig_runtime::sim::SimDriver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "softmig-stress")]
#[command(about = "Race several processes against one device memory limit")]
struct Args {
    /// Worker processes
    #[arg(short, long, default_value_t = 8)]
    children: usize,

    /// Device 0 memory limit (k/m/g suffix allowed)
    #[arg(short, long, default_value = "256m")]
    limit: String,

    /// Allocation size (k/m/g suffix allowed)
    #[arg(long, default_value = "4m")]
    chunk: String,

    /// Allocate/free rounds per worker
    #[arg(short, long, default_value_t = 200)]
    rounds: usize,

    /// Region backing file (default: a per-run file under /tmp)
    #[arg(long)]
    path: Option<PathBuf>,
}

/// One-byte signalling between the parent and the workers
#[derive(Clone, Copy)]
struct Pipe {
    read: libc::c_int,
    write: libc::c_int,
}

impl Pipe {
    fn new() -> Option<Self> {
        let mut fds = [0; 2];
        // Safety: fds has room for the two descriptors
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return None;
        }
        Some(Pipe {
            read: fds[0],
            write: fds[1],
        })
    }

    fn send(&self) {
        let b = [1u8];
        unsafe { libc::write(self.write, b.as_ptr().cast(), 1) };
    }

    fn recv(&self) -> bool {
        let mut b = [0u8];
        unsafe { libc::read(self.read, b.as_mut_ptr().cast(), 1) == 1 }
    }

    fn close_read(&self) {
        unsafe { libc::close(self.read) };
    }

    fn close_write(&self) {
        unsafe { libc::close(self.write) };
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    let (limit, chunk) = match (parse_limit(&args.limit), parse_limit(&args.chunk)) {
        (Ok(l), Ok(c)) if c > 0 => (l, c),
        _ => {
            eprintln!("softmig-stress: invalid --limit or --chunk");
            return ExitCode::FAILURE;
        }
    };
    let path = args
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("/tmp/softmig-stress-{}.cache", std::process::id())));
    let config = RegionConfig::new().path(&path).memory_limit(0, limit);

    println!("=== softmig stress ===\n");
    println!("Workers: {}", args.children);
    println!("Limit:   {} bytes", limit);
    println!("Chunk:   {} bytes", chunk);
    println!("Rounds:  {}", args.rounds);

    let ok = match run(&args, config, limit, chunk) {
        Ok(ok) => ok,
        Err(e) => {
            eprintln!("softmig-stress: {}", e);
            false
        }
    };
    if args.path.is_none() {
        let _ = std::fs::remove_file(&path);
    }
    if ok {
        println!("\n✓ PASSED");
        ExitCode::SUCCESS
    } else {
        println!("\n✗ FAILED");
        ExitCode::FAILURE
    }
}

fn run(args: &Args, config: RegionConfig, limit: u64, chunk: u64) -> Result<bool, Box<dyn std::error::Error>> {
    // Initialize before forking so workers only attach
    let region = RegionHandle::attach(config.clone())?;
    let ready = Pipe::new().ok_or("pipe failed")?;
    let release = Pipe::new().ok_or("pipe failed")?;

    let start = Instant::now();
    let mut workers = Vec::with_capacity(args.children);
    for _ in 0..args.children {
        // Safety: the child only runs `worker` and leaves through _exit
        match unsafe { libc::fork() } {
            -1 => return Err("fork failed".into()),
            0 => {
                release.close_write();
                let code = worker(config.clone(), chunk, args.rounds, ready, release);
                unsafe { libc::_exit(code) }
            }
            pid => workers.push(pid),
        }
    }
    release.close_read();
    // Workers hold the only write ends; a dead worker then shows as EOF
    ready.close_write();

    let mut paused = 0;
    while paused < workers.len() && ready.recv() {
        paused += 1;
    }
    let reading = region.usage_reading(0)?;
    let registered = region.proc_num();
    release.close_write();

    let mut failed = 0;
    for pid in &workers {
        let mut status = 0;
        unsafe { libc::waitpid(*pid, &mut status, 0) };
        if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
            warn!(pid, status, "worker failed");
            failed += 1;
        }
    }

    println!("\n=== Results ===");
    println!("Elapsed:        {:?}", start.elapsed());
    println!("Workers paused: {}/{}", paused, workers.len());
    println!("Registered:     {}", registered);
    println!("Usage at pause: {} bytes{}", reading.bytes, if reading.is_exact() { "" } else { " (approximate)" });
    println!("After exit:     {} bytes", region.total_usage(0)?);
    println!("Failed workers: {}", failed);

    let within = limit == 0 || reading.bytes <= limit;
    if !within {
        println!("usage {} exceeds limit {}", reading.bytes, limit);
    }
    Ok(within && failed == 0 && paused == workers.len())
}

/// Churn allocations, then pause holding them until the parent has looked
fn worker(config: RegionConfig, chunk: u64, rounds: usize, ready: Pipe, release: Pipe) -> i32 {
    let region = match RegionHandle::attach(config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            warn!(error = %e, "attach failed");
            return 1;
        }
    };
    if let Err(e) = region.register_self() {
        warn!(error = %e, "register failed");
        return 1;
    }
    let alloc = Allocator::new(region.clone(), Arc::new(SimDriver::new(DeviceSpec::new(80, 2048), 1 << 40)));

    let mut held = Vec::new();
    let mut refused = 0usize;
    for round in 0..rounds {
        match alloc.allocate(chunk) {
            Ok(p) => held.push(p),
            Err(e) if e.is_out_of_memory() => {
                refused += 1;
                // Give back half so the others make progress
                for p in held.drain(..held.len() / 2) {
                    if alloc.free(p).is_err() {
                        return 1;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, round, "allocation failed");
                return 1;
            }
        }
    }
    info!(pid = region.pid(), held = held.len(), refused, "worker done");

    ready.send();
    release.recv();
    for p in held {
        let _ = alloc.free(p);
    }
    region.remove_self();
    0
}
