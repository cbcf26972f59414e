use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmem::{pinning, AllocatorConfig, SegmentAllocator, SegmentIdentity, ShmemBackend};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmbox-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "100000")]
    count: usize,
    #[clap(short = 's', long = "size", default_value = "4096")]
    size: usize,
    // Segments kept alive at the same time.
    #[clap(long = "live", default_value = "16")]
    live: usize,
    #[clap(long = "lock-all")]
    lock_all: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    allocator: AllocatorConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    info!("{:?}", &cfg.allocator);

    // Registered before any segment exists so an interrupted run still
    // releases what it holds.
    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM].iter() {
        signal_hook::flag::register(*signal, Arc::clone(&closing))?;
    }

    if opts.lock_all && pinning::pin_all().is_err() {
        warn!("continuing without locked memory");
    }

    let allocator = SegmentAllocator::new(ShmemBackend::new(), cfg.allocator);
    let result = run(&allocator, &opts, &closing);

    if opts.lock_all {
        let _ = pinning::unpin_all();
    }
    result
}

fn run(
    allocator: &SegmentAllocator<ShmemBackend>,
    opts: &Opts,
    closing: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let live = opts.live.max(1);
    let mut held: Vec<SegmentIdentity> = Vec::with_capacity(live);
    let mut called = 0usize;
    let mut teardown_failures = 0usize;

    while called < opts.count && !closing.load(Ordering::Relaxed) {
        let identity = match allocator.allocate(opts.size) {
            Ok(v) => v,
            Err(e) => {
                release_all(allocator, &mut held);
                return Err(Box::new(e));
            }
        };
        // Touch every page so the mapping is really backed.
        unsafe { std::ptr::write_bytes(identity.attached_at().as_ptr(), (called % 251) as u8, identity.size()) };
        held.push(identity);
        if held.len() >= live {
            teardown_failures += release_all(allocator, &mut held);
        }
        called += 1;
        if called % 10_000 == 0 {
            info!("{} segments", called);
        }
    }
    teardown_failures += release_all(allocator, &mut held);

    let duration = start.elapsed();
    let ops = (called as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "segments: {}, size: {}, ops/s: {}, teardown failures: {}, time: {:#?}",
        called, opts.size, ops as u64, teardown_failures, duration
    );
    if closing.load(Ordering::Relaxed) {
        println!("Interrupted, all held segments were released.");
    }
    Ok(())
}

fn release_all(allocator: &SegmentAllocator<ShmemBackend>, held: &mut Vec<SegmentIdentity>) -> usize {
    held.drain(..)
        .map(|identity| allocator.release(identity))
        .filter(|result| result.is_err())
        .count()
}
