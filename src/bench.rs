//! Concurrent read throughput against the installed random device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crate::devrandom::{PerCpuRng, Table};
use crate::error::Error;
use crate::iter::Destination;
use crate::random::RandomDevice;
use crate::sched;

const LOG_TARGET: &str = "pcpurand::bench";

#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
    pub reads: u64,
    pub bytes: u64,
    pub short_reads: u64,
    pub errors: u64,
}

impl ReaderStats {
    fn merge(&mut self, other: &ReaderStats) {
        self.reads += other.reads;
        self.bytes += other.bytes;
        self.short_reads += other.short_reads;
        self.errors += other.errors;
    }
}

pub struct BenchParams {
    pub threads: usize,
    pub duration: Duration,
    pub read_size: usize,
    pub reseed: bool,
}

fn reader(
    device: &RandomDevice,
    params: &BenchParams,
    stop: &AtomicBool,
) -> ReaderStats {
    let mut stats = ReaderStats::default();
    let mut buf = vec![0u8; params.read_size];

    while !stop.load(Ordering::Relaxed) && !sched::interrupted() {
        stats.reads += 1;
        match device.read(&mut Destination::kernel(&mut buf), params.reseed) {
            Ok(n) => {
                stats.bytes += n as u64;
                if n < params.read_size {
                    stats.short_reads += 1;
                }
            }
            Err(e) => {
                log::debug!(target: LOG_TARGET, "read failed: {}", e);
                stats.errors += 1;
            }
        }
    }
    stats
}

/// Run `params.threads` readers until the duration elapses or the process
/// is interrupted, and return their combined counts.
pub fn run_readers(device: &'static RandomDevice, params: BenchParams) -> ReaderStats {
    let params = Arc::new(params);
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(params.threads + 1));

    let workers: Vec<_> = (0..params.threads)
        .map(|_| {
            let params = params.clone();
            let stop = stop.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                reader(device, &params, &stop)
            })
        })
        .collect();

    start.wait();
    let deadline = Instant::now() + params.duration;
    while Instant::now() < deadline && !sched::interrupted() {
        thread::sleep(Duration::from_millis(20).min(params.duration));
    }
    stop.store(true, Ordering::Relaxed);

    let mut total = ReaderStats::default();
    for w in workers {
        match w.join() {
            Ok(stats) => total.merge(&stats),
            Err(_) => total.errors += 1,
        }
    }
    total
}

pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bytes_per_sec / 1_000_000_000.0)
    } else if bytes_per_sec >= 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

pub fn run(
    device: &'static RandomDevice,
    rng: Option<&PerCpuRng>,
    params: BenchParams,
) -> Result<(), Error> {
    if params.threads == 0 || params.read_size == 0 {
        return Err(Error::InvalidArgs(
            "bench needs at least one thread and a non-empty read size".into(),
        ));
    }

    log::info!(
        target: LOG_TARGET,
        "{} readers x {} bytes for {:?} ({} reads, {})",
        params.threads,
        params.read_size,
        params.duration,
        if params.reseed { "reseeding" } else { "plain" },
        if device.has_extrng() { "per-cpu drbg" } else { "os device" },
    );

    let began = Instant::now();
    let stats = run_readers(device, params);
    let elapsed = began.elapsed().as_secs_f64().max(f64::EPSILON);

    log::info!(
        target: LOG_TARGET,
        "{} reads, {} bytes, {} ({} short, {} failed)",
        stats.reads,
        stats.bytes,
        format_throughput(stats.bytes as f64 / elapsed),
        stats.short_reads,
        stats.errors,
    );
    if let Some(rng) = rng {
        log::info!(
            target: LOG_TARGET,
            "slots populated: default {}/{}, reseed {}/{}",
            rng.populated(Table::Default),
            rng.cpus(),
            rng.populated(Table::Reseed),
            rng.cpus(),
        );
    }

    if stats.reads > 0 && stats.errors == stats.reads {
        return Err(Error::NoEntropy("every bench read failed".into()));
    }
    Ok(())
}
