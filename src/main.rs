mod bench;
mod cli;
mod config;
mod devrandom;
mod drbg;
mod entropy;
mod error;
mod iter;
mod logging;
mod output;
mod random;
mod registry;
mod sched;
mod slot;
#[cfg(test)]
mod testutil;
mod uaccess;

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use zeroize::Zeroize;

use cli::{Cli, Command, ServiceArgs};
use config::Config;
use devrandom::PerCpuRng;
use error::Error;
use iter::{Destination, UserSeg};
use output::Sink;
use random::{RandomDevice, RANDOM};
use registry::Registry;
use sched::OsScheduler;
use uaccess::PagedBuffer;

const BLOCK_SIZE: usize = 64 * 1024;

/// Where `--paged` reads land; any page-aligned address works.
const PAGED_BASE: usize = 0x7f00_0000_0000;

/// Build the configuration by layering: defaults → TOML file → CLI overrides.
fn build_config(config_file: Option<&Path>, service_args: &ServiceArgs) -> Config {
    let mut cfg = match config::load_config(config_file) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("{}", e);
            Config::default()
        }
    };
    service_args.apply(&mut cfg.service);
    cfg.validate();
    cfg
}

/// Register the built-in DRBG and, in FIPS mode, route the random device
/// through per-CPU instances of it.
fn setup(cfg: &Config) -> Result<Option<Arc<PerCpuRng>>, Error> {
    let fips = cfg.service.fips_enabled();
    let page_size = cfg.service.page_size();
    let cpus = cfg.service.possible_cpus();

    let registry = Registry::new(fips, page_size, Arc::new(entropy::SystemPool));
    registry.register_all(vec![drbg::chacha_alg(&cfg.drbg)])?;
    if fips {
        registry.health_check(&cfg.service.algorithm)?;
    }

    let sched = Arc::new(OsScheduler::new(
        cpus,
        Duration::from_micros(cfg.service.resched_quantum_us),
    ));
    log::debug!("fips={} cpus={} page_size={}", fips, cpus, page_size);

    Ok(devrandom::init(
        &cfg.service,
        Arc::new(registry),
        sched,
        &RANDOM,
    ))
}

/// Read until `block` is full, a signal arrives, or a read fails.
/// Returns how much of `block` holds fresh bytes; a failing read is an
/// error only if nothing was read before it.
fn fill_block(
    device: &RandomDevice,
    block: &mut [u8],
    paged: Option<&mut PagedBuffer>,
    reseed: bool,
) -> Result<usize, Error> {
    let mut done = 0;
    let res = match paged {
        Some(space) => {
            space.evict();
            let want = block.len().min(space.len());
            let mut res = Ok(());
            while done < want && !sched::interrupted() {
                let seg = UserSeg {
                    addr: space.base() + done,
                    len: want - done,
                };
                match device.read(&mut Destination::user(&mut *space, vec![seg]), reseed) {
                    Ok(0) => break,
                    Ok(n) => done += n,
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            }
            block[..done].copy_from_slice(space.read(space.base(), done));
            space.scrub();
            res
        }
        None => {
            let mut res = Ok(());
            while done < block.len() && !sched::interrupted() {
                match device.read(&mut Destination::kernel(&mut block[done..]), reseed) {
                    Ok(0) => break,
                    Ok(n) => done += n,
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            }
            res
        }
    };

    match res {
        Err(e) if done == 0 => Err(e),
        Err(e) => {
            log::warn!("read stopped after {} bytes: {}", done, e);
            Ok(done)
        }
        Ok(()) => Ok(done),
    }
}

fn run_read(cli: &Cli, page_size: usize) -> Result<(), Error> {
    if cli.bytes == 0 {
        return Err(Error::InvalidArgs("byte count must be greater than 0".into()));
    }

    let mut sink = Sink::open(cli.format, cli.output_file.as_deref())?;
    let mut block = vec![0u8; BLOCK_SIZE.min(cli.bytes)];
    let mut paged = cli
        .paged
        .then(|| PagedBuffer::new(PAGED_BASE, block.len(), page_size));
    let mut remaining = cli.bytes;

    while remaining > 0 {
        let want = remaining.min(block.len());
        let got = fill_block(&RANDOM, &mut block[..want], paged.as_mut(), cli.reseed)?;
        sink.write_block(&block[..got])?;
        remaining -= got;
        if got < want {
            log::warn!("interrupted with {} bytes still to read", remaining);
            break;
        }
    }

    block.zeroize();
    sink.finish()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Bench(args)) => {
            logging::init(&args.log, true);
            sched::install_signal_handlers();
            let cfg = build_config(args.config_file.as_deref(), &args.service);
            let result = setup(&cfg).and_then(|rng| {
                let params = bench::BenchParams {
                    threads: args
                        .threads
                        .unwrap_or_else(|| cfg.service.possible_cpus()),
                    duration: Duration::from_secs(args.duration),
                    read_size: args.read_size,
                    reseed: args.reseed,
                };
                bench::run(&RANDOM, rng.as_deref(), params)
            });
            if let Err(e) = result {
                log::error!("{}", e);
                process::exit(1);
            }
        }
        None => {
            logging::init(&cli.log, false);
            sched::install_signal_handlers();
            let cfg = build_config(cli.config_file.as_deref(), &cli.service);
            let result = setup(&cfg).and_then(|_| run_read(&cli, cfg.service.page_size()));
            if let Err(e) = result {
                log::error!("{}", e);
                process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use random::ExtRng;

    /// Hands out 0xAB bytes, `per_call` at a time, for `calls` calls, then fails.
    struct FlakyRng {
        calls: AtomicUsize,
        limit: usize,
        per_call: usize,
    }

    impl FlakyRng {
        fn new(limit: usize, per_call: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                limit,
                per_call,
            })
        }
    }

    impl ExtRng for FlakyRng {
        fn read_iter(&self, dest: &mut Destination<'_>, _reseed: bool) -> Result<usize, Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(Error::Fault);
            }
            let n = dest.count().min(self.per_call);
            Ok(dest.copy_from(&vec![0xAB; n]))
        }
    }

    #[test]
    fn test_kernel_fill_keeps_progress_before_failure() {
        static DEVICE: RandomDevice = RandomDevice::new();
        DEVICE.register_extrng(FlakyRng::new(2, 10)).unwrap();

        let mut block = [0u8; 64];
        assert_eq!(fill_block(&DEVICE, &mut block, None, false).unwrap(), 20);
        assert_eq!(&block[..20], &[0xAB; 20]);
        assert!(matches!(
            fill_block(&DEVICE, &mut block, None, false),
            Err(Error::Fault)
        ));
    }

    #[test]
    fn test_paged_fill_keeps_progress_and_scrubs_buffer() {
        static DEVICE: RandomDevice = RandomDevice::new();
        DEVICE.register_extrng(FlakyRng::new(3, 16)).unwrap();

        let mut block = [0u8; 100];
        let mut space = PagedBuffer::new(PAGED_BASE, block.len(), 64);
        let got = fill_block(&DEVICE, &mut block, Some(&mut space), false).unwrap();
        assert_eq!(got, 48);
        assert_eq!(&block[..48], &[0xAB; 48][..]);
        assert!(space.read(space.base(), space.len()).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_paged_fill_through_per_cpu_rng() {
        static DEVICE: RandomDevice = RandomDevice::new();
        let counters = testutil::StubCounters::new();
        let rng = Arc::new(PerCpuRng::new(
            testutil::counter_registry(&counters, 64),
            testutil::StubScheduler::new(1),
            "stdrng",
            64,
        ));
        DEVICE.register_extrng(rng).unwrap();

        let mut block = [0u8; 150];
        let mut space = PagedBuffer::new(PAGED_BASE, block.len(), 64);
        assert_eq!(fill_block(&DEVICE, &mut block, Some(&mut space), false).unwrap(), 150);
        assert_eq!(&block[..], &testutil::counter_stream(0, 150)[..]);
        assert!(space.read(space.base(), space.len()).iter().all(|&b| b == 0));
    }
}
