//! Deterministic stand-ins for the generator, entropy pool and scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::drbg::{RngAlgorithm, STDRNG};
use crate::entropy::EntropySource;
use crate::error::Error;
use crate::registry::{Registry, RngAlg};
use crate::sched::Scheduler;

pub const STUB_DRIVER: &str = "drbg_stub_counter";

#[derive(Default)]
pub struct StubCounters {
    allocs: AtomicUsize,
    seeds: AtomicUsize,
    reseeds: AtomicUsize,
    generates: AtomicUsize,
    fail_after: AtomicUsize,
    alloc_delay_ms: AtomicU64,
    fail_alloc: AtomicBool,
}

impl StubCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_after: AtomicUsize::new(usize::MAX),
            ..Default::default()
        })
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn seeds(&self) -> usize {
        self.seeds.load(Ordering::SeqCst)
    }

    pub fn reseeds(&self) -> usize {
        self.reseeds.load(Ordering::SeqCst)
    }

    pub fn generates(&self) -> usize {
        self.generates.load(Ordering::SeqCst)
    }

    /// Generate calls numbered `n` and later fail.
    pub fn fail_generate_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn set_alloc_delay(&self, delay: Duration) {
        self.alloc_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }
}

/// Emits consecutive byte values starting at the first seed byte.
pub struct CounterRng {
    next: u8,
    counters: Arc<StubCounters>,
}

impl RngAlgorithm for CounterRng {
    fn seed(&mut self, seed: &[u8]) -> Result<(), Error> {
        self.next = seed.first().copied().unwrap_or(0);
        self.counters.seeds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reseed(&mut self, _entropy: &[u8]) -> Result<(), Error> {
        self.counters.reseeds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generate(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let n = self.counters.generates.fetch_add(1, Ordering::SeqCst);
        if n >= self.counters.fail_after.load(Ordering::SeqCst) {
            return Err(Error::GenerateFailed("stub failure".into()));
        }
        for b in dst.iter_mut() {
            *b = self.next;
            self.next = self.next.wrapping_add(1);
        }
        Ok(())
    }
}

pub fn counter_alg(counters: Arc<StubCounters>) -> RngAlg {
    RngAlg::new(STDRNG, STUB_DRIVER, 100, 8, move || {
        counters.allocs.fetch_add(1, Ordering::SeqCst);
        let delay = counters.alloc_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if counters.fail_alloc.load(Ordering::SeqCst) {
            return Err(Error::NoEntropy("stub allocation failure".into()));
        }
        Ok(Box::new(CounterRng {
            next: 0,
            counters: counters.clone(),
        }) as Box<dyn RngAlgorithm>)
    })
}

pub fn counter_registry(counters: &Arc<StubCounters>, page_size: usize) -> Arc<Registry> {
    let registry = Registry::new(true, page_size, Arc::new(ZeroEntropy));
    registry
        .register_all(vec![counter_alg(counters.clone())])
        .unwrap();
    Arc::new(registry)
}

/// Expected output of a `CounterRng` seeded with zero.
pub fn counter_stream(start: usize, len: usize) -> Vec<u8> {
    (start..start + len).map(|i| i as u8).collect()
}

pub struct ZeroEntropy;

impl EntropySource for ZeroEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(0);
        Ok(())
    }
}

/// Zero bytes, counting how often it was asked.
#[derive(Default)]
pub struct CountingEntropy {
    fills: AtomicUsize,
}

impl CountingEntropy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fills(&self) -> usize {
        self.fills.load(Ordering::SeqCst)
    }
}

impl EntropySource for CountingEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        self.fills.fetch_add(1, Ordering::SeqCst);
        buf.fill(0);
        Ok(())
    }
}

pub struct FailingEntropy;

impl EntropySource for FailingEntropy {
    fn fill(&self, _buf: &mut [u8]) -> Result<(), Error> {
        Err(Error::NoEntropy("pool exhausted".into()))
    }
}

/// Scheduler whose CPU, resched and signal answers are set by the test.
pub struct StubScheduler {
    cpus: usize,
    cpu: AtomicUsize,
    resched: AtomicBool,
    migrate_on_resched: AtomicBool,
    signal: AtomicBool,
    resched_calls: AtomicUsize,
}

impl StubScheduler {
    pub fn new(cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            cpus,
            cpu: AtomicUsize::new(0),
            resched: AtomicBool::new(false),
            migrate_on_resched: AtomicBool::new(false),
            signal: AtomicBool::new(false),
            resched_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu % self.cpus, Ordering::SeqCst);
    }

    pub fn set_need_resched(&self, on: bool) {
        self.resched.store(on, Ordering::SeqCst);
    }

    /// Every reschedule moves the task to the next CPU.
    pub fn set_migrate_on_resched(&self, on: bool) {
        self.migrate_on_resched.store(on, Ordering::SeqCst);
    }

    pub fn set_signal(&self, on: bool) {
        self.signal.store(on, Ordering::SeqCst);
    }

    pub fn resched_calls(&self) -> usize {
        self.resched_calls.load(Ordering::SeqCst)
    }
}

impl Scheduler for StubScheduler {
    fn possible_cpus(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn need_resched(&self) -> bool {
        self.resched.load(Ordering::SeqCst)
    }

    fn cond_resched(&self) {
        self.resched_calls.fetch_add(1, Ordering::SeqCst);
        if self.migrate_on_resched.load(Ordering::SeqCst) {
            let next = (self.cpu.load(Ordering::SeqCst) + 1) % self.cpus;
            self.cpu.store(next, Ordering::SeqCst);
        }
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }
}
