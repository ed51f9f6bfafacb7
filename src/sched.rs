use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// What the bulk reader needs to know about the task it runs on.
pub trait Scheduler: Send + Sync {
    fn possible_cpus(&self) -> usize;

    /// Logical CPU the calling task is on right now. Always `< possible_cpus()`.
    /// Stale as soon as the caller can be preempted.
    fn current_cpu(&self) -> usize;

    /// The calling task has used up its time slice.
    fn need_resched(&self) -> bool;

    fn cond_resched(&self);

    /// A signal that should cut a long read short is pending.
    fn signal_pending(&self) -> bool;
}

thread_local! {
    static SLICE_START: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Host scheduler: `sched_getcpu(3)`, a fixed time slice, and SIGINT/SIGTERM
/// as the pending signal.
pub struct OsScheduler {
    cpus: usize,
    quantum: Duration,
}

impl OsScheduler {
    pub fn new(cpus: usize, quantum: Duration) -> Self {
        Self {
            cpus: cpus.max(1),
            quantum,
        }
    }
}

impl Scheduler for OsScheduler {
    fn possible_cpus(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> usize {
        // SAFETY: sched_getcpu takes no arguments and only reads kernel state.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            0
        } else {
            cpu as usize % self.cpus
        }
    }

    fn need_resched(&self) -> bool {
        SLICE_START.with(|start| match start.get() {
            Some(t) => t.elapsed() >= self.quantum,
            None => {
                start.set(Some(Instant::now()));
                false
            }
        })
    }

    fn cond_resched(&self) {
        thread::yield_now();
        SLICE_START.with(|start| start.set(Some(Instant::now())));
    }

    fn signal_pending(&self) -> bool {
        interrupted()
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}
