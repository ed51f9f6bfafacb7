//! Per-CPU generators behind bulk reads of the system random device.
//!
//! Plain reads lock the current CPU's default slot with a spin lock and
//! never block while holding it. Reseeding reads take the sleeping mutex of
//! a reseed slot, flag its generator for reseed, and keep the mutex for the
//! whole read so nobody else draws from the same seed.
//!
//! Random bytes are staged in the slot's scratch page. Whatever part of the
//! page was written is zeroed before the slot's lock is released.

use std::sync::{Arc, PoisonError};

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::iter::Destination;
use crate::random::{ExtRng, RandomDevice};
use crate::registry::Registry;
use crate::sched::Scheduler;
use crate::slot::{DefaultSlot, LockedSlot, PerCpu, ReseedSlot, SlotState};

const LOG_TARGET: &str = "pcpurand::devrandom";

/// Which of the two slot tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Default,
    Reseed,
}

pub struct PerCpuRng {
    registry: Arc<Registry>,
    sched: Arc<dyn Scheduler>,
    algorithm: String,
    page_size: usize,
    default_rngs: PerCpu<DefaultSlot>,
    reseed_rngs: PerCpu<ReseedSlot>,
}

impl PerCpuRng {
    /// Allocates both tables and every scratch page up front.
    pub fn new(
        registry: Arc<Registry>,
        sched: Arc<dyn Scheduler>,
        algorithm: &str,
        page_size: usize,
    ) -> Self {
        let cpus = sched.possible_cpus();
        Self {
            registry,
            algorithm: algorithm.into(),
            page_size,
            default_rngs: PerCpu::new(cpus, |_| DefaultSlot::new(page_size)),
            reseed_rngs: PerCpu::new(cpus, |_| ReseedSlot::new(page_size)),
            sched,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cpus(&self) -> usize {
        self.default_rngs.len()
    }

    #[cfg(test)]
    pub fn slot_state(&self, table: Table, cpu: usize) -> SlotState {
        match table {
            Table::Default => self.default_rngs.get(cpu).state(),
            Table::Reseed => self.reseed_rngs.get(cpu).state(),
        }
    }

    /// Number of slots in `table` that have a generator.
    pub fn populated(&self, table: Table) -> usize {
        match table {
            Table::Default => self
                .default_rngs
                .iter()
                .filter(|s| s.state() == SlotState::Ready)
                .count(),
            Table::Reseed => self
                .reseed_rngs
                .iter()
                .filter(|s| s.state() == SlotState::Ready)
                .count(),
        }
    }

    /// Lock the current CPU's default slot, allocating its generator first
    /// if it has none.
    ///
    /// Allocation can block, so it cannot happen under the spin lock. The
    /// spin lock is dropped, the slot's allocation mutex taken instead, and
    /// the whole thing retried from the top: by then the task may be running
    /// on another CPU and must lock that CPU's slot instead.
    ///
    /// Reseed material is drawn here too, before the spin lock, for the
    /// same reason.
    fn lock_default_rng(&self) -> Result<LockedSlot<'_>, Error> {
        loop {
            let cpu = self.sched.current_cpu();
            let slot = self.default_rngs.get(cpu);
            if let Some(rng) = slot.rng.get() {
                if rng.wants_entropy() {
                    if let Err(e) = rng.prefetch_entropy() {
                        // The generator keeps going on its current key.
                        log::debug!(target: LOG_TARGET, "cpu {}: prefetch failed: {}", cpu, e);
                    }
                }
            }
            let page = slot.local.lock();
            if let Some(rng) = slot.rng.get() {
                return Ok(LockedSlot::fast(page, rng, cpu));
            }
            drop(page);

            // No longer pinned to `cpu` from here on.
            let _alloc = slot
                .alloc_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.rng.get().is_none() {
                // A failure here is returned even if other CPUs' slots are
                // ready, so a broken registry cannot make this loop forever.
                let rng = self.registry.get_rng(&self.algorithm)?;
                log::debug!(
                    target: LOG_TARGET,
                    "cpu {}: allocated default {} ({}) #{}",
                    cpu, rng.name(), rng.driver_name(), rng.id(),
                );
                if let Err(rng) = slot.rng.set(rng) {
                    self.registry.free(rng);
                }
            }
        }
    }

    /// Lock the reseed slot of whatever CPU the task is on now. The task may
    /// migrate while holding it; the mutex alone keeps the slot exclusive.
    fn lock_reseed_rng(&self) -> Result<LockedSlot<'_>, Error> {
        let cpu = self.sched.current_cpu();
        let slot = self.reseed_rngs.get(cpu);
        let page = slot.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let rng = match slot.rng.get() {
            Some(rng) => {
                // Fresh instances are seeded by get_rng(); only reused ones
                // need the explicit request.
                rng.request_reseed();
                rng
            }
            None => {
                let rng = self.registry.get_rng(&self.algorithm)?;
                log::debug!(
                    target: LOG_TARGET,
                    "cpu {}: allocated reseed {} ({}) #{}",
                    cpu, rng.name(), rng.driver_name(), rng.id(),
                );
                slot.rng.get_or_init(|| rng)
            }
        };

        Ok(LockedSlot::exclusive(page, rng, cpu))
    }

    fn lock_rng(&self, reseed: bool) -> Result<LockedSlot<'_>, Error> {
        if reseed {
            self.lock_reseed_rng()
        } else {
            self.lock_default_rng()
        }
    }

    /// Fill `dest` with random bytes.
    ///
    /// Returns how many bytes were delivered. A short count means a pending
    /// signal, a destination fault or a generator failure cut the read
    /// short; an error is returned only when nothing was delivered.
    pub fn read(&self, dest: &mut Destination<'_>, reseed: bool) -> Result<usize, Error> {
        // Under the spin lock nothing may block, rescheduling included.
        let atomic = !reseed;
        let user_no_reseed = !reseed && dest.is_user_backed();
        let page_size = self.page_size;
        let mut delivered = 0usize;
        let mut failure: Option<Error> = None;

        if dest.count() == 0 {
            return Ok(0);
        }

        'restart: loop {
            // Fault the destination page in before taking the generator, so
            // a slow page-in never holds up other readers of this slot.
            let mut upage = None;
            if user_no_reseed {
                match dest.pin_cursor(true) {
                    Some(page) => upage = Some(page),
                    None => break 'restart,
                }
            }

            let mut slot = match self.lock_rng(reseed) {
                Ok(slot) => slot,
                Err(e) => {
                    log::debug!(target: LOG_TARGET, "lock failed: {}", e);
                    if let Some(page) = upage {
                        dest.unpin(page);
                    }
                    failure = Some(e);
                    break 'restart;
                }
            };
            let mut page_dirty = 0usize;

            loop {
                // One page at a time, and never across a user page boundary,
                // so only one user page needs to be pinned.
                let mut len = dest.count().min(page_size);
                if user_no_reseed {
                    if let Some((uaddr, ulen)) = dest.user_cursor() {
                        len = len.min(page_size - uaddr % page_size).min(ulen);
                    }
                }

                page_dirty = page_dirty.max(len);
                let chunk = match slot.generate(len) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!(
                            target: LOG_TARGET,
                            "cpu {}: {} failed: {}",
                            slot.cpu(), slot.rng().driver_name(), e,
                        );
                        failure = Some(e);
                        break;
                    }
                };

                if user_no_reseed {
                    if dest.copy_nofault(chunk).is_err() {
                        break;
                    }
                    delivered += len;
                } else {
                    let copied = dest.copy_from(chunk);
                    delivered += copied;
                    if copied != len {
                        break;
                    }
                }

                if dest.count() == 0 || self.sched.signal_pending() {
                    break;
                }

                if let Some(page) = upage.take() {
                    dest.unpin(page);
                }

                let mut resched_without_lock = false;
                if self.sched.need_resched() {
                    if atomic {
                        resched_without_lock = true;
                    } else {
                        self.sched.cond_resched();
                    }
                }

                // Cheap attempt at the next user page; keeps the lock and the
                // scratch page across iterations when it works.
                if user_no_reseed && !resched_without_lock {
                    if let Some(page) = dest.pin_cursor(false) {
                        upage = Some(page);
                        continue;
                    }
                }

                if resched_without_lock || user_no_reseed {
                    // Restarting may land on another CPU's slot; nothing of
                    // ours may stay behind in this one.
                    slot.release(page_dirty);
                    if resched_without_lock {
                        self.sched.cond_resched();
                    }
                    continue 'restart;
                }
            }

            slot.release(page_dirty);
            if let Some(page) = upage {
                dest.unpin(page);
            }
            break;
        }

        if delivered > 0 {
            return Ok(delivered);
        }
        match failure {
            // Generator trouble is reported to the reader as a bad transfer.
            Some(Error::GenerateFailed(_)) | None => Err(Error::Fault),
            Some(e) => Err(e),
        }
    }

    #[cfg(test)]
    fn with_scratch<R>(&self, table: Table, cpu: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        match table {
            Table::Default => f(self.default_rngs.get(cpu).local.lock().as_slice()),
            Table::Reseed => f(self
                .reseed_rngs
                .get(cpu)
                .lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_slice()),
        }
    }

    #[cfg(test)]
    fn handle_id(&self, table: Table, cpu: usize) -> Option<u64> {
        match table {
            Table::Default => self.default_rngs.get(cpu).rng.get().map(|r| r.id()),
            Table::Reseed => self.reseed_rngs.get(cpu).rng.get().map(|r| r.id()),
        }
    }
}

impl ExtRng for PerCpuRng {
    fn read_iter(&self, dest: &mut Destination<'_>, reseed: bool) -> Result<usize, Error> {
        self.read(dest, reseed)
    }
}

/// Bring up the per-CPU generators when the system runs in FIPS mode.
///
/// Outside FIPS mode nothing is allocated and reads keep going to the
/// operating system. In FIPS mode this never fails: booting without the
/// mandated generator in place must not happen quietly.
pub fn init(
    cfg: &ServiceConfig,
    registry: Arc<Registry>,
    sched: Arc<dyn Scheduler>,
    device: &RandomDevice,
) -> Option<Arc<PerCpuRng>> {
    if !registry.fips() {
        log::info!(target: LOG_TARGET, "fips mode disabled; per-cpu generators not installed");
        return None;
    }

    let rng = Arc::new(PerCpuRng::new(registry, sched, &cfg.algorithm, cfg.page_size()));
    log::info!(
        target: LOG_TARGET,
        "installed per-cpu {} for {} cpus ({}B scratch pages)",
        cfg.algorithm, rng.cpus(), rng.page_size(),
    );
    if let Err(e) = device.register_extrng(rng.clone()) {
        log::warn!(target: LOG_TARGET, "{}", e);
    }
    Some(rng)
}
