//! Per-CPU generator slots.
//!
//! Two tables exist, one for plain reads and one for reseeding reads. Each
//! possible CPU owns one slot in each table. A slot's generator goes from
//! absent to present exactly once and is never removed, so its presence can
//! be checked without holding any lock.

use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

use zeroize::Zeroize;

use crate::drbg::RngHandle;
use crate::error::Error;

#[repr(align(64))]
struct CacheAligned<T>(T);

/// Fixed-size arena with one entry per possible CPU.
pub struct PerCpu<T> {
    slots: Box<[CacheAligned<T>]>,
}

impl<T> PerCpu<T> {
    pub fn new(cpus: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..cpus).map(|cpu| CacheAligned(init(cpu))).collect(),
        }
    }

    /// `cpu` must be below the count the table was built with.
    pub fn get(&self, cpu: usize) -> &T {
        &self.slots[cpu].0
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &s.0)
    }
}

/// Staging buffer for generated bytes, one page long.
pub struct ScratchPage {
    bytes: Box<[u8]>,
}

impl ScratchPage {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Zero the first `dirty` bytes.
    pub fn clear(&mut self, dirty: usize) {
        let n = dirty.min(self.len());
        self.bytes[..n].zeroize();
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Allocating,
    Ready,
}

/// Slot of the default table. The spin lock guards the scratch page and is
/// the only lock taken on the fast path; `alloc_lock` serializes first-time
/// allocation, which may block.
pub struct DefaultSlot {
    pub(crate) local: spin::Mutex<ScratchPage>,
    pub(crate) alloc_lock: Mutex<()>,
    pub(crate) rng: OnceLock<RngHandle>,
}

impl DefaultSlot {
    pub fn new(page_size: usize) -> Self {
        Self {
            local: spin::Mutex::new(ScratchPage::new(page_size)),
            alloc_lock: Mutex::new(()),
            rng: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SlotState {
        if self.rng.get().is_some() {
            return SlotState::Ready;
        }
        match self.alloc_lock.try_lock() {
            Err(TryLockError::WouldBlock) => SlotState::Allocating,
            _ => SlotState::Empty,
        }
    }
}

/// Slot of the reseed table. Everything, allocation included, happens under
/// the one sleeping lock, which is held for a whole read.
pub struct ReseedSlot {
    pub(crate) lock: Mutex<ScratchPage>,
    pub(crate) rng: OnceLock<RngHandle>,
}

impl ReseedSlot {
    pub fn new(page_size: usize) -> Self {
        Self {
            lock: Mutex::new(ScratchPage::new(page_size)),
            rng: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SlotState {
        if self.rng.get().is_some() {
            return SlotState::Ready;
        }
        match self.lock.try_lock() {
            Err(TryLockError::WouldBlock) => SlotState::Allocating,
            _ => SlotState::Empty,
        }
    }
}

/// Which lock a `LockedSlot` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Non-sleeping per-CPU lock; nothing that blocks may run under it.
    Fast,
    /// Sleeping mutex; the holder may block and migrate.
    Exclusive,
}

enum SlotGuard<'a> {
    Fast(spin::MutexGuard<'a, ScratchPage>),
    Exclusive(MutexGuard<'a, ScratchPage>),
}

/// A slot whose lock is held, together with its generator.
///
/// Dropped without `release` (an unwinding generate, say), the whole page is
/// cleared before the lock goes.
pub struct LockedSlot<'a> {
    guard: SlotGuard<'a>,
    rng: &'a RngHandle,
    cpu: usize,
    released: bool,
}

impl<'a> LockedSlot<'a> {
    pub(crate) fn fast(
        guard: spin::MutexGuard<'a, ScratchPage>,
        rng: &'a RngHandle,
        cpu: usize,
    ) -> Self {
        Self {
            guard: SlotGuard::Fast(guard),
            rng,
            cpu,
            released: false,
        }
    }

    pub(crate) fn exclusive(
        guard: MutexGuard<'a, ScratchPage>,
        rng: &'a RngHandle,
        cpu: usize,
    ) -> Self {
        Self {
            guard: SlotGuard::Exclusive(guard),
            rng,
            cpu,
            released: false,
        }
    }

    pub fn mode(&self) -> LockMode {
        match self.guard {
            SlotGuard::Fast(_) => LockMode::Fast,
            SlotGuard::Exclusive(_) => LockMode::Exclusive,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn rng(&self) -> &'a RngHandle {
        self.rng
    }

    pub fn page(&mut self) -> &mut ScratchPage {
        match &mut self.guard {
            SlotGuard::Fast(g) => &mut **g,
            SlotGuard::Exclusive(g) => &mut **g,
        }
    }

    /// Fill the first `len` scratch bytes from the generator. Under the
    /// spin lock the generator must not touch the entropy source.
    pub fn generate(&mut self, len: usize) -> Result<&[u8], Error> {
        let rng = self.rng;
        let mode = self.mode();
        let buf = &mut self.page().as_mut_slice()[..len];
        match mode {
            LockMode::Fast => rng.generate_atomic(buf)?,
            LockMode::Exclusive => rng.generate(buf)?,
        }
        Ok(&*buf)
    }

    /// Zero `dirty` scratch bytes, then drop whichever lock is held.
    pub fn release(mut self, dirty: usize) {
        self.page().clear(dirty);
        self.released = true;
    }
}

impl Drop for LockedSlot<'_> {
    fn drop(&mut self) {
        if !self.released {
            let page = self.page();
            let len = page.len();
            page.clear(len);
        }
    }
}
