use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use zeroize::{Zeroize, Zeroizing};

use crate::config::DrbgConfig;
use crate::entropy::{self, EntropySource};
use crate::error::Error;
use crate::registry::RngAlg;

pub const STDRNG: &str = "stdrng";
pub const CHACHA_DRIVER: &str = "drbg_nopr_chacha20";
const CHACHA_PRIORITY: u32 = 200;
const CHACHA_SEED_SIZE: usize = 32;

const SEED_DOMAIN: &[u8] = b"pcpurand-drbg-seed-v1";
const RESEED_DOMAIN: &[u8] = b"pcpurand-drbg-reseed-v1";

/// One instance of a deterministic random bit generator.
pub trait RngAlgorithm: Send {
    /// Replace the whole state with one derived from `seed`.
    fn seed(&mut self, seed: &[u8]) -> Result<(), Error>;

    /// Fold fresh entropy into the existing state.
    fn reseed(&mut self, entropy: &[u8]) -> Result<(), Error> {
        self.seed(entropy)
    }

    fn generate(&mut self, dst: &mut [u8]) -> Result<(), Error>;

    /// True once the instance has produced enough output that it wants new entropy.
    fn wants_reseed(&self) -> bool {
        false
    }
}

/// ChaCha20 keyed from a BLAKE2b digest of the seed material.
pub struct ChaChaDrbg {
    rng: Option<ChaCha20Rng>,
    requests: u64,
    max_requests: u64,
    max_request_bytes: usize,
}

impl ChaChaDrbg {
    pub fn new(cfg: &DrbgConfig) -> Self {
        Self {
            rng: None,
            requests: 0,
            max_requests: cfg.max_requests,
            max_request_bytes: cfg.max_request_bytes,
        }
    }

    fn rekey(&mut self, mut key: [u8; 32]) {
        self.rng = Some(ChaCha20Rng::from_seed(key));
        self.requests = 0;
        key.zeroize();
    }
}

impl RngAlgorithm for ChaChaDrbg {
    fn seed(&mut self, seed: &[u8]) -> Result<(), Error> {
        self.rekey(entropy::mix(SEED_DOMAIN, &[("seed", seed)]));
        Ok(())
    }

    fn reseed(&mut self, fresh: &[u8]) -> Result<(), Error> {
        let mut carry = [0u8; 32];
        match self.rng.as_mut() {
            Some(rng) => rng.fill_bytes(&mut carry),
            None => return self.seed(fresh),
        }
        let key = entropy::mix(RESEED_DOMAIN, &[("state", &carry[..]), ("entropy", fresh)]);
        carry.zeroize();
        self.rekey(key);
        Ok(())
    }

    /// Long requests are served in `max_request_bytes` slices, each of which
    /// counts as one request.
    fn generate(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let rng = self
            .rng
            .as_mut()
            .ok_or_else(|| Error::GenerateFailed("generator not seeded".into()))?;
        for slice in dst.chunks_mut(self.max_request_bytes.max(1)) {
            rng.fill_bytes(slice);
            self.requests += 1;
        }
        Ok(())
    }

    fn wants_reseed(&self) -> bool {
        self.requests >= self.max_requests
    }
}

/// Registry descriptor for the built-in `stdrng`.
pub fn chacha_alg(cfg: &DrbgConfig) -> RngAlg {
    let cfg = cfg.clone();
    RngAlg::new(
        STDRNG,
        CHACHA_DRIVER,
        CHACHA_PRIORITY,
        CHACHA_SEED_SIZE,
        move || Ok(Box::new(ChaChaDrbg::new(&cfg)) as Box<dyn RngAlgorithm>),
    )
}

/// A live generator instance handed out by the registry.
///
/// `generate` serializes on the handle's own lock. Callers that keep each
/// handle behind exactly one slot lock never contend on it.
///
/// Reseeding needs fresh entropy, and drawing it can block. Callers that
/// must not block use `generate_atomic`, which only reseeds from entropy
/// put aside earlier by `prefetch_entropy`.
pub struct RngHandle {
    id: u64,
    name: String,
    driver_name: String,
    seed_size: usize,
    state: Mutex<Box<dyn RngAlgorithm>>,
    need_reseed: AtomicBool,
    /// The algorithm asked for new entropy after its last generate.
    exhausted: AtomicBool,
    reserve: Mutex<Option<Zeroizing<Vec<u8>>>>,
    entropy: Arc<dyn EntropySource>,
}

impl RngHandle {
    pub(crate) fn new(
        id: u64,
        alg: &RngAlg,
        state: Box<dyn RngAlgorithm>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            id,
            name: alg.name.clone(),
            driver_name: alg.driver_name.clone(),
            seed_size: alg.seed_size,
            state: Mutex::new(state),
            need_reseed: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            reserve: Mutex::new(None),
            entropy,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn seed_size(&self) -> usize {
        self.seed_size
    }

    /// Saturating: any number of requests before the next `generate` yield one reseed.
    pub fn request_reseed(&self) {
        self.need_reseed.store(true, Ordering::Release);
    }

    pub fn needs_reseed(&self) -> bool {
        self.need_reseed.load(Ordering::Acquire)
    }

    /// The next generate will want to reseed.
    pub fn wants_entropy(&self) -> bool {
        self.needs_reseed() || self.exhausted.load(Ordering::Acquire)
    }

    /// Draw reseed material now, while blocking is allowed. A no-op if some
    /// is already put aside.
    pub fn prefetch_entropy(&self) -> Result<(), Error> {
        if self.lock_reserve().is_some() {
            return Ok(());
        }
        let fresh = self.draw_entropy()?;
        let mut reserve = self.lock_reserve();
        if reserve.is_none() {
            *reserve = Some(fresh);
        }
        Ok(())
    }

    pub fn seed(&self, seed: &[u8]) -> Result<(), Error> {
        let mut state = self.lock_state()?;
        state.seed(seed)?;
        self.need_reseed.store(false, Ordering::Release);
        self.exhausted.store(false, Ordering::Release);
        Ok(())
    }

    /// Generate, reseeding first if asked to. May block on the entropy source.
    pub fn generate(&self, dst: &mut [u8]) -> Result<(), Error> {
        self.generate_with(dst, true)
    }

    /// Generate without ever touching the entropy source. A reseed that is
    /// due but has no prefetched material is postponed, not skipped.
    pub fn generate_atomic(&self, dst: &mut [u8]) -> Result<(), Error> {
        self.generate_with(dst, false)
    }

    fn generate_with(&self, dst: &mut [u8], may_block: bool) -> Result<(), Error> {
        let mut state = self.lock_state()?;

        if self.wants_entropy() {
            let fresh = match self.take_reserve(may_block) {
                Some(fresh) => Some(fresh),
                None if may_block => Some(self.draw_entropy()?),
                None => None,
            };
            if let Some(fresh) = fresh {
                let requested = self.need_reseed.swap(false, Ordering::AcqRel);
                if let Err(e) = state.reseed(fresh.as_slice()) {
                    if requested {
                        self.need_reseed.store(true, Ordering::Release);
                    }
                    return Err(e);
                }
                self.exhausted.store(false, Ordering::Release);
            }
        }

        let res = state.generate(dst);
        self.exhausted.store(state.wants_reseed(), Ordering::Release);
        res
    }

    /// Without `may_block` a contended reserve is treated as empty.
    fn take_reserve(&self, may_block: bool) -> Option<Zeroizing<Vec<u8>>> {
        if may_block {
            return self.lock_reserve().take();
        }
        match self.reserve.try_lock() {
            Ok(mut reserve) => reserve.take(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().take(),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn draw_entropy(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        let mut fresh = Zeroizing::new(vec![0u8; self.seed_size]);
        self.entropy
            .fill(fresh.as_mut_slice())
            .map_err(|e| Error::SeedFailed(e.to_string()))?;
        Ok(fresh)
    }

    fn lock_reserve(&self) -> MutexGuard<'_, Option<Zeroizing<Vec<u8>>>> {
        self.reserve.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, Box<dyn RngAlgorithm>>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::GenerateFailed(format!("{} state poisoned", self.driver_name)))
    }
}

impl std::fmt::Debug for RngHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RngHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver_name", &self.driver_name)
            .field("need_reseed", &self.needs_reseed())
            .finish()
    }
}
