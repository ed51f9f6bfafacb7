use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use zeroize::Zeroize;

use crate::drbg::{RngAlgorithm, RngHandle, STDRNG};
use crate::entropy::EntropySource;
use crate::error::Error;

const LOG_TARGET: &str = "pcpurand::registry";

/// Driver-name prefix reserved for the DRBG family.
const DRBG_PREFIX: &str = "drbg_";

const HEALTH_BLOCK: usize = 32;

pub type Factory = Arc<dyn Fn() -> Result<Box<dyn RngAlgorithm>, Error> + Send + Sync>;

/// A registered random-number algorithm.
#[derive(Clone)]
pub struct RngAlg {
    pub name: String,
    pub driver_name: String,
    pub priority: u32,
    pub seed_size: usize,
    pub(crate) factory: Factory,
}

impl RngAlg {
    pub fn new<F>(name: &str, driver_name: &str, priority: u32, seed_size: usize, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn RngAlgorithm>, Error> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            driver_name: driver_name.into(),
            priority,
            seed_size,
            factory: Arc::new(factory),
        }
    }
}

#[derive(Default)]
struct SharedRng {
    rng: Option<Arc<RngHandle>>,
    refcnt: usize,
}

/// Name → algorithm lookup, instance construction and seeding.
pub struct Registry {
    algs: RwLock<Vec<RngAlg>>,
    fips: bool,
    drbg_registered: AtomicBool,
    page_size: usize,
    entropy: Arc<dyn EntropySource>,
    next_id: AtomicU64,
    shared: Mutex<SharedRng>,
}

impl Registry {
    pub fn new(fips: bool, page_size: usize, entropy: Arc<dyn EntropySource>) -> Self {
        Self {
            algs: RwLock::new(Vec::new()),
            fips,
            drbg_registered: AtomicBool::new(false),
            page_size,
            entropy,
            next_id: AtomicU64::new(1),
            shared: Mutex::new(SharedRng::default()),
        }
    }

    pub fn fips(&self) -> bool {
        self.fips
    }

    pub fn register(&self, alg: RngAlg) -> Result<(), Error> {
        if alg.seed_size > self.page_size / 8 {
            return Err(Error::Rejected(format!(
                "{}: seed size {} exceeds {}",
                alg.driver_name,
                alg.seed_size,
                self.page_size / 8
            )));
        }

        // In FIPS mode only the first DRBG may provide stdrng, so a later
        // module cannot shadow it.
        if self.fips
            && alg.name == STDRNG
            && (self.drbg_registered.load(Ordering::Acquire)
                || !alg.driver_name.starts_with(DRBG_PREFIX))
        {
            return Err(Error::Rejected(format!(
                "{}: stdrng must be provided by the DRBG in FIPS mode",
                alg.driver_name
            )));
        }

        let mut algs = self.algs.write().unwrap_or_else(PoisonError::into_inner);
        if algs.iter().any(|a| a.driver_name == alg.driver_name) {
            return Err(Error::Rejected(format!(
                "{}: already registered",
                alg.driver_name
            )));
        }
        log::debug!(
            target: LOG_TARGET,
            "registered {} ({}, priority {})",
            alg.driver_name, alg.name, alg.priority,
        );
        algs.push(alg);
        Ok(())
    }

    /// Register a batch, rolling back everything on the first failure.
    pub fn register_all(&self, algs: Vec<RngAlg>) -> Result<(), Error> {
        let batch_is_stdrng = algs.first().is_some_and(|a| a.name == STDRNG);
        let mut done: Vec<String> = Vec::with_capacity(algs.len());

        for alg in algs {
            let driver = alg.driver_name.clone();
            if let Err(e) = self.register(alg) {
                for d in done.iter().rev() {
                    self.unregister(d);
                }
                return Err(e);
            }
            done.push(driver);
        }

        if self.fips && batch_is_stdrng {
            self.drbg_registered.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn unregister(&self, driver_name: &str) -> bool {
        let mut algs = self.algs.write().unwrap_or_else(PoisonError::into_inner);
        let before = algs.len();
        algs.retain(|a| a.driver_name != driver_name);
        algs.len() != before
    }

    /// Highest-priority algorithm whose name or driver name matches.
    fn lookup(&self, name: &str) -> Option<RngAlg> {
        let algs = self.algs.read().unwrap_or_else(PoisonError::into_inner);
        algs.iter()
            .filter(|a| a.name == name || a.driver_name == name)
            .max_by_key(|a| a.priority)
            .cloned()
    }

    pub fn allocate_by_name(&self, name: &str) -> Result<RngHandle, Error> {
        let alg = self
            .lookup(name)
            .ok_or_else(|| Error::AllocationFailed(format!("no algorithm named {}", name)))?;
        let state = (alg.factory)()
            .map_err(|e| Error::AllocationFailed(format!("{}: {}", alg.driver_name, e)))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(RngHandle::new(id, &alg, state, self.entropy.clone()))
    }

    /// Seed `handle` with `seed`, or with `len` bytes from the entropy pool when `seed` is `None`.
    pub fn seed(&self, handle: &RngHandle, seed: Option<&[u8]>, len: usize) -> Result<(), Error> {
        match seed {
            Some(bytes) => handle.seed(bytes),
            None => {
                let mut buf = vec![0u8; len];
                let res = self
                    .entropy
                    .fill(&mut buf)
                    .map_err(|e| Error::SeedFailed(e.to_string()))
                    .and_then(|()| handle.seed(&buf));
                buf.zeroize();
                res
            }
        }
    }

    pub fn free(&self, handle: RngHandle) {
        log::trace!(target: LOG_TARGET, "freeing {} #{}", handle.driver_name(), handle.id());
        drop(handle);
    }

    /// Allocate and fully seed a fresh instance of `name`.
    pub fn get_rng(&self, name: &str) -> Result<RngHandle, Error> {
        let rng = self.allocate_by_name(name)?;
        let len = rng.seed_size();
        if let Err(e) = self.seed(&rng, None, len) {
            self.free(rng);
            return Err(e);
        }
        Ok(rng)
    }

    /// Take a reference on the process-wide shared generator, creating it on first use.
    pub fn get_default_rng(&self, name: &str) -> Result<Arc<RngHandle>, Error> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let rng = match &shared.rng {
            Some(rng) => rng.clone(),
            None => {
                let rng = Arc::new(self.get_rng(name)?);
                shared.rng = Some(rng.clone());
                rng
            }
        };
        shared.refcnt += 1;
        Ok(rng)
    }

    pub fn put_default_rng(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.refcnt = shared.refcnt.saturating_sub(1);
    }

    /// Drop the shared generator if nobody holds a reference.
    pub fn del_default_rng(&self) -> Result<(), Error> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.refcnt != 0 {
            return Err(Error::Busy);
        }
        shared.rng = None;
        Ok(())
    }

    /// Power-on check of `name` through the shared generator: two blocks
    /// drawn back to back must differ. The shared instance is released
    /// again afterwards.
    pub fn health_check(&self, name: &str) -> Result<(), Error> {
        let rng = self.get_default_rng(name)?;
        let mut first = [0u8; HEALTH_BLOCK];
        let mut second = [0u8; HEALTH_BLOCK];
        let res = rng.generate(&mut first).and_then(|()| rng.generate(&mut second));
        let stuck = first == second;
        first.zeroize();
        second.zeroize();
        drop(rng);
        self.put_default_rng();

        res?;
        if stuck {
            return Err(Error::GenerateFailed(format!("{}: repeated output block", name)));
        }
        if let Err(e) = self.del_default_rng() {
            log::warn!(target: LOG_TARGET, "shared generator still referenced: {}", e);
        }
        log::debug!(target: LOG_TARGET, "{} passed the continuous output test", name);
        Ok(())
    }
}
