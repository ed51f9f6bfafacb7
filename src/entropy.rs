use std::fs::File;
use std::io::Read;

use blake2::{
    digest::{consts::U32, Digest},
    Blake2b,
};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use zeroize::Zeroize;

use crate::error::Error;

type Blake2b256 = Blake2b<U32>;

const POOL_DOMAIN: &[u8] = b"pcpurand-pool-v1";
const JITTER_SAMPLES: usize = 64;

/// Where generators get seed material when the caller supplies none.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error>;
}

/// OS randomness and CPU timing jitter, mixed and expanded to any length.
#[derive(Debug, Default)]
pub struct SystemPool;

impl EntropySource for SystemPool {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut os_bytes = [0u8; 32];
        File::open("/dev/urandom")
            .and_then(|mut f| f.read_exact(&mut os_bytes))
            .map_err(|e| Error::NoEntropy(format!("/dev/urandom not available: {}", e)))?;

        let mut jitter = collect_jitter(JITTER_SAMPLES);
        let mut key = mix(POOL_DOMAIN, &[("urandom", &os_bytes[..]), ("jitter", &jitter[..])]);

        ChaCha20Rng::from_seed(key).fill_bytes(buf);

        os_bytes.zeroize();
        jitter.zeroize();
        key.zeroize();
        Ok(())
    }
}

/// Length-prefixed, domain-separated BLAKE2b-256 over labelled inputs.
pub fn mix(domain: &[u8], inputs: &[(&str, &[u8])]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(domain);

    for (label, data) in inputs {
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label.as_bytes());
        hasher.update((data.len() as u64).to_le_bytes());
        hasher.update(data);
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Monotonic clock samples separated by a data-dependent spin, so cache and
/// scheduler noise shows up in the low bits.
fn collect_jitter(count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count * 8);
    let mut prev = 0u64;

    for i in 0..count {
        let spins = 512 + (prev & 0x3FF) as usize;
        let mut x = (i as u64) ^ 0x9E37_79B9_7F4A_7C15;
        for _ in 0..spins {
            x = x.rotate_left(7).wrapping_mul(0x2545_F491_4F6C_DD1D);
        }
        std::hint::black_box(x);

        let now = monotonic_ns();
        out.extend_from_slice(&now.wrapping_sub(prev).to_le_bytes());
        prev = now;
    }

    out
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}
