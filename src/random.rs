use std::fs::File;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use zeroize::Zeroize;

use crate::error::Error;
use crate::iter::Destination;

const OS_CHUNK: usize = 512;

/// A replacement source for bulk reads of the system random device.
pub trait ExtRng: Send + Sync {
    fn read_iter(&self, dest: &mut Destination<'_>, reseed: bool) -> Result<usize, Error>;
}

/// The system random device. Bulk reads go to the installed override, or to
/// the operating system when none is installed.
pub struct RandomDevice {
    extrng: OnceLock<Arc<dyn ExtRng>>,
}

pub static RANDOM: RandomDevice = RandomDevice::new();

impl RandomDevice {
    pub const fn new() -> Self {
        Self {
            extrng: OnceLock::new(),
        }
    }

    /// Install the override. Only the first registration takes effect.
    pub fn register_extrng(&self, rng: Arc<dyn ExtRng>) -> Result<(), Error> {
        self.extrng
            .set(rng)
            .map_err(|_| Error::Rejected("an extended rng is already registered".into()))
    }

    pub fn has_extrng(&self) -> bool {
        self.extrng.get().is_some()
    }

    pub fn read(&self, dest: &mut Destination<'_>, reseed: bool) -> Result<usize, Error> {
        match self.extrng.get() {
            Some(rng) => rng.read_iter(dest, reseed),
            None => read_os(dest, reseed),
        }
    }
}

fn read_os(dest: &mut Destination<'_>, reseed: bool) -> Result<usize, Error> {
    if dest.count() == 0 {
        return Ok(0);
    }
    let path = if reseed { "/dev/random" } else { "/dev/urandom" };
    let mut f = File::open(path)?;
    let mut buf = [0u8; OS_CHUNK];
    let mut total = 0;
    let mut failure = None;

    while dest.count() > 0 {
        let n = dest.count().min(OS_CHUNK);
        if let Err(e) = f.read_exact(&mut buf[..n]) {
            failure = Some(e);
            break;
        }
        let copied = dest.copy_from(&buf[..n]);
        total += copied;
        if copied != n {
            break;
        }
    }
    buf.zeroize();

    match (total, failure) {
        (0, Some(e)) => Err(e.into()),
        (0, None) => Err(Error::Fault),
        (n, _) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uaccess::PagedBuffer;
    use crate::iter::UserSeg;

    struct Fixed(u8);

    impl ExtRng for Fixed {
        fn read_iter(&self, dest: &mut Destination<'_>, _reseed: bool) -> Result<usize, Error> {
            let fill = vec![self.0; dest.count()];
            Ok(dest.copy_from(&fill))
        }
    }

    #[test]
    fn test_falls_back_to_os() {
        let dev = RandomDevice::new();
        assert!(!dev.has_extrng());
        let mut buf = [0u8; 1500];
        let n = dev.read(&mut Destination::kernel(&mut buf), false).unwrap();
        assert_eq!(n, 1500);
        assert_ne!(buf, [0u8; 1500]);
    }

    #[test]
    fn test_os_fallback_zero_length() {
        let mut empty: [u8; 0] = [];
        assert_eq!(RandomDevice::new().read(&mut Destination::kernel(&mut empty), false).unwrap(), 0);
    }

    #[test]
    fn test_os_fallback_unmapped_destination_faults() {
        let mut space = PagedBuffer::new(0x40_0000, 64, 64);
        space.unmap(0x40_0000, 64);
        let mut dest = Destination::user(&mut space, vec![UserSeg { addr: 0x40_0000, len: 64 }]);
        assert!(matches!(RandomDevice::new().read(&mut dest, false), Err(Error::Fault)));
    }

    #[test]
    fn test_first_registration_wins() {
        let dev = RandomDevice::new();
        dev.register_extrng(Arc::new(Fixed(7))).unwrap();
        assert!(dev.register_extrng(Arc::new(Fixed(9))).is_err());
        assert!(dev.has_extrng());

        let mut buf = [0u8; 4];
        assert_eq!(dev.read(&mut Destination::kernel(&mut buf), true).unwrap(), 4);
        assert_eq!(buf, [7u8; 4]);
    }
}
