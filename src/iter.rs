use crate::error::Error;
use crate::uaccess::{AddressSpace, PinnedPage};

/// One contiguous run of reader memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSeg {
    pub addr: usize,
    pub len: usize,
}

enum Backing<'a> {
    Kernel(Vec<&'a mut [u8]>),
    User {
        space: &'a mut dyn AddressSpace,
        segs: Vec<UserSeg>,
    },
}

/// Where a read delivers its bytes: our own buffers, or segments of a
/// reader's address space. Tracks how much is still wanted.
pub struct Destination<'a> {
    backing: Backing<'a>,
    seg: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> Destination<'a> {
    pub fn kernel(buf: &'a mut [u8]) -> Self {
        Self::kernel_vec(vec![buf])
    }

    pub fn kernel_vec(bufs: Vec<&'a mut [u8]>) -> Self {
        let remaining = bufs.iter().map(|b| b.len()).sum();
        Self::settled(Backing::Kernel(bufs), remaining)
    }

    pub fn user(space: &'a mut dyn AddressSpace, segs: Vec<UserSeg>) -> Self {
        let remaining = segs.iter().map(|s| s.len).sum();
        Self::settled(Backing::User { space, segs }, remaining)
    }

    fn settled(backing: Backing<'a>, remaining: usize) -> Self {
        let mut dest = Self {
            backing,
            seg: 0,
            offset: 0,
            remaining,
        };
        dest.settle();
        dest
    }

    /// Bytes still wanted.
    pub fn count(&self) -> usize {
        self.remaining
    }

    pub fn is_user_backed(&self) -> bool {
        matches!(self.backing, Backing::User { .. })
    }

    fn seg_len(&self, i: usize) -> Option<usize> {
        match &self.backing {
            Backing::Kernel(bufs) => bufs.get(i).map(|b| b.len()),
            Backing::User { segs, .. } => segs.get(i).map(|s| s.len),
        }
    }

    /// Skip exhausted and empty segments.
    fn settle(&mut self) {
        while let Some(len) = self.seg_len(self.seg) {
            if self.offset < len {
                break;
            }
            self.seg += 1;
            self.offset = 0;
        }
    }

    /// Address and remaining length of the current user segment.
    pub fn user_cursor(&self) -> Option<(usize, usize)> {
        match &self.backing {
            Backing::User { segs, .. } if self.remaining > 0 => {
                let seg = segs.get(self.seg)?;
                Some((seg.addr + self.offset, seg.len - self.offset))
            }
            _ => None,
        }
    }

    pub fn advance(&mut self, mut n: usize) {
        n = n.min(self.remaining);
        self.remaining -= n;
        while n > 0 {
            let Some(len) = self.seg_len(self.seg) else {
                break;
            };
            let step = (len - self.offset).min(n);
            self.offset += step;
            n -= step;
            self.settle();
        }
        self.settle();
    }

    /// Copy as much of `src` as fits, faulting reader pages in if needed.
    /// Returns the number of bytes delivered.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let want = src.len().min(self.remaining);
        let mut done = 0;

        while done < want {
            let (seg, off) = (self.seg, self.offset);
            let (copied, short) = match &mut self.backing {
                Backing::Kernel(bufs) => {
                    let dst = &mut bufs[seg][off..];
                    let n = dst.len().min(want - done);
                    dst[..n].copy_from_slice(&src[done..done + n]);
                    (n, false)
                }
                Backing::User { space, segs } => {
                    let s = segs[seg];
                    let n = (s.len - off).min(want - done);
                    let c = space.copy_to(s.addr + off, &src[done..done + n]);
                    (c, c < n)
                }
            };
            self.advance(copied);
            done += copied;
            if short {
                break;
            }
        }

        done
    }

    /// Copy all of `src` to the current user cursor without faulting.
    /// Nothing is consumed on failure.
    pub fn copy_nofault(&mut self, src: &[u8]) -> Result<(), Error> {
        let (addr, len) = self.user_cursor().ok_or(Error::Fault)?;
        if src.len() > len {
            return Err(Error::Fault);
        }
        match &mut self.backing {
            Backing::User { space, .. } => space.copy_nofault(addr, src)?,
            Backing::Kernel(_) => return Err(Error::Fault),
        }
        self.advance(src.len());
        Ok(())
    }

    pub fn pin_cursor(&mut self, may_fault: bool) -> Option<PinnedPage> {
        let (addr, _) = self.user_cursor()?;
        match &mut self.backing {
            Backing::User { space, .. } => space.pin_page(addr, may_fault),
            Backing::Kernel(_) => None,
        }
    }

    pub fn unpin(&mut self, page: PinnedPage) {
        if let Backing::User { space, .. } = &mut self.backing {
            space.unpin_page(page);
        }
    }
}
