use std::ops::Range;

use zeroize::Zeroize;

use crate::error::Error;

/// A page pinned for writing; must be handed back to `unpin_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedPage {
    pub addr: usize,
}

/// Memory that belongs to the reader rather than to us.
pub trait AddressSpace {
    /// Pin the page holding `addr`. With `may_fault` the page is faulted in
    /// first, which can block; without it a non-resident page fails.
    fn pin_page(&mut self, addr: usize, may_fault: bool) -> Option<PinnedPage>;

    fn unpin_page(&mut self, page: PinnedPage);

    /// Never blocks. All or nothing.
    fn copy_nofault(&mut self, addr: usize, src: &[u8]) -> Result<(), Error>;

    /// May fault pages in. Returns the number of bytes copied before the
    /// first inaccessible page.
    fn copy_to(&mut self, addr: usize, src: &[u8]) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
struct PageState {
    resident: bool,
    unmapped: bool,
    pins: u32,
}

/// A lazily populated region at a fixed virtual base address.
///
/// Pages start out non-resident and are faulted in on first faulting access.
/// Unmapped pages can never be accessed.
pub struct PagedBuffer {
    base: usize,
    page_size: usize,
    data: Vec<u8>,
    pages: Vec<PageState>,
}

impl PagedBuffer {
    /// `base` is rounded down to a page boundary and `len` up to whole pages.
    pub fn new(base: usize, len: usize, page_size: usize) -> Self {
        let npages = len.div_ceil(page_size).max(1);
        Self {
            base: base - base % page_size,
            page_size,
            data: vec![0u8; npages * page_size],
            pages: vec![PageState::default(); npages],
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Zero the whole region, resident or not.
    pub fn scrub(&mut self) {
        self.data.zeroize();
    }

    /// Bytes at `[addr, addr + len)`, whether resident or not.
    pub fn read(&self, addr: usize, len: usize) -> &[u8] {
        let start = addr - self.base;
        &self.data[start..start + len]
    }

    pub fn unmap(&mut self, addr: usize, len: usize) {
        if let Some(range) = self.page_range(addr, len.max(1)) {
            for page in &mut self.pages[range] {
                page.unmapped = true;
                page.resident = false;
            }
        }
    }

    /// Drop every unpinned page out of residency.
    pub fn evict(&mut self) {
        for page in self.pages.iter_mut().filter(|p| p.pins == 0) {
            page.resident = false;
        }
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.resident).count()
    }

    pub fn pinned_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.pins > 0).count()
    }

    fn page_index(&self, addr: usize) -> Option<usize> {
        let idx = addr.checked_sub(self.base)? / self.page_size;
        (idx < self.pages.len()).then_some(idx)
    }

    fn page_range(&self, addr: usize, len: usize) -> Option<Range<usize>> {
        let first = self.page_index(addr)?;
        let last = self.page_index(addr + len - 1)?;
        Some(first..last + 1)
    }
}

impl Drop for PagedBuffer {
    fn drop(&mut self) {
        self.scrub();
    }
}

impl AddressSpace for PagedBuffer {
    fn pin_page(&mut self, addr: usize, may_fault: bool) -> Option<PinnedPage> {
        let idx = self.page_index(addr)?;
        let page = &mut self.pages[idx];
        if page.unmapped {
            return None;
        }
        if !page.resident {
            if !may_fault {
                return None;
            }
            page.resident = true;
        }
        page.pins += 1;
        Some(PinnedPage {
            addr: self.base + idx * self.page_size,
        })
    }

    fn unpin_page(&mut self, page: PinnedPage) {
        if let Some(idx) = self.page_index(page.addr) {
            let state = &mut self.pages[idx];
            state.pins = state.pins.saturating_sub(1);
        }
    }

    fn copy_nofault(&mut self, addr: usize, src: &[u8]) -> Result<(), Error> {
        if src.is_empty() {
            return Ok(());
        }
        let range = self.page_range(addr, src.len()).ok_or(Error::Fault)?;
        if self.pages[range].iter().any(|p| p.unmapped || !p.resident) {
            return Err(Error::Fault);
        }
        let start = addr - self.base;
        self.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_to(&mut self, addr: usize, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() {
            let cur = addr + copied;
            let Some(idx) = self.page_index(cur) else {
                break;
            };
            if self.pages[idx].unmapped {
                break;
            }
            self.pages[idx].resident = true;

            let in_page = self.page_size - (cur - self.base) % self.page_size;
            let n = in_page.min(src.len() - copied);
            let start = cur - self.base;
            self.data[start..start + n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        copied
    }
}
