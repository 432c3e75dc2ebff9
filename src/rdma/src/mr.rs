//! Page-aligned memory backing a registered region.
use std::fmt;
use std::io;
use std::ptr;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;

const HUGE_PAGE_SIZE: usize = 2097152;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid region length: {0}.")]
    InvalidLength(usize),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
}

/// An anonymous mapping that is aligned to the page size, or to the huge page size when the
/// region is at least that large.
///
/// The memory is handed to the NIC by address, so the mapping never moves and is only
/// unmapped on drop.
pub struct MemoryRegion {
    ptr: *mut libc::c_void,
    len: usize,
    align: usize,
}

// Access to the bytes goes through raw pointers. Callers partition the region and
// synchronize on the partitions.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr, self.len)
                .unwrap_or_else(|e| log::error!("failed to munmap: {}", e))
        };
    }
}

impl MemoryRegion {
    /// Maps at least `nbytes` of zeroed memory. The length is rounded up to the alignment.
    pub fn new(nbytes: usize) -> Result<Self, Error> {
        if nbytes == 0 {
            return Err(Error::InvalidLength(nbytes));
        }
        let align = if nbytes < HUGE_PAGE_SIZE {
            page_size::get()
        } else {
            HUGE_PAGE_SIZE
        };
        let len = nbytes
            .checked_add(align - 1)
            .ok_or(Error::InvalidLength(nbytes))?
            / align
            * align;
        let (ptr, len) = Self::map_aligned(len, align)?;
        Ok(MemoryRegion { ptr, len, align })
    }

    /// Over-maps by `align` bytes and cuts off the unaligned head and the extra tail.
    fn map_aligned(len: usize, align: usize) -> io::Result<(*mut libc::c_void, usize)> {
        let mapped_len = align + len;
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                mapped_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                -1,
                0,
            )
            .map_err(io::Error::from)?
        };

        let addr = ptr as usize;
        let head_len = (align - addr % align) % align;
        if head_len > 0 {
            unsafe {
                munmap(ptr, head_len).unwrap_or_else(|e| log::error!("failed to munmap: {}", e))
            };
        }

        let tail_len = align - head_len;
        if tail_len > 0 {
            let tail_addr = addr + mapped_len - tail_len;
            debug_assert!(tail_addr % align == 0, "tail_addr: {:#0x?}", tail_addr);
            unsafe {
                munmap(tail_addr as *mut libc::c_void, tail_len)
                    .unwrap_or_else(|e| log::error!("failed to munmap: {}", e))
            };
        }

        let aligned_ptr: *mut libc::c_void = ptr.cast::<u8>().wrapping_add(head_len).cast();
        log::debug!(
            "ptr: {:0x?}, align: {}, len: {}, head_len: {}, tail_len: {}, aligned_ptr: {:0x?}",
            ptr,
            align,
            len,
            head_len,
            tail_len,
            aligned_ptr,
        );
        assert!(aligned_ptr as usize % align == 0);
        Ok((aligned_ptr, len))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Start address as the NIC sees it.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Returns a mutable pointer to the mapping.
    ///
    /// Writing through the pointer must not race with another writer or with an in-flight
    /// operation that targets the same bytes.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    #[inline]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.addr();
        addr >= start && addr.saturating_add(len as u64) <= start + self.len as u64
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("MemoryRegion")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("align", &self.align)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page() {
        let mr = MemoryRegion::new(100).unwrap();
        assert_eq!(mr.len(), page_size::get());
        assert_eq!(mr.addr() as usize % page_size::get(), 0);
        assert!(mr.contains(mr.addr(), 100));
        assert!(!mr.contains(mr.addr() + mr.len() as u64, 1));
    }

    #[test]
    fn huge_region_is_huge_page_aligned() {
        let mr = MemoryRegion::new(HUGE_PAGE_SIZE + 1).unwrap();
        assert_eq!(mr.align(), HUGE_PAGE_SIZE);
        assert_eq!(mr.len(), 2 * HUGE_PAGE_SIZE);
        assert_eq!(mr.addr() as usize % HUGE_PAGE_SIZE, 0);
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(MemoryRegion::new(0), Err(Error::InvalidLength(0))));
    }

    #[test]
    fn memory_is_writable() {
        let mr = MemoryRegion::new(4096).unwrap();
        unsafe {
            mr.as_mut_ptr().write_bytes(0xab, 16);
            assert_eq!(*mr.as_ptr().add(15), 0xab);
            assert_eq!(*mr.as_ptr().add(16), 0);
        }
    }
}
