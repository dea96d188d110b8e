//! Details about the stacks backing fibers.
//!
//! Each fiber owns one anonymous memory mapping used as its call stack. The
//! mapping is plain read/write memory: where the platform offers them,
//! stack-growth hints are passed to `mmap`, but these are advisory only and
//! no guard page is installed. Overflowing a fiber stack is undefined
//! behavior; pick the ring's stack size accordingly.

use core::num::NonZeroUsize;
use std::io::{Error, Result};
use std::ptr;

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum size of a fiber stack.
pub const MIN_STACK_SIZE: usize = 4096;

/// Number of pages in a default-sized fiber stack.
const DEFAULT_STACK_PAGES: usize = 1024;

pub(crate) fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Stack size used by rings configured with a size of zero: 1024 pages.
pub fn default_stack_size() -> usize {
    DEFAULT_STACK_PAGES * page_size()
}

/// An anonymous memory mapping used as a fiber stack.
pub struct FiberStack {
    base: StackPointer,
    mmap_len: usize,
}

impl FiberStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self> {
        // Apply minimum stack size and round up to a page boundary.
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // Pass stack-growth hints where the platform has them. OpenBSD
        // additionally requires MAP_STACK on anything used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                let map_flags = libc::MAP_ANONYMOUS
                    | libc::MAP_PRIVATE
                    | libc::MAP_STACK
                    | libc::MAP_GROWSDOWN;
            } else if #[cfg(any(target_os = "freebsd", target_os = "openbsd"))] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            Ok(Self {
                base: StackPointer::new_unchecked(mmap as usize + mmap_len),
                mmap_len,
            })
        }
    }

    /// Returns the base address of the stack. This is the highest address
    /// since stacks grow downwards, and it is aligned to [`STACK_ALIGNMENT`].
    #[inline]
    pub fn base(&self) -> StackPointer {
        self.base
    }

    /// Returns the lowest usable address of the stack.
    #[inline]
    pub fn limit(&self) -> StackPointer {
        StackPointer::new(self.base.get() - self.mmap_len).unwrap()
    }

    /// Returns the usable size of the stack in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.mmap_len
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.base.get() - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}
