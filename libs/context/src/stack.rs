// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::ptr;

/// Minimum usable size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// An mmap-allocated stack with a `PROT_NONE` guard page below the usable
/// region.
///
/// The mapping is reserved as `PROT_NONE` and everything above the lowest
/// page is then made read-write, so an overflowing context faults instead of
/// silently scribbling over neighbouring allocations.
#[derive(Debug)]
pub struct Stack {
    mmap: *mut u8,
    mmap_len: usize,
    page_size: usize,
}

// Safety: the mapping is exclusively owned by this `Stack` and carries no
// thread affinity; moving ownership to another thread is fine.
unsafe impl Send for Stack {}

impl Stack {
    /// Creates a new stack with at least `size` usable bytes.
    ///
    /// `size` is clamped to [`MIN_STACK_SIZE`] and rounded up to a whole
    /// number of pages.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reserving or protecting the mapping fails.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let page_size = page_size();

        // Apply the minimum and round up to a page boundary.
        let size = size
            .max(MIN_STACK_SIZE)
            .checked_add(page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);
        let mmap_len = size + page_size;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no aliasing to worry about; the pointer
        // arithmetic stays inside the mapping we just reserved.
        unsafe {
            // Reserve address space for guard page + stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this
            // will be dropped and the memory will be unmapped.
            let out = Self {
                mmap: mmap.cast::<u8>(),
                mmap_len,
                page_size,
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Returns the lowest usable address, just above the guard page.
    pub fn limit(&self) -> *mut u8 {
        // Safety: the guard page is the first page of the mapping, so the
        // offset stays in bounds.
        unsafe { self.mmap.add(self.page_size) }
    }

    /// Returns the number of usable bytes, excluding the guard page.
    pub fn size(&self) -> usize {
        self.mmap_len - self.page_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: we unmap exactly the region we mapped in `new`.
        unsafe {
            let ret = libc::munmap(self.mmap.cast(), self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    #[expect(clippy::cast_sign_loss, reason = "page size is never negative")]
    // Safety: sysconf(_SC_PAGESIZE) has no side effects.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
