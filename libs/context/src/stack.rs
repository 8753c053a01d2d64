// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::ptr;

/// The smallest stack [`Stack::new`] will hand out, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// A task stack backed by an anonymous memory mapping.
///
/// The lowest page of the mapping is left inaccessible so that running off
/// the end of the stack faults instead of silently corrupting memory.
#[derive(Debug)]
pub struct Stack {
    base: usize,
    mmap_len: usize,
    guard_len: usize,
}

// Safety: the mapping is exclusively owned and only ever accessed through
// the context running on it.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a new stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping or the protection change fails.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping with no address hint, checked below
        let mmap = unsafe { libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0) };
        if mmap == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Created before mprotect so a failure below still unmaps the region.
        let stack = Self {
            base: mmap as usize,
            mmap_len,
            guard_len: page_size,
        };

        // Safety: the range lies inside the mapping created above
        let res = unsafe {
            libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }

    /// The highest address of the stack, where execution starts.
    pub fn top(&self) -> usize {
        self.base + self.mmap_len
    }

    /// The lowest usable address, right above the guard page.
    pub fn limit(&self) -> usize {
        self.base + self.guard_len
    }

    /// Usable bytes, excluding the guard page.
    pub fn size(&self) -> usize {
        self.mmap_len - self.guard_len
    }

    /// Returns `true` if `addr` lies in the usable part of this stack.
    pub fn contains(&self, addr: usize) -> bool {
        (self.limit()..self.top()).contains(&addr)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `base..base + mmap_len` is the mapping created in `new`
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(4096);
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_and_reserves_guard() {
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert!(stack.size() > MIN_STACK_SIZE);
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.contains(stack.top() - 1));
        assert!(!stack.contains(stack.limit() - 1));
    }

    #[test]
    fn small_requests_get_minimum() {
        let stack = Stack::new(0).unwrap();
        assert!(stack.size() >= MIN_STACK_SIZE);

        // The whole usable range is writable.
        // Safety: `limit..top` is mapped read/write
        unsafe {
            ptr::write_bytes(stack.limit() as *mut u8, 0xa5, stack.size());
            assert_eq!(*((stack.top() - 1) as *const u8), 0xa5);
        }
    }
}
