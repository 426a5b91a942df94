//! Virtual-memory platform layer.
//!
//! The pool reserves one large PROT_NONE range up front and commits
//! superblocks out of it on demand; the large tier maps each allocation
//! separately. POSIX only.

use core::ptr::null_mut;
use std::sync::OnceLock;

/// Reserve `len` bytes of address space with no physical backing.
pub fn reserve(len: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// Make `[ptr, ptr+len)` readable and writable. Pages fault in on first touch.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> bool {
  unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

/// Return the physical pages behind `[ptr, ptr+len)` to the OS. The range
/// stays mapped and reads as zero after the next touch.
pub unsafe fn decommit(ptr: *mut u8, len: usize) {
  unsafe { libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED) };
}

/// Unmap a range previously obtained from [`reserve`] or [`map`].
pub unsafe fn release(ptr: *mut u8, len: usize) {
  unsafe { libc::munmap(ptr.cast(), len) };
}

/// Map `len` bytes of committed anonymous memory. When `try_huge` is set the
/// first attempt asks for huge pages and quietly falls back to regular ones.
pub fn map(len: usize, try_huge: bool) -> *mut u8 {
  let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

  if try_huge {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        flags | libc::MAP_HUGETLB,
        -1,
        0,
      )
    };
    if ptr != libc::MAP_FAILED {
      return ptr as *mut u8;
    }
    log::trace!("huge-page mapping of {len} bytes refused, falling back");
  }

  let ptr = unsafe { libc::mmap(null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, flags, -1, 0) };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// System page size, cached after the first query.
pub fn page_size() -> usize {
  static PAGE: OnceLock<usize> = OnceLock::new();
  *PAGE.get_or_init(|| {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reserve_commit_release() {
    let len = 4 * 1024 * 1024;
    let ptr = reserve(len);
    assert!(!ptr.is_null());

    unsafe {
      assert!(commit(ptr, 64 * 1024));
      ptr.write_bytes(0xAB, 64 * 1024);
      assert_eq!(*ptr, 0xAB);

      decommit(ptr, 64 * 1024);
      // Decommitted pages read back as zero.
      assert_eq!(*ptr, 0);

      release(ptr, len);
    }
  }

  #[test]
  fn map_without_huge_pages() {
    let ptr = map(128 * 1024, false);
    assert!(!ptr.is_null());
    unsafe {
      ptr.write_bytes(0x5A, 128 * 1024);
      release(ptr, 128 * 1024);
    }
  }

  #[test]
  fn page_size_sane() {
    let p = page_size();
    assert!(p.is_power_of_two());
    assert!(p >= 4096);
  }
}
