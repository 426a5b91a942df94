//! The large tier: one OS mapping per allocation, tracked in a registry.
//!
//! Unlike the cell and buddy tiers, large pointers carry no in-band header;
//! the registry keyed by user address is the authority for classifying and
//! releasing them.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::cell::align_up;
use crate::config::SUPERBLOCK_SIZE;
use crate::vm;

struct Mapping {
  base: *mut u8,
  len: usize,
  user_size: usize,
  #[allow(dead_code)]
  tag: u8,
}

pub(crate) struct LargeTier {
  map: Mutex<HashMap<usize, Mapping>>,
  bytes: AtomicUsize,
}

/// Bytes the OS mapping for a request will occupy. Huge-page attempts round
/// to the huge-page size; alignments beyond the page are over-mapped so the
/// user pointer can slide.
pub(crate) fn native_len(size: usize, align: usize, huge: bool) -> Option<usize> {
  let page = vm::page_size();
  let mut len = size.checked_add(page - 1)? & !(page - 1);
  if align > page {
    len = len.checked_add(align)?;
  }
  if huge {
    len = len.checked_add(SUPERBLOCK_SIZE - 1)? & !(SUPERBLOCK_SIZE - 1);
  }
  Some(len)
}

impl LargeTier {
  pub fn new() -> Self {
    Self {
      map: Mutex::new(HashMap::new()),
      bytes: AtomicUsize::new(0),
    }
  }

  /// Maps `len` bytes (as computed by [`native_len`]) and registers the user
  /// pointer. Null when the OS refuses.
  pub fn alloc(&self, size: usize, align: usize, tag: u8, huge: bool, len: usize) -> *mut u8 {
    let base = vm::map(len, huge);
    if base.is_null() {
      log::debug!("large mapping of {len} bytes refused by the OS");
      return null_mut();
    }

    let page = vm::page_size();
    let user = if align > page {
      align_up(base as usize, align) as *mut u8
    } else {
      base
    };

    self.map.lock().insert(
      user as usize,
      Mapping {
        base,
        len,
        user_size: size,
        tag,
      },
    );
    self.bytes.fetch_add(len, Ordering::Relaxed);
    log::trace!("large mapping {len} bytes at {base:p} (user {user:p})");
    user
  }

  /// Unmaps a registered pointer. Returns the mapping length, or `None` for
  /// pointers this tier does not own.
  pub fn free(&self, ptr: *mut u8) -> Option<usize> {
    let mapping = self.map.lock().remove(&(ptr as usize))?;
    unsafe { vm::release(mapping.base, mapping.len) };
    self.bytes.fetch_sub(mapping.len, Ordering::Relaxed);
    Some(mapping.len)
  }

  /// Recorded user size and remaining capacity past the user pointer.
  pub fn lookup(&self, ptr: *const u8) -> Option<(usize, usize)> {
    self.map.lock().get(&(ptr as usize)).map(|m| {
      let offset = ptr as usize - m.base as usize;
      (m.user_size, m.len - offset)
    })
  }

  /// In-place resize when the existing mapping already covers `new_size`.
  pub fn try_resize(&self, ptr: *mut u8, new_size: usize) -> bool {
    let mut map = self.map.lock();
    let Some(m) = map.get_mut(&(ptr as usize)) else {
      return false;
    };
    let offset = ptr as usize - m.base as usize;
    if new_size <= m.len - offset {
      m.user_size = new_size;
      true
    } else {
      false
    }
  }

  pub fn bytes(&self) -> usize {
    self.bytes.load(Ordering::Relaxed)
  }
}

impl Drop for LargeTier {
  fn drop(&mut self) {
    for (_, m) in self.map.get_mut().drain() {
      unsafe { vm::release(m.base, m.len) };
    }
  }
}
