//! Per-thread caches.
//!
//! Each thread keeps a handful of free cells and a small stack of blocks for
//! the four hottest size classes, so the usual alloc/free cycle touches no
//! lock at all. The record binds to the first context that uses it on this
//! thread; other contexts simply bypass the caches instead of mixing blocks
//! across reservations.
//!
//! Cached entries are invisible to the owning context until
//! `flush_tls_bin_caches` drains them, which is why flushing is mandatory
//! before a thread exits. Unflushed blocks are not lost, only unreachable
//! until the context unmaps its reservation.

use core::cell::UnsafeCell;
use core::ptr::null_mut;

use crate::cell::FreeBlock;
use crate::config::{TLS_BIN_CACHE_CAPACITY, TLS_CELL_CACHE_CAPACITY, TLS_HOT_BINS};

struct BinCache {
  blocks: [*mut FreeBlock; TLS_BIN_CACHE_CAPACITY],
  len: usize,
}

pub(crate) struct ThreadCaches {
  ctx_id: u64,
  bins: [BinCache; TLS_HOT_BINS],
  cells: [*mut u8; TLS_CELL_CACHE_CAPACITY],
  cells_len: usize,
}

impl ThreadCaches {
  const fn new() -> Self {
    const EMPTY_BIN: BinCache = BinCache {
      blocks: [null_mut(); TLS_BIN_CACHE_CAPACITY],
      len: 0,
    };
    Self {
      ctx_id: 0,
      bins: [EMPTY_BIN; TLS_HOT_BINS],
      cells: [null_mut(); TLS_CELL_CACHE_CAPACITY],
      cells_len: 0,
    }
  }

  #[inline]
  pub fn bin_pop(&mut self, bin: usize) -> Option<*mut FreeBlock> {
    let cache = &mut self.bins[bin];
    if cache.len == 0 {
      return None;
    }
    cache.len -= 1;
    Some(cache.blocks[cache.len])
  }

  /// Returns false when the cache is full; the caller takes the locked path.
  #[inline]
  pub fn bin_push(&mut self, bin: usize, block: *mut FreeBlock) -> bool {
    let cache = &mut self.bins[bin];
    if cache.len >= TLS_BIN_CACHE_CAPACITY {
      return false;
    }
    cache.blocks[cache.len] = block;
    cache.len += 1;
    true
  }

  #[inline]
  pub fn cell_pop(&mut self) -> Option<*mut u8> {
    if self.cells_len == 0 {
      return None;
    }
    self.cells_len -= 1;
    Some(self.cells[self.cells_len])
  }

  #[inline]
  pub fn cell_push(&mut self, cell: *mut u8) -> bool {
    if self.cells_len >= TLS_CELL_CACHE_CAPACITY {
      return false;
    }
    self.cells[self.cells_len] = cell;
    self.cells_len += 1;
    true
  }

  #[inline]
  pub fn cell_len(&self) -> usize {
    self.cells_len
  }

  /// Release the context binding. Valid only once every cache is empty.
  pub fn unbind(&mut self) {
    debug_assert!(self.cells_len == 0);
    debug_assert!(self.bins.iter().all(|b| b.len == 0));
    self.ctx_id = 0;
  }
}

thread_local! {
  static CACHES: UnsafeCell<ThreadCaches> = const { UnsafeCell::new(ThreadCaches::new()) };
}

/// Runs `f` against this thread's caches if they are bound to `ctx_id` (or
/// unbound, in which case they bind now). Returns `None` when the caches
/// belong to another context or the thread is already tearing down its TLS.
pub(crate) fn with_caches<R>(ctx_id: u64, f: impl FnOnce(&mut ThreadCaches) -> R) -> Option<R> {
  CACHES
    .try_with(|c| {
      let caches = unsafe { &mut *c.get() };
      if caches.ctx_id == 0 {
        caches.ctx_id = ctx_id;
      }
      if caches.ctx_id != ctx_id {
        return None;
      }
      Some(f(caches))
    })
    .ok()
    .flatten()
}
