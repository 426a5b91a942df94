//! The sub-cell tier: ten size-class bins over dedicated cells.
//!
//! A bin owns an unordered intrusive list of partial cells (at least one free
//! block each). Allocation pops a block from the head cell's in-cell free
//! list; when a cell runs dry it drops off the partial list, and when it goes
//! completely empty it is either kept as a warm reserve or handed back to the
//! pool. Each bin has its own lock and no operation ever holds two of them.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cell::{
  CELL_MAGIC_LIVE, CellHeader, FreeBlock, block_start_offset, blocks_per_cell, header_of,
  metadata_of,
};
use crate::config::{NUM_SIZE_BINS, SIZE_CLASSES, WARM_CELLS_PER_BIN};
use crate::pool::CellPool;

#[cfg(debug_assertions)]
use crate::cell::POISON_BYTE;

/// Point-in-time view of one bin, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinStats {
  /// Blocks ever allocated from this bin.
  pub total_allocated: u64,
  /// Blocks currently outstanding.
  pub current_allocated: u64,
  /// Fully-empty cells retained as warm reserve.
  pub warm_cell_count: usize,
}

struct BinList {
  partial_head: *mut CellHeader,
  warm_cells: usize,
}

struct SizeBin {
  list: Mutex<BinList>,
  // Kept outside the lock so the thread-cached fast paths can account
  // without taking it.
  total: AtomicU64,
  current: AtomicU64,
}

pub(crate) struct SubCellTier {
  bins: [SizeBin; NUM_SIZE_BINS],
}

impl SubCellTier {
  pub fn new() -> Self {
    Self {
      bins: core::array::from_fn(|_| SizeBin {
        list: Mutex::new(BinList {
          partial_head: null_mut(),
          warm_cells: 0,
        }),
        total: AtomicU64::new(0),
        current: AtomicU64::new(0),
      }),
    }
  }

  #[inline]
  pub fn note_alloc(&self, bin: usize) {
    self.bins[bin].total.fetch_add(1, Ordering::Relaxed);
    self.bins[bin].current.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub fn note_free(&self, bin: usize) {
    self.bins[bin].current.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn stats(&self, bin: usize) -> BinStats {
    let b = &self.bins[bin];
    let warm = b.list.lock().warm_cells;
    BinStats {
      total_allocated: b.total.load(Ordering::Relaxed),
      current_allocated: b.current.load(Ordering::Relaxed),
      warm_cell_count: warm,
    }
  }

  /// Locked allocation path. Accounts on success.
  pub fn alloc(&self, pool: &CellPool, bin: usize, tag: u8) -> *mut u8 {
    debug_assert!(bin < NUM_SIZE_BINS);
    let b = &self.bins[bin];
    let mut list = b.list.lock();

    let head = list.partial_head;
    if !head.is_null() {
      let block = unsafe {
        let meta = metadata_of(head);
        let block = (*meta).free_list;
        debug_assert!(!block.is_null(), "partial cell with empty free list");
        (*meta).free_list = (*block).next;

        if (*head).free_count as usize == blocks_per_cell(bin) {
          // First allocation out of a warm cell.
          list.warm_cells = list.warm_cells.saturating_sub(1);
        }
        (*head).free_count -= 1;
        if (*head).free_count == 0 {
          list.partial_head = (*meta).next_partial;
          (*meta).next_partial = null_mut();
        }
        block
      };
      drop(list);
      self.note_alloc(bin);
      return block as *mut u8;
    }

    // No partial cell: format a fresh one for this class.
    let raw = pool.alloc_cell(tag);
    if raw.is_null() {
      return null_mut();
    }

    let block = unsafe {
      let header = raw as *mut CellHeader;
      format_cell(header, bin, tag);
      let meta = metadata_of(header);
      let block = (*meta).free_list;
      (*meta).free_list = (*block).next;
      (*header).free_count -= 1;
      if (*header).free_count > 0 {
        (*meta).next_partial = list.partial_head;
        list.partial_head = header;
      }
      block
    };
    drop(list);
    self.note_alloc(bin);
    block as *mut u8
  }

  /// Locked release path. List mechanics only; the caller owns the
  /// statistics and budget side.
  pub unsafe fn release(&self, pool: &CellPool, ptr: *mut u8, header: *mut CellHeader) {
    let bin = unsafe { (*header).size_class } as usize;
    debug_assert!(bin < NUM_SIZE_BINS);
    let mut list = self.bins[bin].list.lock();
    unsafe { release_into(&mut list, pool, ptr, header, bin) };
  }

  /// Frees a batch of same-class blocks under a single bin lock. Returns the
  /// bin and how many blocks were released. Mixing classes in one batch is a
  /// contract violation, checked in debug builds.
  pub unsafe fn free_batch(&self, pool: &CellPool, ptrs: &[*mut u8]) -> (usize, u64) {
    let Some(&first) = ptrs.iter().find(|p| !p.is_null()) else {
      return (0, 0);
    };
    let bin = unsafe { (*header_of(first)).size_class } as usize;
    debug_assert!(bin < NUM_SIZE_BINS);

    let b = &self.bins[bin];
    let mut list = b.list.lock();
    let mut freed = 0u64;
    for &ptr in ptrs {
      if ptr.is_null() {
        continue;
      }
      let header = header_of(ptr);
      debug_assert_eq!(
        unsafe { (*header).size_class } as usize,
        bin,
        "free_batch requires a single size class"
      );
      unsafe { release_into(&mut list, pool, ptr, header, bin) };
      freed += 1;
    }
    drop(list);
    b.current.fetch_sub(freed, Ordering::Relaxed);
    (bin, freed)
  }
}

/// Dedicate a fresh cell to `bin`: write the header and thread every block
/// into the in-cell free list, in reverse so the list walks forward in
/// memory.
unsafe fn format_cell(header: *mut CellHeader, bin: usize, tag: u8) {
  let class = SIZE_CLASSES[bin];
  let num_blocks = blocks_per_cell(bin);

  unsafe {
    (*header).tag = tag;
    (*header).size_class = bin as u8;
    (*header).free_count = num_blocks as u16;
    (*header).magic = CELL_MAGIC_LIVE;

    let meta = metadata_of(header);
    (*meta).next_partial = null_mut();

    let start = (header as *mut u8).add(block_start_offset(bin));
    let mut prev: *mut FreeBlock = null_mut();
    for i in (0..num_blocks).rev() {
      let block = start.add(i * class) as *mut FreeBlock;
      (*block).next = prev;
      prev = block;
    }
    (*meta).free_list = prev;
  }
}

unsafe fn release_into(
  list: &mut BinList,
  pool: &CellPool,
  ptr: *mut u8,
  header: *mut CellHeader,
  bin: usize,
) {
  unsafe {
    debug_assert_eq!((*header).magic, CELL_MAGIC_LIVE, "freed or foreign cell");
    #[cfg(debug_assertions)]
    {
      let offset = ptr as usize - header as usize - block_start_offset(bin);
      debug_assert_eq!(offset % SIZE_CLASSES[bin], 0, "pointer not on a block boundary");
      ptr.write_bytes(POISON_BYTE, SIZE_CLASSES[bin]);
    }

    let meta = metadata_of(header);
    let was_full = (*header).free_count == 0;

    let block = ptr as *mut FreeBlock;
    (*block).next = (*meta).free_list;
    (*meta).free_list = block;
    (*header).free_count += 1;

    if (*header).free_count as usize == blocks_per_cell(bin) {
      // Completely empty: keep it warm or give it back.
      if list.warm_cells < WARM_CELLS_PER_BIN {
        list.warm_cells += 1;
        if was_full {
          (*meta).next_partial = list.partial_head;
          list.partial_head = header;
        }
      } else {
        if !was_full {
          unlink_partial(list, header);
        }
        (*meta).next_partial = null_mut();
        pool.free_cell(header as *mut u8);
      }
    } else if was_full {
      // Full cell has space again: back onto the partial list.
      (*meta).next_partial = list.partial_head;
      list.partial_head = header;
    }
  }
}

unsafe fn unlink_partial(list: &mut BinList, header: *mut CellHeader) {
  unsafe {
    let mut pp: *mut *mut CellHeader = &mut list.partial_head;
    while !(*pp).is_null() && *pp != header {
      pp = &mut (*metadata_of(*pp)).next_partial;
    }
    if *pp == header {
      *pp = (*metadata_of(header)).next_partial;
    } else {
      debug_assert!(false, "cell missing from its partial list");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{CELL_SIZE, SUPERBLOCK_SIZE};

  #[test]
  fn alloc_free_single_bin() {
    let pool = CellPool::new(2001, 4 * SUPERBLOCK_SIZE).unwrap();
    let tier = SubCellTier::new();

    let a = tier.alloc(&pool, 2, 7);
    let b = tier.alloc(&pool, 2, 7);
    assert!(!a.is_null() && !b.is_null());
    // Same cell, forward iteration order, class-aligned.
    assert_eq!(header_of(a), header_of(b));
    assert_eq!(b as usize - a as usize, 64);
    assert_eq!(a as usize % 64, 0);
    assert_eq!(tier.stats(2).current_allocated, 2);

    unsafe {
      tier.note_free(2);
      tier.release(&pool, a, header_of(a));
      tier.note_free(2);
      tier.release(&pool, b, header_of(b));
    }
    let stats = tier.stats(2);
    assert_eq!(stats.current_allocated, 0);
    assert_eq!(stats.total_allocated, 2);
    assert_eq!(stats.warm_cell_count, 1);
  }

  #[test]
  fn cell_cycles_through_full_and_back() {
    let pool = CellPool::new(2002, 4 * SUPERBLOCK_SIZE).unwrap();
    let tier = SubCellTier::new();

    // Bin 9 holds exactly one block per cell, so every alloc fills a cell.
    let blocks: Vec<_> = (0..3).map(|_| tier.alloc(&pool, 9, 0)).collect();
    assert!(blocks.iter().all(|p| !p.is_null()));
    for &p in &blocks {
      unsafe {
        tier.note_free(9);
        tier.release(&pool, p, header_of(p));
      }
    }
    assert_eq!(tier.stats(9).warm_cell_count, 3);
    // Warm cells are reused before fresh cells are formatted.
    let again = tier.alloc(&pool, 9, 0);
    assert!(blocks.contains(&again));
    assert_eq!(tier.stats(9).warm_cell_count, 2);
  }

  #[test]
  fn surplus_empty_cells_return_to_pool() {
    let pool = CellPool::new(2003, 8 * SUPERBLOCK_SIZE).unwrap();
    let tier = SubCellTier::new();

    let per_cell = blocks_per_cell(5); // 512-byte class
    let cells = WARM_CELLS_PER_BIN + 3;
    let mut blocks = Vec::new();
    for _ in 0..cells * per_cell {
      let p = tier.alloc(&pool, 5, 0);
      assert!(!p.is_null());
      blocks.push(p);
    }

    let distinct: std::collections::HashSet<_> =
      blocks.iter().map(|&p| header_of(p) as usize).collect();
    assert_eq!(distinct.len(), cells);

    for &p in &blocks {
      unsafe {
        tier.note_free(5);
        tier.release(&pool, p, header_of(p));
      }
    }
    let stats = tier.stats(5);
    assert_eq!(stats.current_allocated, 0);
    assert_eq!(stats.warm_cell_count, WARM_CELLS_PER_BIN);
  }

  #[test]
  fn batch_free_single_lock() {
    let pool = CellPool::new(2004, 4 * SUPERBLOCK_SIZE).unwrap();
    let tier = SubCellTier::new();

    let blocks: Vec<_> = (0..32).map(|_| tier.alloc(&pool, 3, 0)).collect();
    let (bin, n) = unsafe { tier.free_batch(&pool, &blocks) };
    assert_eq!((bin, n), (3, 32));
    assert_eq!(tier.stats(3).current_allocated, 0);
  }

  #[test]
  fn debug_layout_constants() {
    assert!(blocks_per_cell(0) * 16 + block_start_offset(0) <= CELL_SIZE);
    assert!(blocks_per_cell(9) == 1);
  }
}
