//! The cell pool: owner of the reserved range.
//!
//! A single bump cursor carves 2MB superblocks out of the reservation;
//! each superblock either becomes 128 cells on the lock-free free stack or is
//! handed out whole as a buddy arena. The kind table records which, one byte
//! per superblock, and is what lets `free` classify any in-reservation
//! pointer without taking a lock.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crate::cell::{
  CELL_MAGIC_FREED, CELL_MAGIC_LIVE, CellHeader, SIZE_CLASS_FREE, SIZE_CLASS_FREE_COLD,
  SIZE_CLASS_FULL_CELL,
};
use crate::config::{CELL_SIZE, CELLS_PER_SUPERBLOCK, SUPERBLOCK_SIZE, TLS_CELL_CACHE_CAPACITY};
use crate::tls;
use crate::vm;

/// Superblock kinds recorded in the kind table.
pub const SB_CELLS: u8 = 0;
pub const SB_BUDDY: u8 = 1;

const SUPERBLOCK_SHIFT: u32 = SUPERBLOCK_SIZE.trailing_zeros();

// The free stack head packs a version counter into the low bits the cell
// alignment leaves free, so a pop that raced a concurrent pop-push cannot
// succeed against a stale head (ABA).
const VERSION_MASK: u64 = (CELL_SIZE - 1) as u64;
const PTR_MASK: u64 = !VERSION_MASK;

/// A cell on the free stack: the freed header, then the intrusive link.
/// Keeping the link out of the header preserves the freed magic for
/// double-free checks.
#[repr(C)]
struct FreeCell {
  header: CellHeader,
  next: *mut FreeCell,
}

pub(crate) struct CellPool {
  /// Owning context id, used to key the per-thread cell cache.
  id: u64,
  raw_base: *mut u8,
  raw_len: usize,
  /// Superblock-aligned start of the usable range.
  base: *mut u8,
  /// Usable bytes, a whole number of superblocks.
  usable: usize,
  /// Offset of the next uncarved superblock. Only grows.
  cursor: AtomicUsize,
  /// Packed head of the free-cell stack.
  free_head: AtomicU64,
  committed: AtomicUsize,
  kinds: Box<[AtomicU8]>,
}

impl CellPool {
  /// Reserves the address range. Returns `None` when the OS refuses the
  /// reservation; the caller then runs inert.
  pub fn new(id: u64, reserve_size: usize) -> Option<Self> {
    let usable = reserve_size & !(SUPERBLOCK_SIZE - 1);
    let raw_len = usable.checked_add(SUPERBLOCK_SIZE)?;

    let raw = vm::reserve(raw_len);
    if raw.is_null() {
      return None;
    }

    let base = crate::cell::align_up(raw as usize, SUPERBLOCK_SIZE) as *mut u8;
    let kinds = (0..usable >> SUPERBLOCK_SHIFT)
      .map(|_| AtomicU8::new(SB_CELLS))
      .collect::<Vec<_>>()
      .into_boxed_slice();

    log::debug!("reserved {usable} bytes at {base:p}");

    Some(Self {
      id,
      raw_base: raw,
      raw_len,
      base,
      usable,
      cursor: AtomicUsize::new(0),
      free_head: AtomicU64::new(0),
      committed: AtomicUsize::new(0),
      kinds,
    })
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let base = self.base as usize;
    addr >= base && addr < base + self.usable
  }

  /// Whether `ptr` falls inside a superblock the cursor has already carved.
  #[inline]
  pub fn is_carved(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let base = self.base as usize;
    addr >= base && addr - base < self.cursor.load(Ordering::Acquire).min(self.usable)
  }

  /// Kind of the superblock enclosing `ptr`. Caller guarantees containment.
  #[inline]
  pub fn superblock_kind(&self, ptr: *const u8) -> u8 {
    let idx = (ptr as usize - self.base as usize) >> SUPERBLOCK_SHIFT;
    self.kinds[idx].load(Ordering::Acquire)
  }

  pub fn committed_bytes(&self) -> usize {
    self.committed.load(Ordering::Relaxed)
  }

  // ===========================================================================
  // Superblock carving
  // ===========================================================================

  /// Commits and returns the next 2MB superblock, or null when the
  /// reservation is exhausted. The cursor never rolls back, so exhaustion is
  /// sticky apart from cells returning through the free stack.
  pub fn carve_superblock(&self, kind: u8) -> *mut u8 {
    let off = self.cursor.fetch_add(SUPERBLOCK_SIZE, Ordering::Relaxed);
    if off >= self.usable {
      return null_mut();
    }

    let ptr = unsafe { self.base.add(off) };
    if !unsafe { vm::commit(ptr, SUPERBLOCK_SIZE) } {
      log::warn!("commit of superblock at {ptr:p} failed");
      return null_mut();
    }

    self.kinds[off >> SUPERBLOCK_SHIFT].store(kind, Ordering::Release);
    self.committed.fetch_add(SUPERBLOCK_SIZE, Ordering::Relaxed);
    log::trace!("carved superblock {} at {ptr:p} (kind {kind})", off >> SUPERBLOCK_SHIFT);
    ptr
  }

  // ===========================================================================
  // Cell alloc / free
  // ===========================================================================

  /// Pops a cell, preferring the per-thread cache, and initializes its header
  /// as a live whole cell. Null when the reservation is exhausted.
  pub fn alloc_cell(&self, tag: u8) -> *mut u8 {
    if let Some(Some(cell)) = tls::with_caches(self.id, |c| c.cell_pop()) {
      unsafe { init_live(cell, tag) };
      return cell;
    }

    let cell = self.pop_free_cell();
    if !cell.is_null() {
      // While we are on the slow path anyway, refill the thread cache in a
      // batch so the next few allocations stay local.
      tls::with_caches(self.id, |c| {
        while c.cell_len() < TLS_CELL_CACHE_CAPACITY / 2 {
          let extra = self.pop_free_cell();
          if extra.is_null() {
            break;
          }
          c.cell_push(extra);
        }
      });
      unsafe { init_live(cell, tag) };
      return cell;
    }

    let sb = self.carve_superblock(SB_CELLS);
    if sb.is_null() {
      return null_mut();
    }
    for i in (1..CELLS_PER_SUPERBLOCK).rev() {
      self.push_free_cell(unsafe { sb.add(i * CELL_SIZE) }, false);
    }
    unsafe { init_live(sb, tag) };
    sb
  }

  /// Returns a cell, preferring the per-thread cache; spills half the cache
  /// to the global stack when it is full.
  pub fn free_cell(&self, cell: *mut u8) {
    debug_assert!(cell as usize % CELL_SIZE == 0, "not a cell pointer");
    debug_assert!(self.contains(cell));
    unsafe {
      let header = cell as *mut CellHeader;
      debug_assert_eq!((*header).magic, CELL_MAGIC_LIVE, "double free of cell");
      mark_freed(header);
    }

    let cached = tls::with_caches(self.id, |c| {
      if c.cell_len() >= TLS_CELL_CACHE_CAPACITY {
        for _ in 0..TLS_CELL_CACHE_CAPACITY / 2 {
          if let Some(spill) = c.cell_pop() {
            self.push_free_cell(spill, false);
          }
        }
      }
      c.cell_push(cell)
    });

    if cached != Some(true) {
      self.push_free_cell(cell, false);
    }
  }

  /// Global-stack push used when draining thread caches.
  pub fn flush_cell(&self, cell: *mut u8) {
    self.push_free_cell(cell, false);
  }

  fn push_free_cell(&self, cell: *mut u8, cold: bool) {
    let fc = cell as *mut FreeCell;
    unsafe {
      (*fc).header.magic = CELL_MAGIC_FREED;
      (*fc).header.size_class = if cold { SIZE_CLASS_FREE_COLD } else { SIZE_CLASS_FREE };
      (*fc).header.free_count = 0;
    }

    loop {
      let packed = self.free_head.load(Ordering::Relaxed);
      unsafe { (*fc).next = (packed & PTR_MASK) as *mut FreeCell };
      let new_packed = cell as u64 | (packed.wrapping_add(1) & VERSION_MASK);
      if self
        .free_head
        .compare_exchange_weak(packed, new_packed, Ordering::Release, Ordering::Relaxed)
        .is_ok()
      {
        return;
      }
    }
  }

  fn pop_free_cell(&self) -> *mut u8 {
    loop {
      let packed = self.free_head.load(Ordering::Acquire);
      let ptr = (packed & PTR_MASK) as *mut FreeCell;
      if ptr.is_null() {
        return null_mut();
      }
      // The candidate may be popped and repurposed under us; a stale `next`
      // read is discarded because the versioned CAS below fails.
      let next = unsafe { (*ptr).next };
      let new_packed = next as u64 | (packed.wrapping_add(1) & VERSION_MASK);
      if self
        .free_head
        .compare_exchange_weak(packed, new_packed, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        unsafe {
          if (*ptr).header.size_class == SIZE_CLASS_FREE_COLD {
            // A decommitted cell coming back into service.
            self.committed.fetch_add(CELL_SIZE, Ordering::Relaxed);
          }
        }
        return ptr as *mut u8;
      }
    }
  }

  // ===========================================================================
  // Decommit
  // ===========================================================================

  /// Releases the physical pages behind every cell on the global free stack.
  /// In-use cells and thread-cached cells are never touched; virtual
  /// addresses are preserved. Returns the bytes handed back to the OS.
  pub fn decommit_unused(&self) -> usize {
    let mut drained = Vec::new();
    loop {
      let cell = self.pop_free_cell();
      if cell.is_null() {
        break;
      }
      drained.push(cell);
    }

    let released = drained.len() * CELL_SIZE;
    for &cell in &drained {
      unsafe { vm::decommit(cell, CELL_SIZE) };
      self.push_free_cell(cell, true);
    }
    self.committed.fetch_sub(released, Ordering::Relaxed);

    if released > 0 {
      log::debug!("decommitted {released} bytes across {} cells", drained.len());
    }
    released
  }
}

impl Drop for CellPool {
  fn drop(&mut self) {
    unsafe { vm::release(self.raw_base, self.raw_len) };
  }
}

/// Stamp a cell live as a whole-cell allocation. Size-class cells are
/// reformatted by the sub-cell tier afterwards.
unsafe fn init_live(cell: *mut u8, tag: u8) {
  let header = cell as *mut CellHeader;
  unsafe {
    (*header).tag = tag;
    (*header).size_class = SIZE_CLASS_FULL_CELL;
    (*header).free_count = 0;
    (*header).magic = CELL_MAGIC_LIVE;
  }
}

unsafe fn mark_freed(header: *mut CellHeader) {
  unsafe {
    #[cfg(debug_assertions)]
    {
      (*header).generation = (*header).generation.wrapping_add(1);
    }
    (*header).magic = CELL_MAGIC_FREED;
    (*header).size_class = SIZE_CLASS_FREE;
  }
}
