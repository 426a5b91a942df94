//! The context: a self-contained allocator over one reserved range.
//!
//! Requests route by size to one of four tiers; releases recover the tier
//! from the pointer alone. In-reservation pointers are classified through the
//! pool's superblock kind table and the masked cell header, everything else
//! through the large registry. Exactly one of the three descriptions applies
//! to every pointer a context hands out.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buddy::{self, BuddyTier};
use crate::cell::{
  CELL_MAGIC_LIVE, CELL_PAYLOAD_MAX, CELL_PAYLOAD_OFFSET, SIZE_CLASS_FULL_CELL, header_of,
  size_class_for,
};
use crate::config::{CELL_SIZE, Config, NUM_SIZE_BINS, SIZE_CLASSES, TLS_HOT_BINS};
use crate::large::{self, LargeTier};
use crate::pool::{CellPool, SB_BUDDY};
use crate::sub_cell::SubCellTier;
use crate::tls;

pub use crate::sub_cell::BinStats;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked when an allocation would cross the budget, with
/// `(requested, budget, current)`.
pub type BudgetCallback = Box<dyn Fn(usize, usize, usize) + Send + Sync>;

struct Budget {
  limit: AtomicUsize,
  current: AtomicUsize,
  callback: Mutex<Option<BudgetCallback>>,
}

impl Budget {
  fn new(limit: usize) -> Self {
    Self {
      limit: AtomicUsize::new(limit),
      current: AtomicUsize::new(0),
      callback: Mutex::new(None),
    }
  }

  /// Adds `native` bytes, refusing when a nonzero limit would be crossed.
  /// Returns `(limit, current)` on refusal.
  fn charge(&self, native: usize) -> Result<(), (usize, usize)> {
    let limit = self.limit.load(Ordering::Relaxed);
    if limit == 0 {
      self.current.fetch_add(native, Ordering::Relaxed);
      return Ok(());
    }
    let mut current = self.current.load(Ordering::Relaxed);
    loop {
      let charged = match current.checked_add(native) {
        Some(total) if total <= limit => total,
        _ => return Err((limit, current)),
      };
      match self.current.compare_exchange_weak(
        current,
        charged,
        Ordering::Relaxed,
        Ordering::Relaxed,
      ) {
        Ok(_) => return Ok(()),
        Err(observed) => current = observed,
      }
    }
  }

  fn try_charge_quiet(&self, native: usize) -> bool {
    self.charge(native).is_ok()
  }

  fn uncharge(&self, native: usize) {
    self.current.fetch_sub(native, Ordering::Relaxed);
  }
}

/// Tier a request of a given size and alignment lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
  Bin(usize),
  Cell,
  Buddy(u8),
  Large,
}

fn route(size: usize, align: usize) -> Route {
  if let Some(bin) = size_class_for(size, align) {
    Route::Bin(bin)
  } else if size <= CELL_PAYLOAD_MAX && align <= CELL_PAYLOAD_OFFSET {
    Route::Cell
  } else if let Some(order) = buddy::order_for(size, align) {
    Route::Buddy(order)
  } else {
    Route::Large
  }
}

/// A memory environment owning a reserved virtual address range.
///
/// All methods take `&self`; a context is meant to be shared across threads.
/// Dropping the context releases every mapping it owns; pointers obtained
/// from it must not be used afterwards.
pub struct Context {
  id: u64,
  huge_pages_threshold: usize,
  pool: Option<CellPool>,
  sub: SubCellTier,
  buddy: BuddyTier,
  large: LargeTier,
  budget: Budget,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
  /// Creates a context. If the OS refuses the reservation the context is
  /// permanently inert: every allocation returns null, destruction is valid.
  pub fn new(config: Config) -> Self {
    let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
    let pool = CellPool::new(id, config.reserve_size);
    if pool.is_none() {
      log::warn!("reservation of {} bytes refused; context {id} is inert", config.reserve_size);
    }
    Self {
      id,
      huge_pages_threshold: config.huge_pages_threshold,
      pool,
      sub: SubCellTier::new(),
      buddy: BuddyTier::new(),
      large: LargeTier::new(),
      budget: Budget::new(config.memory_budget),
    }
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` bytes aligned to `align` (a power of two). Returns
  /// null when `size` is zero or capacity is exhausted.
  pub fn alloc_bytes(&self, size: usize, tag: u8, align: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    if !align.is_power_of_two() {
      debug_assert!(false, "alignment must be a power of two");
      return null_mut();
    }
    let Some(pool) = self.pool.as_ref() else {
      return null_mut();
    };

    match route(size, align) {
      Route::Bin(bin) => self.alloc_sub(pool, bin, size, tag),
      Route::Cell => self.alloc_full_cell(pool, size, tag),
      Route::Buddy(order) => self.alloc_buddy(pool, order, size, align, tag),
      Route::Large => self.alloc_large_mapping(size, align, tag, true),
    }
  }

  /// Allocation with an explicit alignment, for alignments above the
  /// default 8.
  pub fn alloc_aligned(&self, size: usize, align: usize, tag: u8) -> *mut u8 {
    self.alloc_bytes(size, tag, align)
  }

  /// Maps a request straight from the OS regardless of size, bypassing the
  /// in-reservation tiers.
  pub fn alloc_large(&self, size: usize, tag: u8, try_huge_pages: bool) -> *mut u8 {
    if size == 0 || self.pool.is_none() {
      return null_mut();
    }
    self.alloc_large_mapping(size, 8, tag, try_huge_pages)
  }

  /// Allocates one whole cell. The returned pointer is the cell base, cell
  /// aligned; the payload starts at [`cell_payload_offset`](Self::cell_payload_offset).
  pub fn alloc_cell(&self, tag: u8) -> *mut u8 {
    let Some(pool) = self.pool.as_ref() else {
      return null_mut();
    };
    if !self.charge(CELL_SIZE, CELL_SIZE) {
      return null_mut();
    }
    let cell = pool.alloc_cell(tag);
    if cell.is_null() {
      self.budget.uncharge(CELL_SIZE);
    }
    cell
  }

  /// Byte offset of the usable payload inside a cell from [`alloc_cell`](Self::alloc_cell).
  pub const fn cell_payload_offset(&self) -> usize {
    CELL_PAYLOAD_OFFSET
  }

  fn alloc_sub(&self, pool: &CellPool, bin: usize, requested: usize, tag: u8) -> *mut u8 {
    let native = SIZE_CLASSES[bin];
    if !self.charge(native, requested) {
      return null_mut();
    }

    if bin < TLS_HOT_BINS
      && let Some(Some(block)) = tls::with_caches(self.id, |c| c.bin_pop(bin))
    {
      self.sub.note_alloc(bin);
      return block as *mut u8;
    }

    let ptr = self.sub.alloc(pool, bin, tag);
    if ptr.is_null() {
      self.budget.uncharge(native);
    }
    ptr
  }

  fn alloc_full_cell(&self, pool: &CellPool, requested: usize, tag: u8) -> *mut u8 {
    if !self.charge(CELL_SIZE, requested) {
      return null_mut();
    }
    let cell = pool.alloc_cell(tag);
    if cell.is_null() {
      self.budget.uncharge(CELL_SIZE);
      return null_mut();
    }
    unsafe { cell.add(CELL_PAYLOAD_OFFSET) }
  }

  fn alloc_buddy(&self, pool: &CellPool, order: u8, requested: usize, align: usize, tag: u8) -> *mut u8 {
    let native = 1usize << order;
    if !self.charge(native, requested) {
      return null_mut();
    }
    let ptr = self.buddy.alloc(pool, order, align, tag);
    if ptr.is_null() {
      self.budget.uncharge(native);
    }
    ptr
  }

  fn alloc_large_mapping(&self, size: usize, align: usize, tag: u8, try_huge: bool) -> *mut u8 {
    let huge =
      try_huge && self.huge_pages_threshold != 0 && size >= self.huge_pages_threshold;
    let Some(native) = large::native_len(size, align, huge) else {
      return null_mut();
    };
    if !self.charge(native, size) {
      return null_mut();
    }
    let ptr = self.large.alloc(size, align, tag, huge, native);
    if ptr.is_null() {
      self.budget.uncharge(native);
    }
    ptr
  }

  // ===========================================================================
  // Release
  // ===========================================================================

  /// Releases a pointer to its owning tier. Null is a no-op.
  ///
  /// # Safety
  /// `ptr` must be null or a live pointer obtained from this context.
  pub unsafe fn free_bytes(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let Some(pool) = self.pool.as_ref() else {
      return;
    };

    if pool.contains(ptr) {
      if !pool.is_carved(ptr) {
        debug_assert!(false, "pointer beyond the carved range");
        return;
      }
      if pool.superblock_kind(ptr) == SB_BUDDY {
        let native = unsafe { self.buddy.free(ptr) };
        self.budget.uncharge(native);
        return;
      }

      let header = header_of(ptr);
      unsafe {
        debug_assert_eq!((*header).magic, CELL_MAGIC_LIVE, "freed or foreign cell");
        match (*header).size_class {
          SIZE_CLASS_FULL_CELL => {
            self.budget.uncharge(CELL_SIZE);
            pool.free_cell(header as *mut u8);
          }
          class if (class as usize) < NUM_SIZE_BINS => {
            self.free_sub(pool, ptr, class as usize);
          }
          _ => debug_assert!(false, "double free"),
        }
      }
      return;
    }

    match self.large.free(ptr) {
      Some(native) => self.budget.uncharge(native),
      None => debug_assert!(false, "foreign pointer"),
    }
  }

  unsafe fn free_sub(&self, pool: &CellPool, ptr: *mut u8, bin: usize) {
    self.sub.note_free(bin);
    self.budget.uncharge(SIZE_CLASSES[bin]);

    if bin < TLS_HOT_BINS {
      let cached = tls::with_caches(self.id, |c| c.bin_push(bin, ptr as *mut _));
      if cached == Some(true) {
        return;
      }
    }
    unsafe { self.sub.release(pool, ptr, header_of(ptr)) };
  }

  /// Returns a whole cell obtained from [`alloc_cell`](Self::alloc_cell).
  ///
  /// # Safety
  /// `cell` must be null or a live cell pointer from this context.
  pub unsafe fn free_cell(&self, cell: *mut u8) {
    if cell.is_null() {
      return;
    }
    let Some(pool) = self.pool.as_ref() else {
      return;
    };
    debug_assert!(pool.contains(cell));
    debug_assert_eq!(
      unsafe { (*(cell as *mut crate::cell::CellHeader)).size_class },
      SIZE_CLASS_FULL_CELL,
      "free_cell on a cell owned by a size-class bin"
    );
    self.budget.uncharge(CELL_SIZE);
    pool.free_cell(cell);
  }

  /// Frees a batch of same-class sub-cell pointers under a single bin lock.
  /// Null entries are skipped.
  ///
  /// # Safety
  /// Every non-null entry must be a live sub-cell pointer from this context,
  /// and all of them must share one size class.
  pub unsafe fn free_batch(&self, ptrs: &[*mut u8]) {
    let Some(pool) = self.pool.as_ref() else {
      return;
    };
    let (bin, freed) = unsafe { self.sub.free_batch(pool, ptrs) };
    if freed > 0 {
      self.budget.uncharge(SIZE_CLASSES[bin] * freed as usize);
    }
  }

  // ===========================================================================
  // Realloc
  // ===========================================================================

  /// Resizes an allocation, moving it between tiers when the new size calls
  /// for it. The preserved prefix is `min(old payload, new_size)` bytes.
  ///
  /// # Safety
  /// `ptr` must be null or a live pointer obtained from this context.
  pub unsafe fn realloc_bytes(&self, ptr: *mut u8, new_size: usize, tag: u8) -> *mut u8 {
    if ptr.is_null() {
      return self.alloc_bytes(new_size, tag, 8);
    }
    if new_size == 0 {
      unsafe { self.free_bytes(ptr) };
      return null_mut();
    }
    let Some(pool) = self.pool.as_ref() else {
      return null_mut();
    };

    let new_route = route(new_size, 8);

    // Tier-local fast paths, and the true old payload size for the copy.
    let old_payload = if pool.contains(ptr) {
      if !pool.is_carved(ptr) {
        debug_assert!(false, "pointer beyond the carved range");
        return null_mut();
      }
      if pool.superblock_kind(ptr) == SB_BUDDY {
        if matches!(new_route, Route::Buddy(_)) {
          if unsafe { buddy::fits_in_place(ptr, new_size) } {
            return ptr;
          }
          // One buddy merge may save the move; charge for the absorbed half
          // up front and roll back if the buddy is busy.
          let delta = unsafe { buddy::block_size_of(ptr) };
          if self.budget.try_charge_quiet(delta) {
            if unsafe { self.buddy.try_merge_grow(ptr, new_size) } {
              return ptr;
            }
            self.budget.uncharge(delta);
          }
        }
        unsafe { buddy::usable_size(ptr) }
      } else {
        let header = header_of(ptr);
        let class = unsafe { (*header).size_class };
        if class == SIZE_CLASS_FULL_CELL {
          let payload = CELL_SIZE - (ptr as usize - header as usize);
          if new_route == Route::Cell && new_size <= payload {
            return ptr;
          }
          payload
        } else {
          let bin = class as usize;
          debug_assert!(bin < NUM_SIZE_BINS, "realloc of a freed pointer");
          if new_route == Route::Bin(bin) {
            return ptr;
          }
          SIZE_CLASSES[bin]
        }
      }
    } else if let Some((user_size, _cap)) = self.large.lookup(ptr) {
      if new_route == Route::Large && self.large.try_resize(ptr, new_size) {
        return ptr;
      }
      user_size
    } else {
      debug_assert!(false, "foreign pointer");
      return null_mut();
    };

    let new_ptr = self.alloc_bytes(new_size, tag, 8);
    if new_ptr.is_null() {
      return null_mut();
    }
    unsafe {
      core::ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(new_size));
      self.free_bytes(ptr);
    }
    new_ptr
  }

  // ===========================================================================
  // Introspection and maintenance
  // ===========================================================================

  /// Whether `ptr` lies inside this context's reservation. Large mappings
  /// live outside and are not covered.
  pub fn contains(&self, ptr: *const u8) -> bool {
    self.pool.as_ref().is_some_and(|p| p.contains(ptr))
  }

  /// Usable bytes behind a live pointer, or 0 for null and unknown pointers.
  ///
  /// # Safety
  /// `ptr` must be null or a live pointer obtained from this context.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    let Some(pool) = self.pool.as_ref() else {
      return 0;
    };

    if pool.contains(ptr) {
      if !pool.is_carved(ptr) {
        return 0;
      }
      if pool.superblock_kind(ptr) == SB_BUDDY {
        return unsafe { buddy::usable_size(ptr) };
      }
      let header = header_of(ptr);
      unsafe {
        match (*header).size_class {
          SIZE_CLASS_FULL_CELL => CELL_SIZE - (ptr as usize - header as usize),
          class if (class as usize) < NUM_SIZE_BINS => SIZE_CLASSES[class as usize],
          _ => 0,
        }
      }
    } else {
      self.large.lookup(ptr).map(|(_, cap)| cap).unwrap_or(0)
    }
  }

  /// Statistics snapshot for one size-class bin.
  pub fn bin_stats(&self, bin: usize) -> BinStats {
    assert!(bin < NUM_SIZE_BINS);
    self.sub.stats(bin)
  }

  /// Releases the physical pages behind currently-free cells back to the OS.
  /// Virtual addresses are preserved. Returns the bytes released.
  pub fn decommit_unused(&self) -> usize {
    self.pool.as_ref().map(|p| p.decommit_unused()).unwrap_or(0)
  }

  /// Bytes of physical memory this context currently has committed.
  pub fn committed_bytes(&self) -> usize {
    self.pool.as_ref().map(|p| p.committed_bytes()).unwrap_or(0) + self.large.bytes()
  }

  /// Drains this thread's block and cell caches back through the locked
  /// paths and unbinds the thread from this context. Must be called on every
  /// thread that used the context before that thread exits; otherwise the
  /// cached blocks stay unreachable until the context is dropped.
  pub fn flush_tls_bin_caches(&self) {
    let Some(pool) = self.pool.as_ref() else {
      return;
    };
    tls::with_caches(self.id, |caches| {
      for bin in 0..TLS_HOT_BINS {
        while let Some(block) = caches.bin_pop(bin) {
          let ptr = block as *mut u8;
          unsafe { self.sub.release(pool, ptr, header_of(ptr)) };
        }
      }
      while let Some(cell) = caches.cell_pop() {
        pool.flush_cell(cell);
      }
      caches.unbind();
    });
  }

  // ===========================================================================
  // Budget
  // ===========================================================================

  /// Sets the soft cap on outstanding tier-native bytes. 0 = unlimited.
  pub fn set_budget(&self, limit: usize) {
    self.budget.limit.store(limit, Ordering::Relaxed);
  }

  pub fn get_budget(&self) -> usize {
    self.budget.limit.load(Ordering::Relaxed)
  }

  /// Outstanding tier-native bytes. Returns to zero once every allocation
  /// has been freed, regardless of tier mix.
  pub fn get_budget_current(&self) -> usize {
    self.budget.current.load(Ordering::Relaxed)
  }

  /// Installs the callback invoked when an allocation is refused over
  /// budget.
  pub fn set_budget_callback(
    &self,
    callback: impl Fn(usize, usize, usize) + Send + Sync + 'static,
  ) {
    *self.budget.callback.lock() = Some(Box::new(callback));
  }

  fn charge(&self, native: usize, requested: usize) -> bool {
    match self.budget.charge(native) {
      Ok(()) => true,
      Err((limit, current)) => {
        log::debug!("allocation of {requested} bytes refused: budget {limit}, current {current}");
        if let Some(callback) = self.budget.callback.lock().as_ref() {
          callback(requested, limit, current);
        }
        false
      }
    }
  }
}

impl Default for Context {
  fn default() -> Self {
    Self::new(Config::default())
  }
}

impl core::fmt::Debug for Context {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Context")
      .field("id", &self.id)
      .field("inert", &self.pool.is_none())
      .field("committed_bytes", &self.committed_bytes())
      .field("budget", &self.get_budget())
      .finish()
  }
}
