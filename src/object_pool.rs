//! Typed object pool facade over a context.
//!
//! Slots for `T` all come from the same size class, which is what makes the
//! batched release on drop sound: `free_batch` requires a homogeneous batch.

use core::marker::PhantomData;

use crate::cell::size_class_for;
use crate::context::Context;

pub struct Pool<'c, T> {
  ctx: &'c Context,
  tag: u8,
  free: Vec<*mut T>,
  _marker: PhantomData<T>,
}

impl<'c, T> Pool<'c, T> {
  pub fn new(ctx: &'c Context, tag: u8) -> Self {
    debug_assert!(
      size_class_for(core::mem::size_of::<T>().max(1), core::mem::align_of::<T>()).is_some(),
      "Pool requires a sub-cell sized type"
    );
    Self {
      ctx,
      tag,
      free: Vec::new(),
      _marker: PhantomData,
    }
  }

  /// Uninitialized slot for one `T`, recycled from the pool when possible.
  /// Null on exhaustion.
  pub fn alloc(&mut self) -> *mut T {
    if let Some(slot) = self.free.pop() {
      return slot;
    }
    self
      .ctx
      .alloc_bytes(
        core::mem::size_of::<T>().max(1),
        self.tag,
        core::mem::align_of::<T>(),
      )
      .cast()
  }

  /// Returns a slot to the pool. The slot is recycled on a later [`alloc`](Self::alloc)
  /// and released to the context when the pool drops.
  ///
  /// # Safety
  /// `slot` must have come from this pool's [`alloc`](Self::alloc) and must not be used
  /// again.
  pub unsafe fn free(&mut self, slot: *mut T) {
    if !slot.is_null() {
      self.free.push(slot);
    }
  }

  /// Slots currently cached for reuse.
  pub fn cached(&self) -> usize {
    self.free.len()
  }

  /// Releases every cached slot back to the context in one batch.
  pub fn trim(&mut self) {
    if self.free.is_empty() {
      return;
    }
    let ptrs: Vec<*mut u8> = self.free.drain(..).map(|p| p as *mut u8).collect();
    unsafe { self.ctx.free_batch(&ptrs) };
  }
}

impl<T> Drop for Pool<'_, T> {
  fn drop(&mut self) {
    self.trim();
  }
}

// The pool itself holds no T values, only raw slots.
unsafe impl<T> Send for Pool<'_, T> {}
