//! Bump-allocation facade over a context.
//!
//! An arena grabs whole cells and hands out 16-byte-aligned slices of them
//! with nothing but a cursor bump; everything is released at once on `reset`
//! or drop. Requests too large for a cell fall through to the context and
//! are tracked so they are released with the rest.

use core::ptr::null_mut;

use crate::cell::align_up;
use crate::config::CELL_SIZE;
use crate::context::Context;

const ARENA_ALIGN: usize = 16;

/// Rewind point for [`Arena::release_to`].
#[derive(Clone, Copy, Debug)]
pub struct ArenaMark {
  cells: usize,
  cursor: usize,
  overflow: usize,
}

pub struct Arena<'c> {
  ctx: &'c Context,
  tag: u8,
  cells: Vec<*mut u8>,
  /// Bump offset within the last cell.
  cursor: usize,
  overflow: Vec<*mut u8>,
}

impl<'c> Arena<'c> {
  pub fn new(ctx: &'c Context, tag: u8) -> Self {
    Self {
      ctx,
      tag,
      cells: Vec::new(),
      cursor: CELL_SIZE,
      overflow: Vec::new(),
    }
  }

  /// Allocates `size` bytes, 16-byte aligned. Null on exhaustion.
  pub fn alloc(&mut self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let size = align_up(size, ARENA_ALIGN);

    if size > CELL_SIZE - self.ctx.cell_payload_offset() {
      let ptr = self.ctx.alloc_bytes(size, self.tag, ARENA_ALIGN);
      if !ptr.is_null() {
        self.overflow.push(ptr);
      }
      return ptr;
    }

    if self.cursor + size > CELL_SIZE {
      let cell = self.ctx.alloc_cell(self.tag);
      if cell.is_null() {
        return null_mut();
      }
      self.cells.push(cell);
      self.cursor = self.ctx.cell_payload_offset();
    }

    let cell = *self.cells.last().unwrap();
    let ptr = unsafe { cell.add(self.cursor) };
    self.cursor += size;
    ptr
  }

  /// Releases everything allocated from this arena.
  pub fn reset(&mut self) {
    for cell in self.cells.drain(..) {
      unsafe { self.ctx.free_cell(cell) };
    }
    for ptr in self.overflow.drain(..) {
      unsafe { self.ctx.free_bytes(ptr) };
    }
    self.cursor = CELL_SIZE;
  }

  /// Captures the current high-water mark.
  pub fn mark(&self) -> ArenaMark {
    ArenaMark {
      cells: self.cells.len(),
      cursor: self.cursor,
      overflow: self.overflow.len(),
    }
  }

  /// Rewinds to a previously captured mark, releasing everything allocated
  /// since.
  pub fn release_to(&mut self, mark: ArenaMark) {
    for cell in self.cells.drain(mark.cells..) {
      unsafe { self.ctx.free_cell(cell) };
    }
    for ptr in self.overflow.drain(mark.overflow..) {
      unsafe { self.ctx.free_bytes(ptr) };
    }
    self.cursor = mark.cursor;
  }

  /// Scoped view: everything allocated inside the guard is released when it
  /// drops.
  pub fn scope(&mut self) -> ArenaScope<'_, 'c> {
    let mark = self.mark();
    ArenaScope { arena: self, mark }
  }
}

impl Drop for Arena<'_> {
  fn drop(&mut self) {
    self.reset();
  }
}

/// Guard returned by [`Arena::scope`].
pub struct ArenaScope<'a, 'c> {
  arena: &'a mut Arena<'c>,
  mark: ArenaMark,
}

impl<'c> core::ops::Deref for ArenaScope<'_, 'c> {
  type Target = Arena<'c>;
  fn deref(&self) -> &Self::Target {
    self.arena
  }
}

impl core::ops::DerefMut for ArenaScope<'_, '_> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.arena
  }
}

impl Drop for ArenaScope<'_, '_> {
  fn drop(&mut self) {
    self.arena.release_to(self.mark);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn small_ctx() -> Context {
    Context::new(Config {
      reserve_size: 64 * 1024 * 1024,
      ..Config::default()
    })
  }

  #[test]
  fn bump_within_one_cell() {
    let ctx = small_ctx();
    let mut arena = Arena::new(&ctx, 1);

    let a = arena.alloc(64);
    let b = arena.alloc(10);
    assert!(!a.is_null() && !b.is_null());
    assert_eq!(b as usize - a as usize, 64);
    assert_eq!(b as usize % 16, 0);

    arena.reset();
    assert_eq!(ctx.get_budget_current(), 0);
  }

  #[test]
  fn spills_to_new_cells_and_overflow() {
    let ctx = small_ctx();
    let mut arena = Arena::new(&ctx, 0);

    for _ in 0..1000 {
      assert!(!arena.alloc(64).is_null());
    }
    // Larger than a cell: served by the context, freed by the arena.
    let big = arena.alloc(100 * 1024);
    assert!(!big.is_null());

    drop(arena);
    assert_eq!(ctx.get_budget_current(), 0);
  }

  #[test]
  fn scope_rewinds() {
    let ctx = small_ctx();
    let mut arena = Arena::new(&ctx, 0);
    let before = arena.alloc(32);
    {
      let mut scope = arena.scope();
      for _ in 0..500 {
        scope.alloc(128);
      }
    }
    // The next allocation lands right after the pre-scope state.
    let after = arena.alloc(32);
    assert_eq!(after as usize, before as usize + 32);
  }
}
