//! Budget enforcement. Charges and releases both use the tier-native size
//! (class size, whole cell, buddy block, mapping length), so the counter
//! returns to zero when everything is freed, whatever the tier mix.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cellar::{Config, Context};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn ctx_with_budget(budget: usize) -> Context {
  Context::new(Config {
    reserve_size: 128 * MB,
    memory_budget: budget,
    ..Config::default()
  })
}

#[test]
fn budget_enforcement() {
  let ctx = ctx_with_budget(1024);

  // 512 rounds to the 512-byte class.
  let p1 = ctx.alloc_bytes(512, 0, 8);
  assert!(!p1.is_null());

  // 400 also rounds to 512; exactly at the cap now.
  let p2 = ctx.alloc_bytes(400, 0, 8);
  assert!(!p2.is_null());
  assert_eq!(ctx.get_budget_current(), 1024);

  // One more 256-byte block would cross the cap.
  assert!(ctx.alloc_bytes(200, 0, 8).is_null());

  unsafe { ctx.free_bytes(p1) };
  let p4 = ctx.alloc_bytes(200, 0, 8);
  assert!(!p4.is_null());

  unsafe {
    ctx.free_bytes(p2);
    ctx.free_bytes(p4);
  }
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn budget_callback_reports_the_refusal() {
  let ctx = ctx_with_budget(512);

  let invoked = Arc::new(AtomicUsize::new(0));
  let seen_requested = Arc::new(AtomicUsize::new(0));
  let seen_budget = Arc::new(AtomicUsize::new(0));
  let seen_current = Arc::new(AtomicUsize::new(0));
  {
    let invoked = invoked.clone();
    let seen_requested = seen_requested.clone();
    let seen_budget = seen_budget.clone();
    let seen_current = seen_current.clone();
    ctx.set_budget_callback(move |requested, budget, current| {
      invoked.fetch_add(1, Ordering::Relaxed);
      seen_requested.store(requested, Ordering::Relaxed);
      seen_budget.store(budget, Ordering::Relaxed);
      seen_current.store(current, Ordering::Relaxed);
    });
  }

  let p1 = ctx.alloc_bytes(400, 0, 8);
  assert!(!p1.is_null());
  assert_eq!(invoked.load(Ordering::Relaxed), 0);

  assert!(ctx.alloc_bytes(200, 0, 8).is_null());
  assert_eq!(invoked.load(Ordering::Relaxed), 1);
  assert_eq!(seen_requested.load(Ordering::Relaxed), 200);
  assert_eq!(seen_budget.load(Ordering::Relaxed), 512);
  assert_eq!(seen_current.load(Ordering::Relaxed), 512);

  unsafe { ctx.free_bytes(p1) };
}

#[test]
fn zero_budget_is_unlimited() {
  let ctx = ctx_with_budget(0);
  let ptrs: Vec<_> = (0..100).map(|_| ctx.alloc_bytes(1024, 0, 8)).collect();
  assert!(ptrs.iter().all(|p| !p.is_null()));
  for p in ptrs {
    unsafe { ctx.free_bytes(p) };
  }
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn budget_counts_buddy_blocks_whole() {
  // A 512KB request takes a 1MB buddy block once the prefix is added, and
  // the budget sees the full block.
  let ctx = ctx_with_budget(2 * MB);

  let p1 = ctx.alloc_bytes(512 * KB, 0, 8);
  assert!(!p1.is_null());
  assert_eq!(ctx.get_budget_current(), MB);

  let p2 = ctx.alloc_bytes(512 * KB, 0, 8);
  assert!(!p2.is_null());
  assert_eq!(ctx.get_budget_current(), 2 * MB);

  assert!(ctx.alloc_bytes(512 * KB, 0, 8).is_null());

  unsafe {
    ctx.free_bytes(p1);
    ctx.free_bytes(p2);
  }
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn budget_can_be_raised_at_runtime() {
  let ctx = ctx_with_budget(512);

  let p1 = ctx.alloc_bytes(400, 0, 8);
  assert!(!p1.is_null());
  assert!(ctx.alloc_bytes(200, 0, 8).is_null());

  ctx.set_budget(2048);
  assert_eq!(ctx.get_budget(), 2048);

  let p3 = ctx.alloc_bytes(200, 0, 8);
  assert!(!p3.is_null());

  unsafe {
    ctx.free_bytes(p1);
    ctx.free_bytes(p3);
  }
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn accounting_has_no_drift() {
  let ctx = ctx_with_budget(10 * MB);

  // 20-byte requests charge their 32-byte class, and frees release the same
  // amount; anything else would drift the counter cycle by cycle.
  let ptrs: Vec<_> = (0..100).map(|_| ctx.alloc_bytes(20, 0, 8)).collect();
  assert!(ptrs.iter().all(|p| !p.is_null()));
  assert_eq!(ctx.get_budget_current(), 100 * 32);

  for p in ptrs {
    unsafe { ctx.free_bytes(p) };
  }
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn accounting_is_symmetric_across_tiers() {
  let ctx = ctx_with_budget(0);

  let small = ctx.alloc_bytes(100, 0, 8);
  let cell = ctx.alloc_bytes(10 * KB, 0, 8);
  let buddy = ctx.alloc_bytes(48 * KB, 0, 8);
  let large = ctx.alloc_bytes(3 * MB, 0, 8);
  assert!(ctx.get_budget_current() > 0);

  unsafe {
    ctx.free_bytes(small);
    ctx.free_bytes(cell);
    ctx.free_bytes(buddy);
    ctx.free_bytes(large);
  }
  assert_eq!(ctx.get_budget_current(), 0);

  // Realloc cycles settle back to zero as well.
  let p = ctx.alloc_bytes(40 * KB, 0, 8);
  let p = unsafe { ctx.realloc_bytes(p, 4 * MB, 0) };
  let p = unsafe { ctx.realloc_bytes(p, 64, 0) };
  unsafe { ctx.free_bytes(p) };
  assert_eq!(ctx.get_budget_current(), 0);
}
