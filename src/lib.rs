//! Multi-tier instance allocator.
//!
//! A [`Context`] reserves one large virtual address range up front and serves
//! every request out of it, committing physical memory superblock by
//! superblock as tiers grow:
//!
//! - requests up to 8KB go to ten size-class bins backed by dedicated 16KB
//!   cells, with intrusive free lists stored in the freed memory itself;
//! - requests that fit a whole cell take one from the cell pool's lock-free
//!   free stack;
//! - 32KB to 2MB requests go to a binary buddy allocator over 2MB arenas;
//! - anything larger maps directly from the OS and is tracked in a registry.
//!
//! On release the tier is recovered from the pointer alone: in-reservation
//! pointers classify through a superblock kind table and a header found by
//! masking the address to the cell boundary, everything else through the
//! registry. The hottest size classes also keep per-thread caches, so the
//! common alloc/free cycle takes no lock at all; see
//! [`Context::flush_tls_bin_caches`] for the one obligation that comes with
//! them.
//!
//! ```
//! use cellar::{Config, Context};
//!
//! let ctx = Context::new(Config {
//!   reserve_size: 64 * 1024 * 1024,
//!   ..Config::default()
//! });
//!
//! let p = ctx.alloc_bytes(100, 1, 8);
//! assert!(!p.is_null());
//! unsafe {
//!   p.write_bytes(0x2A, 100);
//!   ctx.free_bytes(p);
//! }
//! ```
//!
//! Capacity exhaustion (reservation full, budget crossed, OS refusal) is
//! reported as a null pointer, never a panic. Misuse (double free, foreign
//! pointers, use after free) is undefined behavior in release builds and
//! caught best-effort by magic words and poisoning in debug builds.

mod arena;
mod buddy;
mod cell;
mod config;
mod context;
mod large;
mod object_pool;
mod pool;
mod sub_cell;
mod tls;
mod vm;

pub use arena::{Arena, ArenaMark, ArenaScope};
pub use config::Config;
pub use context::{BinStats, BudgetCallback, Context};
pub use object_pool::Pool;
