use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use cellar::{Arena, Config, Context, Pool};

const OPS: u64 = 100_000;

/// cellar alloc/free throughput.
fn cellar_alloc_free(ctx: &Context, size: usize) {
  for _ in 0..OPS {
    let ptr = ctx.alloc_bytes(size, 0, 8);
    black_box(ptr);
    unsafe { ctx.free_bytes(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let ctx = Context::new(Config::default());
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 12 * 1024, 64 * 1024] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("cellar", size), &size, |b, &size| {
      b.iter(|| cellar_alloc_free(&ctx, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
  ctx.flush_tls_bin_caches();
}

fn benchmark_arena(c: &mut Criterion) {
  let ctx = Context::new(Config::default());
  let mut group = c.benchmark_group("arena");
  group.throughput(Throughput::Elements(1000));

  group.bench_function("linear_64b_x1000", |b| {
    b.iter(|| {
      let mut arena = Arena::new(&ctx, 0);
      for _ in 0..1000 {
        black_box(arena.alloc(64));
      }
    })
  });

  group.bench_function("reset_reuse_64b_x1000", |b| {
    let mut arena = Arena::new(&ctx, 0);
    b.iter(|| {
      for _ in 0..1000 {
        black_box(arena.alloc(64));
      }
      arena.reset();
    })
  });

  group.finish();
}

fn benchmark_object_pool(c: &mut Criterion) {
  let ctx = Context::new(Config::default());
  let mut group = c.benchmark_group("object_pool");
  group.throughput(Throughput::Elements(OPS));

  group.bench_function("alloc_free_u64", |b| {
    let mut pool: Pool<'_, u64> = Pool::new(&ctx, 0);
    b.iter(|| {
      for _ in 0..OPS {
        let slot = pool.alloc();
        black_box(slot);
        unsafe { pool.free(slot) };
      }
    })
  });

  group.finish();
}

criterion_group!(
  benches,
  benchmark_alloc_throughput,
  benchmark_arena,
  benchmark_object_pool
);
criterion_main!(benches);
