use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;

use scalemap::Map;

const THREADS: &[usize] = &[1, 2, 4, 8];
const OPS_PER_THREAD: usize = 8_000;

// -----------------------------------------------------------------------------
// Unify APIs for Simplicity
// -----------------------------------------------------------------------------

trait Table: Send + Sync + 'static {
  fn new() -> Self;

  fn table_put(&self, key: u64, value: u64);

  fn table_get(&self, key: u64) -> Option<u64>;
}

impl Table for Map<u64, u64> {
  fn new() -> Self {
    Map::new()
  }

  fn table_put(&self, key: u64, value: u64) {
    self.put(key, value);
  }

  fn table_get(&self, key: u64) -> Option<u64> {
    self.get(&key)
  }
}

struct HashMapTable(Mutex<HashMap<u64, u64>>);

impl Table for HashMapTable {
  fn new() -> Self {
    Self(Mutex::new(HashMap::new()))
  }

  fn table_put(&self, key: u64, value: u64) {
    self.0.lock().unwrap().insert(key, value);
  }

  fn table_get(&self, key: u64) -> Option<u64> {
    self.0.lock().unwrap().get(&key).copied()
  }
}

// -----------------------------------------------------------------------------
// Workloads
// -----------------------------------------------------------------------------

/// `threads` workers each claim a disjoint key range and put every key in it.
fn run_put<T: Table>(threads: usize) {
  let table: Arc<T> = Arc::new(T::new());

  thread::scope(|scope| {
    for thread_id in 0..threads {
      let table = Arc::clone(&table);

      scope.spawn(move || {
        let base = (thread_id * OPS_PER_THREAD) as u64;
        for offset in 0..OPS_PER_THREAD as u64 {
          table.table_put(base + offset, offset);
        }
      });
    }
  });
}

/// Every key a `run_get` workload reads was put by thread 0 before timing
/// starts; the remaining `threads - 1` workers (if any) read the same hot
/// range concurrently, each taking its own disjoint slice of reads.
fn run_get<T: Table>(threads: usize) {
  let table: Arc<T> = Arc::new(T::new());
  for offset in 0..OPS_PER_THREAD as u64 {
    table.table_put(offset, offset);
  }

  thread::scope(|scope| {
    for _ in 0..threads.max(1) {
      let table = Arc::clone(&table);

      scope.spawn(move || {
        for offset in 0..OPS_PER_THREAD as u64 {
          let value = table.table_get(offset);
          assert_eq!(value, Some(offset));
        }
      });
    }
  });
}

// -----------------------------------------------------------------------------
// Benchmarks
// -----------------------------------------------------------------------------

fn bench_put(c: &mut Criterion) {
  let mut group = c.benchmark_group("put");

  for &threads in THREADS {
    group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));

    group.bench_with_input(BenchmarkId::new("scalemap", threads), &threads, |b, &threads| {
      b.iter(|| run_put::<Map<u64, u64>>(threads));
    });

    group.bench_with_input(BenchmarkId::new("mutex_hashmap", threads), &threads, |b, &threads| {
      b.iter(|| run_put::<HashMapTable>(threads));
    });
  }

  group.finish();
}

fn bench_get(c: &mut Criterion) {
  let mut group = c.benchmark_group("get");

  for &threads in THREADS {
    group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));

    group.bench_with_input(BenchmarkId::new("scalemap", threads), &threads, |b, &threads| {
      b.iter(|| run_get::<Map<u64, u64>>(threads));
    });

    group.bench_with_input(BenchmarkId::new("mutex_hashmap", threads), &threads, |b, &threads| {
      b.iter(|| run_get::<HashMapTable>(threads));
    });
  }

  group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
