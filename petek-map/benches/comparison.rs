//! Comparison benchmarks: petek-map vs dashmap.
//!
//! dashmap is sharded and lock-based; petek-map is a single lock-free list
//! behind a bucket directory. Read-heavy multi-threaded workloads are where
//! the difference shows.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

const SIZES: &[usize] = &[1_000, 10_000, 100_000];
const THREAD_COUNTS: &[usize] = &[2, 4, 8];

fn bench_single_thread_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_insert");

    for &size in SIZES {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("petek-map", size), &size, |b, &size| {
            b.iter(|| {
                let map = petek_map::SplitOrderedMap::new();
                for i in 0..size as u64 {
                    map.insert(black_box(i), black_box(i * 2));
                }
                map
            });
        });

        group.bench_with_input(BenchmarkId::new("dashmap", size), &size, |b, &size| {
            b.iter(|| {
                let map = dashmap::DashMap::new();
                for i in 0..size as u64 {
                    map.insert(black_box(i), black_box(i * 2));
                }
                map
            });
        });
    }
    group.finish();
}

fn bench_concurrent_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_get");
    const SIZE: usize = 100_000;
    group.throughput(Throughput::Elements(SIZE as u64));

    let petek = Arc::new(petek_map::SplitOrderedMap::with_capacity(SIZE));
    let dash = Arc::new(dashmap::DashMap::new());
    for i in 0..SIZE as u64 {
        petek.insert(i, i);
        dash.insert(i, i);
    }

    for &threads in THREAD_COUNTS {
        group.bench_with_input(
            BenchmarkId::new("petek-map", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|tid| {
                            let map = petek.clone();
                            thread::spawn(move || {
                                let per = SIZE / threads;
                                let base = (tid * per) as u64;
                                for i in 0..per as u64 {
                                    black_box(map.get(&(base + i)));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("dashmap", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|tid| {
                            let map = dash.clone();
                            thread::spawn(move || {
                                let per = SIZE / threads;
                                let base = (tid * per) as u64;
                                for i in 0..per as u64 {
                                    black_box(map.get(&(base + i)).map(|v| *v));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread_insert, bench_concurrent_get);
criterion_main!(benches);
