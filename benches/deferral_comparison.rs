use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tree_rcu::Rcu;

// Benchmark 1: Single-threaded read-side critical section overhead
fn bench_read_lock(c: &mut Criterion) {
    c.bench_function("tree_rcu_read_lock", |b| {
        let rcu = Rcu::builder()
            .processors(1)
            .spawn_workers(false)
            .build()
            .unwrap();
        let p0 = rcu.attach(0).unwrap();

        b.iter(|| {
            let _guard = p0.read_lock();
            black_box(());
        });
    });

    c.bench_function("crossbeam_epoch_pin", |b| {
        b.iter(|| {
            let _guard = crossbeam_epoch::pin();
            black_box(());
        });
    });
}

// Benchmark 2: Deferring a reclamation callback
fn bench_defer(c: &mut Criterion) {
    let mut group = c.benchmark_group("defer");

    for batch in [1, 64, 1024].iter() {
        group.bench_with_input(BenchmarkId::new("tree_rcu", batch), batch, |b, &batch| {
            let rcu = Rcu::new(2).unwrap();
            let p0 = rcu.attach(0).unwrap();

            b.iter(|| {
                for i in 0..batch {
                    let value = Box::new(i);
                    p0.call_rcu(move || drop(black_box(value)));
                }
                p0.quiescent_state();
            });
            p0.barrier();
        });

        group.bench_with_input(
            BenchmarkId::new("crossbeam_epoch", batch),
            batch,
            |b, &batch| {
                b.iter(|| {
                    let guard = crossbeam_epoch::pin();
                    for i in 0..batch {
                        let value = Box::new(i);
                        guard.defer(move || drop(black_box(value)));
                    }
                    guard.flush();
                });
            },
        );
    }

    group.finish();
}

// Benchmark 3: Concurrent read-heavy workload
fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_reads");
    group.sample_size(10);

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("tree_rcu", num_threads),
            num_threads,
            |b, &num_threads| {
                let rcu = Rcu::new(num_threads).unwrap();

                b.iter(|| {
                    let counter = Arc::new(AtomicUsize::new(0));
                    let handles: Vec<_> = (0..num_threads)
                        .map(|id| {
                            let rcu = rcu.clone();
                            let c = counter.clone();

                            thread::spawn(move || {
                                let p = rcu.attach(id).unwrap();
                                for n in 0..1000 {
                                    {
                                        let _guard = p.read_lock();
                                        c.fetch_add(1, Ordering::Relaxed);
                                    }
                                    if n % 100 == 0 {
                                        p.quiescent_state();
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("crossbeam_epoch", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let counter = Arc::new(AtomicUsize::new(0));
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let c = counter.clone();

                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    let _guard = crossbeam_epoch::pin();
                                    c.fetch_add(1, Ordering::Relaxed);
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_read_lock, bench_defer, bench_concurrent_reads);
criterion_main!(benches);
