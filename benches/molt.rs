use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use molt::HashTable;
use std::sync::Arc;

const ITER: u64 = 32 * 1024;

fn task_insert(threads: usize) -> Arc<HashTable> {
    let table = Arc::new(HashTable::with_capacity(ITER as usize * 2));
    let per_thread = ITER / threads as u64;

    let mut spawned = Vec::new();
    for t in 0..threads as u64 {
        let table = table.clone();
        spawned.push(std::thread::spawn(move || {
            let handle = table.register_thread();
            let start = t * per_thread;
            for i in start..start + per_thread {
                table.add(i, i + 7, &handle);
            }
        }));
    }
    for t in spawned {
        t.join().unwrap();
    }
    table
}

fn insert_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    for threads in [1, 2, 4, num_cpus::get()] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| b.iter(|| task_insert(threads)),
        );
    }
    group.finish();
}

fn get_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_u64_u64");
    group.throughput(Throughput::Elements(ITER));

    let table = task_insert(num_cpus::get());
    for threads in [1, 2, 4, num_cpus::get()] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let per_thread = ITER / threads as u64;
                    let mut spawned = Vec::new();
                    for t in 0..threads as u64 {
                        let table = table.clone();
                        spawned.push(std::thread::spawn(move || {
                            let handle = table.register_thread();
                            let start = t * per_thread;
                            for i in start..start + per_thread {
                                black_box(table.lookup(i, &handle));
                            }
                        }));
                    }
                    for t in spawned {
                        t.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, insert_u64_u64, get_u64_u64);
criterion_main!(benches);
