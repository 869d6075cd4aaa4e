use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spanpool::{Options, Scheduler, WorkerContext};

fn square(_ctx: &WorkerContext, items: &[u64]) -> Result<Vec<u64>, String> {
    Ok(items.iter().map(|x| x * x).collect())
}

fn bench_run_parallel(c: &mut Criterion) {
    let scheduler = Scheduler::builder()
        .with_max_workers(4)
        .build()
        .unwrap();

    let input: Vec<u64> = (0..100_000).collect();

    let mut group = c.benchmark_group("run_parallel");
    group.throughput(Throughput::Elements(input.len() as u64));
    for threads in [1usize, 2, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                scheduler
                    .run_parallel(input.clone(), square, Options::new().with_threads(threads))
                    .wait()
                    .unwrap()
            });
        });
    }
    group.finish();

    scheduler.shut_down().wait();
}

fn bench_many_small_tasks(c: &mut Criterion) {
    for persistent in [true, false] {
        let scheduler = Scheduler::builder()
            .with_max_workers(4)
            .with_persistent_workers(persistent)
            .build()
            .unwrap();

        let name = if persistent { "small_tasks_persistent" } else { "small_tasks_transient" };
        c.bench_function(name, |b| {
            b.iter(|| {
                let handles: Vec<_> = (0..32u64)
                    .map(|i| scheduler.run_parallel(vec![i; 16], square, Options::new().with_threads(2)))
                    .collect();

                for handle in handles {
                    handle.wait().unwrap();
                }
            });
        });

        scheduler.shut_down().wait();
    }
}

criterion_group!(benches, bench_run_parallel, bench_many_small_tasks);
criterion_main!(benches);
