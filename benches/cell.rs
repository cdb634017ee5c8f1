// Transactional cell hot-path benchmark.

use criterion::{criterion_group, criterion_main, Criterion};
use mvcc_stm::{atomically, TCell};

fn bench_read(c: &mut Criterion) {
    let cell = TCell::new(8usize);
    c.bench_function("cell_read", |b| {
        b.iter(|| atomically(|| cell.read()).expect("transaction failed"));
    });
}

fn bench_write(c: &mut Criterion) {
    let cell = TCell::new(0usize);
    c.bench_function("cell_write", |b| {
        b.iter(|| atomically(|| cell.write(234)).expect("transaction failed"));
    });
}

fn bench_modify_contended(c: &mut Criterion) {
    let cell = TCell::new(0usize);
    c.bench_function("cell_modify", |b| {
        b.iter(|| atomically(|| cell.modify(|v| v + 1)).expect("transaction failed"));
    });
}

criterion_group!(benches, bench_read, bench_write, bench_modify_contended);
criterion_main!(benches);
