use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use arw::rollsum::Rollsum;

fn bench_update(c: &mut Criterion) {
    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();

    let mut group = c.benchmark_group("rollsum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("update_64k", |b| {
        b.iter(|| {
            let mut rs = Rollsum::new();
            rs.update(black_box(&data));
            black_box(rs.digest())
        })
    });
    group.finish();
}

fn bench_rotate(c: &mut Criterion) {
    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 17 % 253) as u8).collect();
    let window = 1000;

    let mut group = c.benchmark_group("rollsum");
    group.throughput(Throughput::Bytes((data.len() - window) as u64));
    group.bench_function("rotate_sweep_64k", |b| {
        b.iter(|| {
            let mut rs = Rollsum::new();
            rs.update(&data[..window]);
            let mut hits = 0u32;
            for i in window..data.len() {
                rs.rotate(data[i - window], data[i]);
                if rs.digest() & 0xFFF == 0 {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_update, bench_rotate);
criterion_main!(benches);
