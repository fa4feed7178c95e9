use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ipscore_core::ScoreEngine;

fn populated_engine() -> ScoreEngine {
    let engine = ScoreEngine::new().unwrap();
    // 64k scores spread over 256 /24 blocks
    for i in 0..65_536u32 {
        engine.set(0x0A000000 + i, ((i % 1000) + 1) as i16);
    }
    engine
}

fn bench_get(c: &mut Criterion) {
    let engine = populated_engine();
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(2654435761); // Weyl-ish stride over the populated range
            black_box(engine.get(0x0A000000 + (i & 0xFFFF)))
        })
    });

    group.bench_function("miss_bitmap_rejected", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(2654435761);
            black_box(engine.get(0xC0000000 | (i & 0x00FFFFFF)))
        })
    });

    group.finish();
}

fn bench_writes(c: &mut Criterion) {
    let engine = populated_engine();
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_existing_block", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(2654435761);
            black_box(engine.set(0x0A000000 + (i & 0xFFFF), 77))
        })
    });

    group.bench_function("increment_existing_block", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(2654435761);
            black_box(engine.increment(0x0A000000 + (i & 0xFFFF), 1))
        })
    });

    group.finish();
}

fn bench_bulk(c: &mut Criterion) {
    let mut feed = Vec::new();
    for i in 0..100_000u32 {
        feed.extend_from_slice(
            format!(
                "10.{}.{}.{},+1\n",
                (i >> 16) & 0xFF,
                (i >> 8) & 0xFF,
                i & 0xFF
            )
            .as_bytes(),
        );
    }

    let mut group = c.benchmark_group("bulk");
    group.throughput(Throughput::Elements(100_000));
    group.sample_size(20);
    group.bench_function("load_buffer_100k", |b| {
        b.iter(|| {
            let engine = ScoreEngine::new().unwrap();
            black_box(engine.bulk_load_buffer(&feed))
        })
    });
    group.finish();
}

fn bench_decay(c: &mut Criterion) {
    let mut group = c.benchmark_group("decay");
    group.sample_size(20);
    group.bench_function("sweep_64k_scores", |b| {
        b.iter_with_setup(populated_engine, |engine| black_box(engine.decay(0.9, 0)))
    });
    group.finish();
}

criterion_group!(benches, bench_get, bench_writes, bench_bulk, bench_decay);
criterion_main!(benches);
