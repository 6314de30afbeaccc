use criterion::{black_box, criterion_group, criterion_main, Criterion};

use hzidx::space::PointN;
use hzidx::Bitmask;

fn bench_hz(c: &mut Criterion) {
    let bitmask = Bitmask::parse("V012012012012012012012012").unwrap();
    let dims = bitmask.pow2_dims();
    let points: Vec<PointN> = (0..4096)
        .map(|i| {
            PointN::from_slice(&[
                (i * 37) % dims[0],
                (i * 101) % dims[1],
                (i * 13) % dims[2],
            ])
        })
        .collect();
    let addresses: Vec<u64> = points.iter().map(|p| bitmask.p_to_hz(p)).collect();

    c.bench_function("p_to_hz 4096 points", |b| {
        b.iter(|| {
            for p in &points {
                black_box(bitmask.p_to_hz(black_box(p)));
            }
        })
    });

    c.bench_function("hz_to_p 4096 addresses", |b| {
        b.iter(|| {
            for a in &addresses {
                black_box(bitmask.hz_to_p(black_box(*a)));
            }
        })
    });

    c.bench_function("block_samples over a level", |b| {
        b.iter(|| {
            for k in 1..256u64 {
                black_box(bitmask.block_samples(black_box(k), 8));
            }
        })
    });
}

criterion_group!(benches, bench_hz);
criterion_main!(benches);
