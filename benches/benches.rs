use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hifitime::Duration;
use iq_slurper::{
    format::SampleFormat,
    loss::LossAccountant,
    radio::{DeviceStatus, ErrorCode},
    sim::DEFAULT_BUFFER_LEN,
};
use rand::prelude::*;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut iq = vec![0f32; 2 * DEFAULT_BUFFER_LEN];
    iq.iter_mut().for_each(|x| *x = rng.gen_range(-1.0..1.0));

    // Containers
    let mut c64 = vec![0u8; DEFAULT_BUFFER_LEN * SampleFormat::Cf32.element_size()];
    let mut i16s = vec![0u8; DEFAULT_BUFFER_LEN * SampleFormat::Ci16.element_size()];
    let mut scratch = Vec::with_capacity(2 * DEFAULT_BUFFER_LEN);

    c.bench_function("encode cf32 block", |b| {
        b.iter(|| {
            SampleFormat::Cf32.encode(black_box(&iq), black_box(&mut c64), &mut scratch)
        })
    });

    c.bench_function("encode ci16 block", |b| {
        b.iter(|| {
            SampleFormat::Ci16.encode(black_box(&iq), black_box(&mut i16s), &mut scratch)
        })
    });

    let mut accountant = LossAccountant::new(56e6);
    let ok = DeviceStatus::ok(Duration::from_seconds(1.0));
    c.bench_function("accountant clean buffer", |b| {
        b.iter(|| accountant.observe(black_box(&ok)))
    });

    let overflow = DeviceStatus::with_error(ErrorCode::Overflow, Duration::from_seconds(1.0));
    let resumed = DeviceStatus::ok(Duration::from_seconds(1.001));
    c.bench_function("accountant overflow episode", |b| {
        b.iter(|| {
            accountant.observe(black_box(&overflow));
            accountant.observe(black_box(&resumed))
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
