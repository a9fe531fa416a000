//! Loss detector and data-path micro-benchmarks
//!
//! ```bash
//! cargo bench --bench loss_detector
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pubsub_throughput::schema::{PayloadSchema, StaticSchema};
use pubsub_throughput::transport::Delivery;
use pubsub_throughput::{LossDetector, SequenceSample};

const SAMPLES: u32 = 10_000;

fn bench_on_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_sample");
    group.throughput(Throughput::Elements(u64::from(SAMPLES)));

    group.bench_function("contiguous", |b| {
        b.iter(|| {
            let mut detector = LossDetector::new();
            for seqnum in 1..=SAMPLES {
                detector.on_sample(SequenceSample::alive(black_box(seqnum)));
            }
            black_box(detector.snapshot())
        });
    });

    // Every 10th sample missing
    group.bench_function("sparse_gaps", |b| {
        b.iter(|| {
            let mut detector = LossDetector::new();
            for seqnum in (1..=SAMPLES).filter(|s| s % 10 != 0) {
                detector.on_sample(SequenceSample::alive(black_box(seqnum)));
            }
            black_box(detector.snapshot())
        });
    });

    group.finish();
}

fn bench_decode_and_account(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_and_account");

    for payload_size in [32u32, 1024, 65_536] {
        let schema = PayloadSchema::Static(StaticSchema::new(payload_size));
        let field = schema.seqnum_field();
        let deliveries: Vec<Delivery> = (1..=1_000u32)
            .map(|seqnum| {
                let mut instance = schema
                    .create_instance(payload_size)
                    .expect("instance of the registered size");
                field.write(&mut instance, seqnum);
                Delivery::alive(instance)
            })
            .collect();

        group.throughput(Throughput::Elements(deliveries.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &deliveries,
            |b, deliveries| {
                b.iter(|| {
                    let mut detector = LossDetector::new();
                    for delivery in deliveries {
                        detector.on_sample(field.sample_of(black_box(delivery)));
                    }
                    black_box(detector.snapshot())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_on_sample, bench_decode_and_account);
criterion_main!(benches);
