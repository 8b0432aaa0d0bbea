use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use perftest::{
    config::Units,
    report::{combine_duplex, compute_bandwidth, BandwidthReport, LatencyReport},
    transport::RawCounters,
};

pub fn latency_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency report");
    for iterations in (3..=6).map(|i| 10u64.pow(i)) {
        let counters = RawCounters {
            size: 2,
            messages: iterations,
            bytes: 2 * iterations,
            elapsed: Duration::from_micros(3 * iterations),
            samples: (0..iterations)
                .map(|i| Duration::from_nanos(2500 + (i * 7919) % 1500))
                .collect(),
        };

        group.throughput(Throughput::Elements(iterations));
        group.bench_with_input(
            BenchmarkId::new("from_counters", iterations),
            &counters,
            |b, counters| {
                b.iter(|| LatencyReport::from_counters(black_box(counters)));
            },
        );
    }
    group.finish();
}

pub fn bandwidth_benchmark(c: &mut Criterion) {
    let local = BandwidthReport {
        size: 8,
        messages: 1_000_000,
        bytes: 8_000_000,
        elapsed: Duration::from_millis(250),
    };
    let remote = BandwidthReport {
        elapsed: Duration::from_millis(260),
        ..local
    };

    c.bench_function("compute_bandwidth", |b| {
        b.iter(|| compute_bandwidth(black_box(&local), Units::GigaBits));
    });
    c.bench_function("combine_duplex", |b| {
        b.iter(|| combine_duplex(black_box(&local), black_box(&remote), Units::MegaBytes));
    });
}

criterion_group!(benches, latency_benchmark, bandwidth_benchmark);
criterion_main!(benches);
