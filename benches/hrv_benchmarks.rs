use calmsense::classifier::{Classifier, ClassifierPolicy};
use calmsense::events::RecordingSink;
use calmsense::hrv::{HrvCalculator, HrvConfig, IntervalRounding};
use calmsense::models::{HeartRateSample, HrvReading, SensitivityConfig, StressLabel};
use calmsense::monitor::{MonitorConfig, StressMonitor};
use calmsense::source::MemorySampleSource;
use calmsense::store::MemoryStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmarks for the measurement and classification path

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn samples(count: usize, spacing_secs: i64) -> Vec<HeartRateSample> {
    (0..count)
        .map(|i| HeartRateSample {
            timestamp: start() + Duration::seconds(i as i64 * spacing_secs),
            bpm: 62.0 + (i % 7) as f64,
        })
        .collect()
}

fn bench_hrv_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("HRV Compute");

    for rounding in [IntervalRounding::Nearest, IntervalRounding::Raw] {
        let calculator = HrvCalculator::new(HrvConfig {
            rounding,
            ..HrvConfig::default()
        });
        // dense streams exercise decimation
        for &size in &[6usize, 60, 600] {
            let input = samples(size, 1);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", rounding), size),
                &input,
                |b, input| b.iter(|| calculator.compute(black_box(input))),
            );
        }
    }

    group.finish();
}

fn bench_classifier(c: &mut Criterion) {
    let readings: Vec<HrvReading> = (0..1000)
        .map(|i| HrvReading {
            value_ms: 35.0 + (i % 30) as f64,
            sample_count: 6,
            produced_at: start() + Duration::minutes(i),
        })
        .collect();

    let mut group = c.benchmark_group("Classifier");
    group.throughput(Throughput::Elements(readings.len() as u64));

    for (name, policy) in [
        ("windowed", ClassifierPolicy::WindowedMajority),
        ("hysteresis", ClassifierPolicy::hysteresis()),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut classifier = Classifier::new(policy, 50.0);
                for reading in &readings {
                    black_box(classifier.classify(reading, SensitivityConfig::new(3, 5), reading.produced_at));
                }
            })
        });
    }

    group.finish();
}

fn bench_full_session(c: &mut Criterion) {
    c.bench_function("virtual 60s session", |b| {
        b.iter(|| {
            let source = MemorySampleSource::new(samples(18, 5));
            let mut monitor = StressMonitor::new(
                MonitorConfig::default(),
                source,
                MemoryStore::new(),
                RecordingSink::default(),
                start(),
            )
            .unwrap();
            monitor.start_measurement(Some(StressLabel::Calm)).unwrap();
            monitor.advance_by(Duration::seconds(70)).unwrap();
            black_box(monitor.last_reading())
        })
    });
}

criterion_group!(benches, bench_hrv_compute, bench_classifier, bench_full_session);
criterion_main!(benches);
