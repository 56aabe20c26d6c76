// Property-based tests for the metrics aggregator and threshold parsing
//
// Properties tested:
// 1. Count consistency: N concurrent record() calls → count = N, for any split across writers
// 2. Failure accounting: failures + successes = total
// 3. Percentile bound: reported percentiles stay within 0.1% of the exact sample at that rank
// 4. Duration strings round-trip through format/parse

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vuload_core::{format_duration, parse_duration, MetricsAggregator, Outcome, Sample};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_concurrent_record_never_loses_samples(
        writers in 1usize..=8,
        per_writer in 0usize..=500,
        fail_every in 1usize..=10,
    ) {
        let aggregator = Arc::new(MetricsAggregator::new());

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    for i in 0..per_writer {
                        let outcome = if i % fail_every == 0 {
                            Outcome::Status(503)
                        } else {
                            Outcome::Status(200)
                        };
                        aggregator.record(Sample::new(outcome, Duration::from_micros(i as u64 + 1)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected_failures = (0..per_writer).filter(|i| i % fail_every == 0).count() * writers;
        let snapshot = aggregator.snapshot();

        prop_assert_eq!(snapshot.requests, (writers * per_writer) as u64);
        prop_assert_eq!(snapshot.latency_count(), (writers * per_writer) as u64);
        prop_assert_eq!(snapshot.failures, expected_failures as u64);
        prop_assert_eq!(
            snapshot.status_counts.values().sum::<u64>(),
            (writers * per_writer) as u64
        );
    }

    #[test]
    fn prop_percentile_within_documented_bound(
        mut latencies_us in prop::collection::vec(1u64..=10_000_000, 1..2_000),
        p in 1.0f64..=100.0,
    ) {
        let aggregator = MetricsAggregator::new();
        for &us in &latencies_us {
            aggregator.record(Sample::new(Outcome::Status(200), Duration::from_micros(us)));
        }

        latencies_us.sort_unstable();
        let rank = ((p / 100.0) * latencies_us.len() as f64).ceil().max(1.0) as usize;
        let exact = latencies_us[rank.min(latencies_us.len()) - 1] as f64;

        let reported = aggregator
            .snapshot()
            .latency_percentile(p)
            .unwrap()
            .as_micros() as f64;

        // Values are bucketed with 3 significant digits
        prop_assert!(
            (reported - exact).abs() <= exact * 0.001 + 1.0,
            "p{} reported {} exact {}",
            p,
            reported,
            exact
        );
    }

    #[test]
    fn prop_duration_round_trip(millis in 0u64..=100_000_000) {
        let duration = Duration::from_millis(millis);
        prop_assert_eq!(parse_duration(&format_duration(duration)).unwrap(), duration);
    }
}
