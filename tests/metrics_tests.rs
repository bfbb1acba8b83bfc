use flagsync::core::{MetricsAggregator, MetricsCollector, NoOpMetrics};
use flagsync::Variant;
use std::sync::Arc;

#[test]
fn test_flush_never_double_counts() {
    let aggregator = MetricsAggregator::new();
    let (n, m) = (7, 3);

    for _ in 0..n {
        aggregator.count("f", true);
    }
    let first = aggregator.flush();
    for _ in 0..m {
        aggregator.count("f", true);
    }
    let second = aggregator.flush();

    assert_eq!(first.toggles["f"].yes, n);
    assert_eq!(second.toggles["f"].yes, m);
}

#[test]
fn test_concurrent_counts_survive_flushes() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let threads = 8;
    let per_thread = 2_000;

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let aggregator = Arc::clone(&aggregator);
            std::thread::spawn(move || {
                for i in 0..per_thread {
                    aggregator.count("hot", i % 2 == 0);
                }
            })
        })
        .collect();

    let mut yes = 0;
    let mut no = 0;
    while workers.iter().any(|w| !w.is_finished()) {
        let bucket = aggregator.flush();
        if let Some(count) = bucket.toggles.get("hot") {
            yes += count.yes;
            no += count.no;
        }
    }
    for worker in workers {
        worker.join().unwrap();
    }
    let last = aggregator.flush();
    if let Some(count) = last.toggles.get("hot") {
        yes += count.yes;
        no += count.no;
    }

    assert_eq!(yes + no, (threads * per_thread) as u64);
    assert_eq!(yes, no);
}

#[test]
fn test_variant_counts_are_per_feature() {
    let aggregator = MetricsAggregator::new();
    aggregator.count_variant("a", Variant::new("blue"));
    aggregator.count_variant("a", Variant::new("blue"));
    aggregator.count_variant("a", Variant::new("green"));
    aggregator.count_variant("b", Variant::new("blue"));

    let bucket = aggregator.flush();
    assert_eq!(bucket.toggles["a"].variants["blue"], 2);
    assert_eq!(bucket.toggles["a"].variants["green"], 1);
    assert_eq!(bucket.toggles["b"].variants["blue"], 1);
    assert_eq!(bucket.toggles["a"].yes, 0);
}

#[test]
fn test_collectors_return_their_input() {
    let aggregator = MetricsAggregator::new();
    assert!(aggregator.count("x", true));
    assert_eq!(aggregator.count_variant("x", Variant::new("v")).name, "v");

    let noop = NoOpMetrics;
    assert!(!noop.count("x", false));
    assert_eq!(noop.count_variant("x", Variant::disabled()).name, "disabled");
}
