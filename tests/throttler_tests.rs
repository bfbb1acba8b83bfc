use flagsync::core::Throttler;
use std::sync::Arc;
use std::time::Duration;

fn throttler() -> Throttler {
    // 300s / 60s => at most 5 skipped runs in a row.
    Throttler::new("test", Duration::from_secs(60))
}

/// Runs ticks the way a job does and counts how many went out.
fn ticks_until_action(throttler: &Throttler, limit: usize) -> usize {
    for tick in 0..limit {
        if throttler.perform_action() {
            return tick;
        }
        throttler.skipped();
    }
    limit
}

#[test]
fn test_starts_unthrottled() {
    let throttler = throttler();
    assert!(throttler.perform_action());
    assert_eq!(throttler.skips(), 0);
    assert_eq!(throttler.failures(), 0);
}

#[test]
fn test_server_errors_back_off_gradually() {
    let throttler = throttler();

    throttler.handle(503);
    assert_eq!(throttler.failures(), 1);
    assert_eq!(throttler.skips(), 1);

    throttler.handle(500);
    throttler.handle(429);
    assert_eq!(throttler.failures(), 3);
    assert_eq!(throttler.skips(), 3);
    assert!(!throttler.perform_action());
}

#[test]
fn test_backoff_is_capped() {
    let throttler = throttler();
    for _ in 0..20 {
        throttler.handle(502);
    }
    assert_eq!(throttler.failures(), throttler.max_skips());
    assert_eq!(throttler.skips(), throttler.max_skips());
}

#[test]
fn test_terminal_errors_maximize_skips() {
    for status in [401, 403, 404] {
        let throttler = throttler();
        throttler.handle(status);
        assert_eq!(throttler.skips(), 5, "status {}", status);
        assert_eq!(throttler.failures(), 1, "status {}", status);
    }
}

#[test]
fn test_skipped_ticks_heal_the_backoff() {
    let throttler = throttler();
    throttler.handle(500);
    throttler.handle(500);

    assert_eq!(ticks_until_action(&throttler, 10), 2);
    assert_eq!(throttler.skips(), 0);
}

#[test]
fn test_recovery_after_consecutive_failures() {
    let throttler = throttler();
    let k = 4;
    for _ in 0..k {
        throttler.handle(500);
    }
    for _ in 0..k {
        throttler.handle(200);
        assert!(throttler.failures() >= 0);
        assert!(throttler.skips() >= 0);
    }
    assert_eq!(throttler.failures(), 0);
    assert_eq!(throttler.skips(), 0);

    throttler.handle(204);
    assert_eq!(throttler.failures(), 0);
    assert_eq!(throttler.skips(), 0);
}

#[test]
fn test_not_modified_counts_as_success() {
    let throttler = throttler();
    throttler.handle(500);
    throttler.handle(304);
    assert_eq!(throttler.failures(), 0);
    assert!(throttler.perform_action());
}

#[test]
fn test_concurrent_outcomes_are_not_lost() {
    // 300s / 1s => a ceiling of 300, above the 200 failures recorded here.
    let throttler = Arc::new(Throttler::new("concurrent", Duration::from_secs(1)));
    let threads = 4;
    let per_thread = 50;

    let report = |status: u16| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let throttler = Arc::clone(&throttler);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        throttler.handle(status);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    };

    report(503);
    assert_eq!(throttler.failures(), threads * per_thread);

    report(200);
    assert_eq!(throttler.failures(), 0);
    throttler.handle(204);
    assert_eq!(throttler.skips(), 0);
}
