//! Admission-count and pacing properties of the shared rate limiter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globalping::config::RateLimitConfig;
use globalping::ratelimit::{throttled, RateLimitPool, RateLimiter};
use tokio_util::sync::CancellationToken;

fn pool(tokens: u32, refresh: Duration) -> (RateLimitPool, CancellationToken) {
    let cancel = CancellationToken::new();
    let pool = RateLimitPool::spawn(
        RateLimitConfig {
            tokens_per_key: tokens,
            refresh_interval: refresh,
        },
        cancel.clone(),
    );
    (pool, cancel)
}

#[tokio::test]
async fn admissions_within_one_window_never_exceed_quota() {
    let (pool, cancel) = pool(5, Duration::from_secs(60));

    let mut admitted = 0;
    for _ in 0..50 {
        if pool.consume("key").await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    cancel.cancel();
}

#[tokio::test]
async fn second_consume_blocks_less_than_two_windows() {
    // tokens_per_key=1, refresh=100ms: of two immediate consumes exactly
    // one is admitted, and the denied one unblocks in under 200ms.
    let (pool, cancel) = pool(1, Duration::from_millis(100));

    let first = pool.consume("k").await.unwrap();
    let second = pool.consume("k").await.unwrap();
    assert!(first);
    assert!(!second);

    let started = Instant::now();
    pool.wait_for_refresh(&cancel).await.unwrap();
    assert!(pool.consume("k").await.unwrap());
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "refresh took {:?}",
        started.elapsed()
    );

    cancel.cancel();
}

#[tokio::test]
async fn fan_out_is_paced_by_the_shared_pool() {
    // 30 requests through 10 tokens per 150ms: no window after the first
    // admits more than 10.
    let (pool, cancel) = pool(10, Duration::from_millis(150));
    let limiter = RateLimiter::global(pool);

    let admission_times = Arc::new(std::sync::Mutex::new(Vec::<Instant>::new()));
    let counter = Arc::new(AtomicU32::new(0));

    let mut rx = throttled(
        (0..30u32).collect::<Vec<_>>(),
        Some(limiter),
        |_| String::new(),
        cancel.clone(),
    );

    while let Some(_item) = rx.recv().await {
        admission_times.lock().unwrap().push(Instant::now());
        counter.fetch_add(1, Ordering::Relaxed);
    }
    assert_eq!(counter.load(Ordering::Relaxed), 30);

    // Sliding-window check over the recorded admission instants.
    let times = admission_times.lock().unwrap();
    for (i, &start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|&&t| t.duration_since(start) < Duration::from_millis(150))
            .count();
        assert!(
            in_window <= 10,
            "{in_window} admissions inside one refresh window"
        );
    }

    cancel.cancel();
}
