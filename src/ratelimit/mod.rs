//! Shared token rate limiting.
//!
//! A [`RateLimitPool`] is a single-writer actor owning per-key token
//! counters and a broadcast refresh signal. On every refresh tick each key's
//! quota is **reset** to `tokens_per_key` — quota never accumulates across
//! intervals, despite what "token bucket" might suggest.
//!
//! A [`RateLimiter`] pairs a pool with a key function and exposes the
//! blocking `admit` loop used by the throttled request adapter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

enum PoolCommand {
    Consume {
        key: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Single-writer token pool. Cheap to clone; all clones talk to the same
/// actor task.
#[derive(Clone)]
pub struct RateLimitPool {
    cmd_tx: mpsc::Sender<PoolCommand>,
    refresh_tx: broadcast::Sender<()>,
}

impl RateLimitPool {
    /// Spawn the pool actor. It runs until `cancel` fires.
    pub fn spawn(config: RateLimitConfig, cancel: CancellationToken) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PoolCommand>(64);
        let (refresh_tx, _) = broadcast::channel(4);

        let tick_tx = refresh_tx.clone();
        tokio::spawn(async move {
            let tokens_per_key = config.tokens_per_key;
            let mut counters: HashMap<String, u32> = HashMap::new();
            let mut ticker = tokio::time::interval(config.refresh_interval);
            // The first tick of a tokio interval fires immediately; skip it
            // so the first window starts full, not refreshed mid-flight.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("rate limit pool shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        counters.clear();
                        let _ = tick_tx.send(());
                    }
                    cmd = cmd_rx.recv() => {
                        let Some(PoolCommand::Consume { key, reply }) = cmd else {
                            return;
                        };
                        let counter = counters.entry(key).or_insert(tokens_per_key);
                        let admitted = *counter > 0;
                        if admitted {
                            *counter -= 1;
                        }
                        let _ = reply.send(admitted);
                    }
                }
            }
        });

        Self { cmd_tx, refresh_tx }
    }

    /// Try to take one token for `key`. Returns `false` without blocking
    /// when the key's quota for the current window is exhausted.
    pub async fn consume(&self, key: &str) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Consume {
                key: key.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("rate limit pool is gone".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Internal("rate limit pool dropped a reply".into()))
    }

    /// Block until the next refresh tick, or until `cancel` fires.
    pub async fn wait_for_refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.refresh_tx.subscribe();
        tokio::select! {
            () = cancel.cancelled() => Err(Error::ConnectionClosed),
            res = rx.recv() => match res {
                // A lagged receiver still observed at least one refresh.
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    Err(Error::Internal("rate limit pool is gone".into()))
                }
            },
        }
    }
}

/// A pool plus the key function applied to throttled items.
pub struct RateLimiter {
    pool: RateLimitPool,
}

impl RateLimiter {
    /// All items share one global key, which makes the pool a shared
    /// outbound limiter.
    pub fn global(pool: RateLimitPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Block until `key` is admitted: consume, and on denial wait for the
    /// next refresh and retry.
    pub async fn admit(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.pool.consume(key).await? {
                return Ok(());
            }
            self.pool.wait_for_refresh(cancel).await?;
        }
    }
}

/// Pass `requests` through the limiter, yielding each item exactly once as
/// its token is granted. FIFO order is preserved per key (items are admitted
/// in input order). Cancellation closes the stream; items already admitted
/// are never dropped.
pub fn throttled<T, F>(
    requests: Vec<T>,
    limiter: Option<Arc<RateLimiter>>,
    key_fn: F,
    cancel: CancellationToken,
) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: Fn(&T) -> String + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        for request in requests {
            if let Some(ref limiter) = limiter {
                let key = key_fn(&request);
                if let Err(e) = limiter.admit(&key, &cancel).await {
                    if !matches!(e, Error::ConnectionClosed) {
                        warn!("rate limiter failed, ending request stream: {e}");
                    }
                    return;
                }
            }

            // Admitted items must reach the consumer; only a dropped
            // receiver ends the stream early.
            if tx.send(request).await.is_err() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(tokens: u32, refresh_ms: u64) -> (RateLimitPool, CancellationToken) {
        let cancel = CancellationToken::new();
        let pool = RateLimitPool::spawn(
            RateLimitConfig {
                tokens_per_key: tokens,
                refresh_interval: Duration::from_millis(refresh_ms),
            },
            cancel.clone(),
        );
        (pool, cancel)
    }

    #[tokio::test]
    async fn test_quota_is_enforced_within_a_window() {
        let (pool, cancel) = pool(3, 60_000);

        for _ in 0..3 {
            assert!(pool.consume("k").await.unwrap());
        }
        assert!(!pool.consume("k").await.unwrap());
        // A different key has its own counter.
        assert!(pool.consume("other").await.unwrap());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_resets_rather_than_accumulates() {
        let (pool, cancel) = pool(1, 50);

        assert!(pool.consume("k").await.unwrap());
        assert!(!pool.consume("k").await.unwrap());

        // Wait out two refreshes; quota must be 1 again, not 2.
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert!(pool.consume("k").await.unwrap());
        assert!(!pool.consume("k").await.unwrap());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wait_for_refresh_unblocks_within_interval() {
        let (pool, cancel) = pool(1, 100);

        assert!(pool.consume("k").await.unwrap());
        let started = std::time::Instant::now();
        pool.wait_for_refresh(&cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wait_for_refresh_observes_cancel() {
        let (pool, cancel) = pool(1, 60_000);

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.wait_for_refresh(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_throttled_preserves_order_and_yields_everything() {
        let (pool, cancel) = pool(2, 30);
        let limiter = RateLimiter::global(pool);

        let items: Vec<u32> = (0..7).collect();
        let mut rx = throttled(
            items.clone(),
            Some(limiter),
            |_| String::new(),
            cancel.clone(),
        );

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            seen.push(item);
        }
        assert_eq!(seen, items);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_throttled_without_limiter_passes_through() {
        let cancel = CancellationToken::new();
        let mut rx = throttled(vec![1, 2, 3], None, |_: &i32| String::new(), cancel);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, None);
    }
}
