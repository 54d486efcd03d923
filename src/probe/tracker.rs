//! In-flight request tracking.
//!
//! A single actor serialises all mutations of a key→entry store. Callers
//! enqueue commands on a bounded channel; the actor assigns each sent entry
//! a monotonic sequence, arms its timeout, and emits events in processing
//! order. An entry leaves the store exactly once: by reply, by timeout, or
//! as `Cancelled` when the owning context shuts down.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Event channel capacity. Size it to at least
    /// `packet_timeout / packet_interval × redundancy factor` so overflow
    /// never happens under normal load; overflow drops the newest event
    /// with a logged warning.
    pub event_buffer: usize,
    /// First sequence number assigned by `mark_sent`.
    pub initial_seq: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            event_buffer: 16,
            initial_seq: 0,
        }
    }
}

/// How an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEventKind {
    Received,
    Timeout,
    Cancelled,
}

/// An entry leaving the store.
#[derive(Debug)]
pub struct TrackerEvent<K, V> {
    pub kind: TrackerEventKind,
    pub key: K,
    /// Sequence assigned when the entry was marked sent.
    pub seq: u64,
    pub value: V,
}

enum Command<K, V> {
    MarkSent {
        key: K,
        value: V,
        timeout: Duration,
        reply: oneshot::Sender<u64>,
    },
    MarkReceived {
        key: K,
        apply: Box<dyn FnOnce(&mut V) + Send>,
    },
    HandleTimeout {
        key: K,
    },
}

/// Handle to a tracker actor. Cheap to clone.
pub struct Tracker<K, V> {
    cmd_tx: mpsc::Sender<Command<K, V>>,
}

impl<K, V> Clone for Tracker<K, V> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

struct Entry<V> {
    seq: u64,
    value: V,
}

impl<K, V> Tracker<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Spawn the tracker actor. Returns the handle and the event stream.
    pub fn spawn(
        config: TrackerConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<TrackerEvent<K, V>>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command<K, V>>(64);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let timer_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let mut store: BTreeMap<K, Entry<V>> = BTreeMap::new();
            let mut counter = config.initial_seq;

            loop {
                let command = tokio::select! {
                    () = cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };

                match command {
                    Command::MarkSent {
                        key,
                        value,
                        timeout,
                        reply,
                    } => {
                        let seq = counter;
                        counter += 1;
                        store.insert(key.clone(), Entry { seq, value });

                        // The timer task holds only the key; whichever of
                        // reply and timeout loses finds nothing to remove.
                        let timer_tx = timer_tx.clone();
                        let timer_cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                () = timer_cancel.cancelled() => {}
                                () = tokio::time::sleep(timeout) => {
                                    let _ = timer_tx
                                        .send(Command::HandleTimeout { key })
                                        .await;
                                }
                            }
                        });

                        let _ = reply.send(seq);
                    }
                    Command::MarkReceived { key, apply } => {
                        // A miss is a late reply after timeout: silent no-op.
                        if let Some(mut entry) = store.remove(&key) {
                            apply(&mut entry.value);
                            emit(
                                &event_tx,
                                TrackerEvent {
                                    kind: TrackerEventKind::Received,
                                    key,
                                    seq: entry.seq,
                                    value: entry.value,
                                },
                            );
                        }
                    }
                    Command::HandleTimeout { key } => {
                        if let Some(entry) = store.remove(&key) {
                            emit(
                                &event_tx,
                                TrackerEvent {
                                    kind: TrackerEventKind::Timeout,
                                    key,
                                    seq: entry.seq,
                                    value: entry.value,
                                },
                            );
                        }
                    }
                }
            }

            // Parent cancelled (or all handles dropped): every in-flight
            // entry leaves as Cancelled, not Timeout.
            while let Some((key, entry)) = store.pop_first() {
                emit(
                    &event_tx,
                    TrackerEvent {
                        kind: TrackerEventKind::Cancelled,
                        key,
                        seq: entry.seq,
                        value: entry.value,
                    },
                );
            }
        });

        (Self { cmd_tx }, event_rx)
    }

    /// Insert an entry and arm its timeout. Returns the assigned sequence.
    pub async fn mark_sent(&self, key: K, value: V, timeout: Duration) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MarkSent {
                key,
                value,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("tracker is closed".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Internal("tracker dropped a reply".into()))
    }

    /// Record a reply for the entry under `key`. `apply` runs on the entry
    /// value (record received-at, RTT, the reply packet) before the
    /// `Received` event is emitted. Unknown keys are ignored.
    pub async fn mark_received(
        &self,
        key: K,
        apply: impl FnOnce(&mut V) + Send + 'static,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::MarkReceived {
                key,
                apply: Box::new(apply),
            })
            .await
            .map_err(|_| Error::Internal("tracker is closed".into()))
    }
}

fn emit<K, V>(tx: &mpsc::Sender<TrackerEvent<K, V>>, event: TrackerEvent<K, V>) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
        warn!("tracker event buffer full, dropping event");
    }
}

/// Pack a big-endian `src_ip ‖ src_port ‖ dst_ip ‖ dst_port` tracker key.
pub fn build_endpoint_key(
    src: std::net::IpAddr,
    src_port: u16,
    dst: std::net::IpAddr,
    dst_port: u16,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    match src {
        std::net::IpAddr::V4(ip) => key.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => key.extend_from_slice(&ip.octets()),
    }
    key.extend_from_slice(&src_port.to_be_bytes());
    match dst {
        std::net::IpAddr::V4(ip) => key.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => key.extend_from_slice(&ip.octets()),
    }
    key.extend_from_slice(&dst_port.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[derive(Debug, PartialEq)]
    struct Probe {
        replied: bool,
    }

    #[tokio::test]
    async fn test_received_before_timeout() {
        let cancel = CancellationToken::new();
        let (tracker, mut events) =
            Tracker::<u16, Probe>::spawn(TrackerConfig::default(), cancel.clone());

        tracker
            .mark_sent(7, Probe { replied: false }, Duration::from_secs(5))
            .await
            .unwrap();
        tracker
            .mark_received(7, |probe| probe.replied = true)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, TrackerEventKind::Received);
        assert_eq!(event.key, 7);
        assert!(event.value.replied);

        cancel.cancel();
        // Nothing left in the store: no further events.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_fires_once_within_budget() {
        let cancel = CancellationToken::new();
        let (tracker, mut events) =
            Tracker::<u16, Probe>::spawn(TrackerConfig::default(), cancel.clone());

        tracker
            .mark_sent(1, Probe { replied: false }, Duration::from_millis(30))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("timeout event within budget")
            .unwrap();
        assert_eq!(event.kind, TrackerEventKind::Timeout);

        // A late reply for the reaped key is a silent no-op.
        tracker.mark_received(1, |_| {}).await.unwrap();
        cancel.cancel();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_no_timeout_after_received() {
        let cancel = CancellationToken::new();
        let (tracker, mut events) =
            Tracker::<u16, Probe>::spawn(TrackerConfig::default(), cancel.clone());

        tracker
            .mark_sent(3, Probe { replied: false }, Duration::from_millis(50))
            .await
            .unwrap();
        tracker.mark_received(3, |_| {}).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, TrackerEventKind::Received);

        // Wait past the timeout: exactly one event total.
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_drains_as_cancelled() {
        let cancel = CancellationToken::new();
        let (tracker, mut events) =
            Tracker::<u16, Probe>::spawn(TrackerConfig::default(), cancel.clone());

        for key in [1u16, 2, 3] {
            tracker
                .mark_sent(key, Probe { replied: false }, Duration::from_secs(30))
                .await
                .unwrap();
        }

        cancel.cancel();

        let mut cancelled = 0;
        while let Some(event) = events.recv().await {
            assert_eq!(event.kind, TrackerEventKind::Cancelled);
            cancelled += 1;
        }
        assert_eq!(cancelled, 3);
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic() {
        let cancel = CancellationToken::new();
        let (tracker, _events) = Tracker::<u16, Probe>::spawn(
            TrackerConfig {
                initial_seq: 10,
                ..Default::default()
            },
            cancel.clone(),
        );

        let a = tracker
            .mark_sent(1, Probe { replied: false }, Duration::from_secs(5))
            .await
            .unwrap();
        let b = tracker
            .mark_sent(2, Probe { replied: false }, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!((a, b), (10, 11));

        cancel.cancel();
    }

    #[test]
    fn test_endpoint_key_reversal() {
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "198.51.100.2".parse().unwrap();

        let sent = build_endpoint_key(src, 40000, dst, 22);
        // A reply arrives with src/dst swapped; building the lookup key
        // from (reply.dst, reply.dst_port, reply.src, reply.src_port)
        // recovers the sent key.
        let (reply_src, reply_src_port) = (dst, 22);
        let (reply_dst, reply_dst_port) = (src, 40000);
        let reply_lookup =
            build_endpoint_key(reply_dst, reply_dst_port, reply_src, reply_src_port);
        assert_eq!(sent, reply_lookup);
        assert_eq!(sent.len(), 12);

        // A same-direction key does not alias the reversed one.
        assert_ne!(sent, build_endpoint_key(dst, 22, src, 40000));

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(build_endpoint_key(v6, 1, v6, 2).len(), 36);
    }
}
