//! Connected-agent registry.
//!
//! All mutations serialise through a single actor; reads come back as
//! deep-cloned snapshots so callers never alias live state. An entry
//! exists exactly as long as its session: the connection handler opens it
//! on accept and purges it on close.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::probe::icmp::unix_millis;
use crate::session::frames::{AttributesAnnouncementPayload, ConnectionAttributes};

/// Per-session registry entry. The underlying QUIC connection handle is
/// carried for dispatch but never serialised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnRegistryData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Unix seconds.
    pub connected_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: ConnectionAttributes,
    #[serde(skip)]
    pub session: Option<quinn::Connection>,
}

impl ConnRegistryData {
    /// True iff every required attribute is present with the same value.
    pub fn matches_attributes(&self, required: &ConnectionAttributes) -> bool {
        required
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }
}

enum Command {
    Open {
        key: String,
        session: Option<quinn::Connection>,
    },
    Close {
        key: String,
    },
    Register {
        key: String,
        node_name: String,
        reply: oneshot::Sender<bool>,
    },
    Heartbeat {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    SetAttributes {
        key: String,
        announcement: AttributesAnnouncementPayload,
        reply: oneshot::Sender<bool>,
    },
    Dump {
        reply: oneshot::Sender<HashMap<String, ConnRegistryData>>,
    },
    Search {
        required: ConnectionAttributes,
        reply: oneshot::Sender<Option<(String, ConnRegistryData)>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnRegistry {
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnRegistry {
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);

        tokio::spawn(async move {
            let mut store: HashMap<String, ConnRegistryData> = HashMap::new();

            loop {
                let command = tokio::select! {
                    () = cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };

                match command {
                    Command::Open { key, session } => {
                        debug!("connection opened: {key}");
                        store.insert(
                            key,
                            ConnRegistryData {
                                connected_at: unix_millis() / 1000,
                                session,
                                ..Default::default()
                            },
                        );
                    }
                    Command::Close { key } => {
                        if store.remove(&key).is_some() {
                            debug!("connection closed: {key}, {} remain", store.len());
                        }
                    }
                    Command::Register { key, node_name, reply } => {
                        let found = match store.get_mut(&key) {
                            Some(entry) => {
                                info!("registered {key} as node {node_name}");
                                entry.node_name = Some(node_name);
                                entry.registered_at = Some(unix_millis() / 1000);
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(found);
                    }
                    Command::Heartbeat { key, reply } => {
                        let found = match store.get_mut(&key) {
                            Some(entry) => {
                                entry.last_heartbeat = Some(unix_millis() / 1000);
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(found);
                    }
                    Command::SetAttributes { key, announcement, reply } => {
                        let found = match store.get_mut(&key) {
                            Some(entry) => {
                                announcement.apply(&mut entry.attributes);
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(found);
                    }
                    Command::Dump { reply } => {
                        let _ = reply.send(store.clone());
                    }
                    Command::Search { required, reply } => {
                        // Deterministic pick: first match in key order.
                        let mut keys: Vec<&String> = store.keys().collect();
                        keys.sort();
                        let hit = keys.into_iter().find_map(|key| {
                            let entry = &store[key];
                            entry
                                .matches_attributes(&required)
                                .then(|| (key.clone(), entry.clone()))
                        });
                        let _ = reply.send(hit);
                    }
                    Command::Count { reply } => {
                        let _ = reply.send(store.len());
                    }
                }
            }
        });

        Self { cmd_tx }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::Internal("connection registry is closed".into()))
    }

    async fn ask<R>(&self, rx: oneshot::Receiver<R>) -> Result<R> {
        rx.await
            .map_err(|_| Error::Internal("connection registry dropped a reply".into()))
    }

    pub async fn open(&self, key: &str, session: Option<quinn::Connection>) -> Result<()> {
        self.send(Command::Open {
            key: key.to_string(),
            session,
        })
        .await
    }

    pub async fn close(&self, key: &str) -> Result<()> {
        self.send(Command::Close {
            key: key.to_string(),
        })
        .await
    }

    pub async fn register(&self, key: &str, node_name: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Register {
            key: key.to_string(),
            node_name: node_name.to_string(),
            reply: tx,
        })
        .await?;
        self.ask(rx).await
    }

    pub async fn update_heartbeat(&self, key: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Heartbeat {
            key: key.to_string(),
            reply: tx,
        })
        .await?;
        self.ask(rx).await
    }

    pub async fn set_attributes(
        &self,
        key: &str,
        announcement: AttributesAnnouncementPayload,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetAttributes {
            key: key.to_string(),
            announcement,
            reply: tx,
        })
        .await?;
        self.ask(rx).await
    }

    /// Snapshot of every live entry, deep-cloned.
    pub async fn dump(&self) -> Result<HashMap<String, ConnRegistryData>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Dump { reply: tx }).await?;
        self.ask(rx).await
    }

    /// First live agent matching the required attribute subset.
    pub async fn search_by_attributes(
        &self,
        required: ConnectionAttributes,
    ) -> Result<Option<(String, ConnRegistryData)>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Search {
            required,
            reply: tx,
        })
        .await?;
        self.ask(rx).await
    }

    pub async fn count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count { reply: tx }).await?;
        self.ask(rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attr;

    fn attrs(pairs: &[(&str, &str)]) -> ConnectionAttributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_lifecycle_open_register_close() {
        let cancel = CancellationToken::new();
        let registry = ConnRegistry::spawn(cancel.clone());

        registry.open("conn-1", None).await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 1);

        assert!(registry.register("conn-1", "node-a").await.unwrap());
        // Registering an unknown key reports not-found.
        assert!(!registry.register("conn-9", "ghost").await.unwrap());

        let dump = registry.dump().await.unwrap();
        assert_eq!(dump["conn-1"].node_name.as_deref(), Some("node-a"));
        assert!(dump["conn-1"].registered_at.is_some());

        registry.close("conn-1").await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_heartbeat_updates_timestamp() {
        let cancel = CancellationToken::new();
        let registry = ConnRegistry::spawn(cancel.clone());

        registry.open("conn-1", None).await.unwrap();
        assert!(registry.update_heartbeat("conn-1").await.unwrap());

        let dump = registry.dump().await.unwrap();
        assert!(dump["conn-1"].last_heartbeat.is_some());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_attribute_merge_and_withdraw() {
        let cancel = CancellationToken::new();
        let registry = ConnRegistry::spawn(cancel.clone());
        registry.open("conn-1", None).await.unwrap();

        registry
            .set_attributes(
                "conn-1",
                AttributesAnnouncementPayload {
                    attributes: attrs(&[(attr::NODE_NAME, "node-a"), (attr::ASN, "AS65001")]),
                    withdrawals: vec![],
                },
            )
            .await
            .unwrap();

        registry
            .set_attributes(
                "conn-1",
                AttributesAnnouncementPayload {
                    attributes: attrs(&[(attr::SUPPORT_TCP, "true")]),
                    withdrawals: vec![attr::ASN.to_string()],
                },
            )
            .await
            .unwrap();

        let dump = registry.dump().await.unwrap();
        let entry = &dump["conn-1"];
        assert_eq!(entry.attributes.get(attr::NODE_NAME).map(String::as_str), Some("node-a"));
        assert!(!entry.attributes.contains_key(attr::ASN));
        assert_eq!(entry.attributes.get(attr::SUPPORT_TCP).map(String::as_str), Some("true"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_search_requires_full_subset_match() {
        let cancel = CancellationToken::new();
        let registry = ConnRegistry::spawn(cancel.clone());

        for (key, node) in [("conn-a", "alpha"), ("conn-b", "beta")] {
            registry.open(key, None).await.unwrap();
            registry
                .set_attributes(
                    key,
                    AttributesAnnouncementPayload {
                        attributes: attrs(&[
                            (attr::NODE_NAME, node),
                            (attr::PING_CAPABILITY, "true"),
                        ]),
                        withdrawals: vec![],
                    },
                )
                .await
                .unwrap();
        }

        let hit = registry
            .search_by_attributes(attrs(&[(attr::NODE_NAME, "beta")]))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().0, "conn-b");

        // One mismatching pair disqualifies an otherwise matching entry.
        let miss = registry
            .search_by_attributes(attrs(&[
                (attr::NODE_NAME, "beta"),
                (attr::SUPPORT_PMTU, "true"),
            ]))
            .await
            .unwrap();
        assert!(miss.is_none());

        cancel.cancel();
    }
}
