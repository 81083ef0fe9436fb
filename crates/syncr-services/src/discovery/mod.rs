//! Peer and key discovery: one abstraction, two backends.
//!
//! The Drop Peer Store answers "who serves this drop right now" and the
//! Public Key Store resolves node IDs to public keys for signature
//! verification. Both are backed either by a single long-lived tracker or
//! by a DHT used as a black-box key/value store; `dps.json` and `pks.json`
//! under the node init directory pick the backend per store.
//!
//! Peer availability is TTL-bounded: an announcement is visible for
//! [`PEER_AVAILABILITY_TTL`] and then ages out, so the announcer re-publishes
//! on a shorter period.

pub mod dht;
pub mod tracker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use syncr_core::crypto::{self, CryptoError, PublicKey};
use syncr_core::types::{DropId, NodeId, Peer};

use crate::net::NetError;
use crate::node::Node;

use dht::{DhtClient, DhtKeyStore, DhtPeerStore};
use tracker::{TrackerKeyStore, TrackerPeerStore};

/// How long a peer announcement stays visible.
pub const PEER_AVAILABILITY_TTL: Duration = Duration::from_secs(300);

pub const DPS_CONFIG_FILE: &str = "dps.json";
pub const PKS_CONFIG_FILE: &str = "pks.json";

// ── Config ───────────────────────────────────────────────────────────────────

/// A parsed discovery config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Tracker(tracker::TrackerConfig),
    Dht(dht::DhtConfig),
}

/// Read and dispatch a discovery config file on its `type` field.
pub async fn load_store_config(path: &Path) -> Result<StoreConfig, StoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::MissingConfig(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let raw: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| StoreError::IncompleteConfig(e.to_string()))?;
    match raw.get("type").and_then(serde_json::Value::as_str) {
        Some("tracker") => serde_json::from_value(raw)
            .map(StoreConfig::Tracker)
            .map_err(|e| StoreError::IncompleteConfig(e.to_string())),
        Some("dht") => serde_json::from_value(raw)
            .map(StoreConfig::Dht)
            .map_err(|e| StoreError::IncompleteConfig(e.to_string())),
        Some(other) => Err(StoreError::UnsupportedOption(other.to_string())),
        None => Err(StoreError::IncompleteConfig("missing type field".into())),
    }
}

// ── Drop Peer Store ──────────────────────────────────────────────────────────

/// Who currently serves a drop. Announcements are at-most-once per
/// (drop, node) — re-announcing refreshes the TTL rather than duplicating
/// the entry.
pub enum DropPeerStore {
    Tracker(TrackerPeerStore),
    Dht(DhtPeerStore),
}

impl DropPeerStore {
    /// Advertise that this node serves `drop_id` at `ip:port`.
    pub async fn announce(&self, drop_id: DropId, ip: &str, port: u16) -> Result<(), StoreError> {
        match self {
            DropPeerStore::Tracker(t) => t.announce(drop_id, ip, port).await,
            DropPeerStore::Dht(d) => d.announce(drop_id, ip, port).await,
        }
    }

    /// Current candidates for `drop_id`, already TTL-filtered.
    pub async fn request_peers(&self, drop_id: DropId) -> Result<Vec<Peer>, StoreError> {
        match self {
            DropPeerStore::Tracker(t) => t.request_peers(drop_id).await,
            DropPeerStore::Dht(d) => d.request_peers(drop_id).await,
        }
    }
}

/// Build the configured DPS for this node.
pub async fn get_drop_peer_store(node: &Node) -> Result<DropPeerStore, StoreError> {
    let config = load_store_config(&node.home().join(DPS_CONFIG_FILE)).await?;
    Ok(match config {
        StoreConfig::Tracker(config) => {
            DropPeerStore::Tracker(TrackerPeerStore::new(node.node_id(), config))
        }
        StoreConfig::Dht(config) => {
            DropPeerStore::Dht(DhtPeerStore::new(node.node_id(), DhtClient::new(&config)))
        }
    })
}

// ── Public Key Store ─────────────────────────────────────────────────────────

/// Node ID → public key resolution, fronted by an on-disk cache.
pub struct PublicKeyStore {
    backend: KeyStoreBackend,
    cache_dir: PathBuf,
}

enum KeyStoreBackend {
    Tracker(TrackerKeyStore),
    Dht(DhtKeyStore),
}

impl PublicKeyStore {
    /// Publish this node's public key.
    pub async fn set_key(&self, key_pem: &[u8]) -> Result<(), StoreError> {
        match &self.backend {
            KeyStoreBackend::Tracker(t) => t.set_key(key_pem).await,
            KeyStoreBackend::Dht(d) => d.set_key(key_pem).await,
        }
    }

    /// Resolve a peer's public key, consulting the local cache first.
    ///
    /// A fetched key must hash to the requested node ID — a store that hands
    /// back someone else's key is lying, and the comparison happens in
    /// constant time.
    pub async fn request_key(&self, node_id: NodeId) -> Result<PublicKey, StoreError> {
        let cache_path = self.cache_path(&node_id);
        if let Ok(pem) = tokio::fs::read(&cache_path).await {
            if let Ok(key) = crypto::load_public_key(&pem) {
                return Ok(key);
            }
            tracing::warn!(path = %cache_path.display(), "discarding corrupt cached key");
        }

        let pem = match &self.backend {
            KeyStoreBackend::Tracker(t) => t.request_key(node_id).await?,
            KeyStoreBackend::Dht(d) => d.request_key(node_id).await?,
        };
        let key = crypto::load_public_key(&pem)?;
        if !crypto::verify_node_id(&key, &node_id)? {
            return Err(StoreError::KeyMismatch(crypto::b64encode(&node_id)));
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&cache_path, &pem).await?;
        Ok(key)
    }

    fn cache_path(&self, node_id: &NodeId) -> PathBuf {
        self.cache_dir.join(format!("{}.pem", crypto::b64encode(node_id)))
    }
}

/// Build the configured PKS for this node.
pub async fn get_public_key_store(node: &Node) -> Result<PublicKeyStore, StoreError> {
    let config = load_store_config(&node.home().join(PKS_CONFIG_FILE)).await?;
    let backend = match config {
        StoreConfig::Tracker(config) => {
            KeyStoreBackend::Tracker(TrackerKeyStore::new(node.node_id(), config))
        }
        StoreConfig::Dht(config) => {
            KeyStoreBackend::Dht(DhtKeyStore::new(node.node_id(), DhtClient::new(&config)))
        }
    };
    Ok(PublicKeyStore {
        backend,
        cache_dir: node.pub_keys_dir(),
    })
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("discovery config not found: {0}")]
    MissingConfig(PathBuf),

    #[error("discovery config is incomplete: {0}")]
    IncompleteConfig(String),

    #[error("unsupported discovery backend: {0}")]
    UnsupportedOption(String),

    #[error("tracker refused the request: {0}")]
    Tracker(String),

    #[error("no public key published for node {0}")]
    KeyNotFound(String),

    #[error("published key does not hash to node {0}")]
    KeyMismatch(String),

    #[error("DHT lookup failed: {0}")]
    Dht(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_store_config(&dir.path().join("dps.json")).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingConfig(_)));
    }

    #[tokio::test]
    async fn tracker_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dps.json");
        std::fs::write(&path, r#"{"type": "tracker", "ip": "10.0.0.1", "port": 5555}"#).unwrap();
        let config = load_store_config(&path).await.unwrap();
        assert_eq!(
            config,
            StoreConfig::Tracker(tracker::TrackerConfig {
                ip: "10.0.0.1".into(),
                port: 5555
            })
        );
    }

    #[tokio::test]
    async fn dht_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pks.json");
        std::fs::write(
            &path,
            r#"{"type": "dht", "bootstrap_ips": ["a", "b"], "bootstrap_ports": [1, 2], "listen_port": 9}"#,
        )
        .unwrap();
        match load_store_config(&path).await.unwrap() {
            StoreConfig::Dht(config) => {
                assert_eq!(config.bootstrap_ips, vec!["a", "b"]);
                assert_eq!(config.bootstrap_ports, vec![1, 2]);
                assert_eq!(config.listen_port, Some(9));
            }
            other => panic!("expected dht config, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dps.json");
        std::fs::write(&path, r#"{"type": "carrier-pigeon"}"#).unwrap();
        assert!(matches!(
            load_store_config(&path).await.unwrap_err(),
            StoreError::UnsupportedOption(_)
        ));
    }

    #[tokio::test]
    async fn missing_fields_are_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dps.json");
        std::fs::write(&path, r#"{"type": "tracker", "ip": "10.0.0.1"}"#).unwrap();
        assert!(matches!(
            load_store_config(&path).await.unwrap_err(),
            StoreError::IncompleteConfig(_)
        ));
    }
}
