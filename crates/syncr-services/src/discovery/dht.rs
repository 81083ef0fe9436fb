//! DHT backend: a Kademlia-style network used as a black-box key/value
//! store. The DHT internals stay out of scope; this module holds the thin
//! codec-framed client, plus the one piece of storage behavior the drop
//! model depends on — peer-list values are *unioned* under a key rather
//! than overwritten, and reads age out entries past the availability TTL.
//!
//! [`DhtStorage`] implements that union/cull behavior so `run-dht-server`
//! can serve it; nodes talk to any DHT server via [`DhtClient`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use syncr_core::codec::{MapBuilder, Value};
use syncr_core::crypto::{decode_peerlist, encode_peerlist};
use syncr_core::types::{DropId, NodeId, Peer};

use crate::net::exchange;

use super::StoreError;

pub const DHT_GET: u64 = 0;
pub const DHT_PUT: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DhtConfig {
    pub bootstrap_ips: Vec<String>,
    pub bootstrap_ports: Vec<u16>,
    /// Port a local DHT server should listen on; absent for pure clients.
    #[serde(default)]
    pub listen_port: Option<u16>,
}

impl DhtConfig {
    pub fn bootstrap_nodes(&self) -> Vec<(String, u16)> {
        self.bootstrap_ips
            .iter()
            .cloned()
            .zip(self.bootstrap_ports.iter().copied())
            .collect()
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Codec-framed get/put client against the DHT servers in the config.
/// Servers are tried in order; the first answer wins.
#[derive(Clone)]
pub struct DhtClient {
    nodes: Vec<(String, u16)>,
}

impl DhtClient {
    pub fn new(config: &DhtConfig) -> Self {
        Self {
            nodes: config.bootstrap_nodes(),
        }
    }

    async fn round_trip(&self, request: Value) -> Result<Value, StoreError> {
        let payload = request.encode();
        let mut last = None;
        for (ip, port) in &self.nodes {
            match exchange(ip, *port, &payload).await {
                Ok(raw) => {
                    return Value::decode(&raw).map_err(|e| StoreError::Dht(e.to_string()));
                }
                Err(e) => {
                    tracing::debug!(ip, port, error = %e, "DHT node unreachable");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(e.into()),
            None => Err(StoreError::Dht("no DHT nodes configured".into())),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let request = MapBuilder::new()
            .entry(b"request_type", DHT_GET)
            .entry(b"key", key)
            .build();
        let response = self.round_trip(request).await?;
        match response.get(b"status").and_then(Value::as_str) {
            Some("ok") => Ok(response
                .get(b"value")
                .and_then(Value::as_bytes)
                .map(<[u8]>::to_vec)),
            _ => Err(StoreError::Dht("get refused".into())),
        }
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let request = MapBuilder::new()
            .entry(b"request_type", DHT_PUT)
            .entry(b"key", key)
            .entry(b"value", value)
            .build();
        let response = self.round_trip(request).await?;
        match response.get(b"status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            _ => Err(StoreError::Dht("put refused".into())),
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

/// Key/value storage with peer-list awareness.
///
/// A stored value carrying the peer-list tag is treated as a set: a put
/// unions the incoming entries with what is already there, and each entry is
/// stamped on arrival. Reads cull entries whose stamp is older than the TTL,
/// so a node that stops announcing disappears within one TTL window.
/// Untagged values overwrite as usual.
pub struct DhtStorage {
    ttl: Duration,
    inner: Mutex<StorageInner>,
}

#[derive(Default)]
struct StorageInner {
    data: HashMap<Vec<u8>, Vec<u8>>,
    stamps: HashMap<(Vec<u8>, Peer), Instant>,
}

impl DhtStorage {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(StorageInner::default()),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let Some(incoming) = decode_peerlist(value) else {
            inner.data.insert(key.to_vec(), value.to_vec());
            return;
        };

        let now = Instant::now();
        for peer in &incoming {
            inner
                .stamps
                .insert((key.to_vec(), peer.clone()), now);
        }

        let mut merged = inner
            .data
            .get(key)
            .and_then(|existing| decode_peerlist(existing))
            .unwrap_or_default();
        for peer in incoming {
            if !merged.contains(&peer) {
                merged.push(peer);
            }
        }
        inner.data.insert(key.to_vec(), encode_peerlist(&merged));
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let stored = inner.data.get(key)?.clone();
        let Some(peers) = decode_peerlist(&stored) else {
            return Some(stored);
        };

        let ttl = self.ttl;
        let fresh: Vec<Peer> = peers
            .into_iter()
            .filter(|peer| {
                inner
                    .stamps
                    .get(&(key.to_vec(), peer.clone()))
                    .is_some_and(|stamp| stamp.elapsed() < ttl)
            })
            .collect();
        inner
            .stamps
            .retain(|_, stamp| stamp.elapsed() < ttl);

        let culled = encode_peerlist(&fresh);
        inner.data.insert(key.to_vec(), culled.clone());
        Some(culled)
    }
}

/// Serve a [`DhtStorage`] over the codec-framed get/put protocol.
pub async fn serve_dht(
    listener: TcpListener,
    storage: Arc<DhtStorage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("DHT server shutting down");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((mut stream, addr)) => {
                    let storage = storage.clone();
                    tokio::spawn(async move {
                        let mut raw = Vec::new();
                        if stream.read_to_end(&mut raw).await.is_err() {
                            return;
                        }
                        let response = dht_respond(&storage, &raw);
                        let _ = stream.write_all(&response.encode()).await;
                        let _ = stream.shutdown().await;
                        tracing::trace!(%addr, "DHT request served");
                    });
                }
                Err(e) => tracing::warn!(error = %e, "DHT accept failed"),
            }
        }
    }
}

fn dht_respond(storage: &DhtStorage, raw: &[u8]) -> Value {
    let error = |msg: &str| {
        MapBuilder::new()
            .entry(b"status", "error")
            .entry(b"message", msg)
            .build()
    };
    let Ok(request) = Value::decode(raw) else {
        return error("malformed request");
    };
    let Some(key) = request.get(b"key").and_then(Value::as_bytes) else {
        return error("missing key");
    };
    match request.get(b"request_type").and_then(Value::as_int) {
        Some(DHT_GET) => {
            let mut response = MapBuilder::new().entry(b"status", "ok");
            if let Some(value) = storage.get(key) {
                response = response.entry(b"value", value);
            }
            response.build()
        }
        Some(DHT_PUT) => match request.get(b"value").and_then(Value::as_bytes) {
            Some(value) => {
                storage.put(key, value);
                MapBuilder::new().entry(b"status", "ok").build()
            }
            None => error("missing value"),
        },
        _ => error("unknown request type"),
    }
}

// ── Stores over the client ───────────────────────────────────────────────────

pub struct DhtPeerStore {
    node_id: NodeId,
    client: DhtClient,
}

impl DhtPeerStore {
    pub fn new(node_id: NodeId, client: DhtClient) -> Self {
        Self { node_id, client }
    }

    /// Publish a one-entry peer list; the storage layer unions it with
    /// everyone else's announcements under the same drop key.
    pub async fn announce(&self, drop_id: DropId, ip: &str, port: u16) -> Result<(), StoreError> {
        let entry = encode_peerlist(&[Peer::new(self.node_id.to_vec(), ip, port)]);
        self.client.put(&drop_id, &entry).await
    }

    pub async fn request_peers(&self, drop_id: DropId) -> Result<Vec<Peer>, StoreError> {
        let Some(raw) = self.client.get(&drop_id).await? else {
            return Ok(Vec::new());
        };
        decode_peerlist(&raw).ok_or_else(|| StoreError::Dht("stored value is not a peer list".into()))
    }
}

pub struct DhtKeyStore {
    node_id: NodeId,
    client: DhtClient,
}

impl DhtKeyStore {
    pub fn new(node_id: NodeId, client: DhtClient) -> Self {
        Self { node_id, client }
    }

    pub async fn set_key(&self, key_pem: &[u8]) -> Result<(), StoreError> {
        self.client.put(&self.node_id, key_pem).await
    }

    pub async fn request_key(&self, node_id: NodeId) -> Result<Vec<u8>, StoreError> {
        self.client
            .get(&node_id)
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(syncr_core::crypto::b64encode(&node_id)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PEER_AVAILABILITY_TTL;

    fn peer(n: u8, port: u16) -> Peer {
        Peer::new(vec![n; 32], format!("10.0.0.{n}"), port)
    }

    #[test]
    fn raw_values_overwrite() {
        let storage = DhtStorage::new(PEER_AVAILABILITY_TTL);
        storage.put(b"k", b"one");
        storage.put(b"k", b"two");
        assert_eq!(storage.get(b"k"), Some(b"two".to_vec()));
        assert_eq!(storage.get(b"missing"), None);
    }

    #[test]
    fn peerlists_union_not_overwrite() {
        let storage = DhtStorage::new(PEER_AVAILABILITY_TTL);
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        storage.put(b"drop", &encode_peerlist(&[peer(2, 2)]));

        let stored = storage.get(b"drop").unwrap();
        let peers = decode_peerlist(&stored).unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&peer(1, 1)));
        assert!(peers.contains(&peer(2, 2)));
    }

    #[test]
    fn duplicate_announcements_do_not_duplicate() {
        let storage = DhtStorage::new(PEER_AVAILABILITY_TTL);
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        let peers = decode_peerlist(&storage.get(b"drop").unwrap()).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn entries_age_out_after_ttl() {
        let storage = DhtStorage::new(Duration::from_millis(0));
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        std::thread::sleep(Duration::from_millis(2));
        let peers = decode_peerlist(&storage.get(b"drop").unwrap()).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn reannouncement_refreshes_ttl() {
        let storage = DhtStorage::new(Duration::from_secs(60));
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        // Re-announce: still exactly one fresh entry.
        storage.put(b"drop", &encode_peerlist(&[peer(1, 1)]));
        let peers = decode_peerlist(&storage.get(b"drop").unwrap()).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn client_round_trip_through_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let storage = Arc::new(DhtStorage::new(PEER_AVAILABILITY_TTL));
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(serve_dht(listener, storage, rx));

        let client = DhtClient::new(&DhtConfig {
            bootstrap_ips: vec!["127.0.0.1".into()],
            bootstrap_ports: vec![port],
            listen_port: None,
        });

        assert_eq!(client.get(b"nothing").await.unwrap(), None);
        client.put(b"key", b"value").await.unwrap();
        assert_eq!(client.get(b"key").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn peer_store_announce_and_lookup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let storage = Arc::new(DhtStorage::new(PEER_AVAILABILITY_TTL));
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(serve_dht(listener, storage, rx));

        let config = DhtConfig {
            bootstrap_ips: vec!["127.0.0.1".into()],
            bootstrap_ports: vec![port],
            listen_port: None,
        };
        let drop_id = [0x0d; 64];

        let a = DhtPeerStore::new([0xaa; 32], DhtClient::new(&config));
        let b = DhtPeerStore::new([0xbb; 32], DhtClient::new(&config));
        a.announce(drop_id, "10.0.0.1", 100).await.unwrap();
        b.announce(drop_id, "10.0.0.2", 200).await.unwrap();

        let peers = a.request_peers(drop_id).await.unwrap();
        assert_eq!(peers.len(), 2);
    }
}
