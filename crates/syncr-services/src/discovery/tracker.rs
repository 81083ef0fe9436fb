//! Tracker backend: a single long-lived server that stores peer lists and
//! public keys. The server itself is an external collaborator; this module
//! implements only its wire contract — canonical-codec maps over TCP with
//! the same half-close discipline as the peer protocol.

use serde::Deserialize;

use syncr_core::codec::Value;
use syncr_core::types::{DropId, NodeId, Peer};
use syncr_core::wire::{TrackerRequest, TrackerResponse};

use crate::net::exchange;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackerConfig {
    pub ip: String,
    pub port: u16,
}

/// Send one request to the tracker and parse its `{result, message, data}`
/// response.
pub async fn send_tracker_request(
    request: &TrackerRequest,
    ip: &str,
    port: u16,
) -> Result<TrackerResponse, StoreError> {
    let raw = exchange(ip, port, &request.to_value().encode()).await?;
    let value = Value::decode(&raw).map_err(|e| StoreError::Tracker(e.to_string()))?;
    TrackerResponse::from_value(&value).map_err(|e| StoreError::Tracker(e.to_string()))
}

// ── Peer store ───────────────────────────────────────────────────────────────

pub struct TrackerPeerStore {
    node_id: NodeId,
    ip: String,
    port: u16,
}

impl TrackerPeerStore {
    pub fn new(node_id: NodeId, config: TrackerConfig) -> Self {
        Self {
            node_id,
            ip: config.ip,
            port: config.port,
        }
    }

    pub async fn announce(&self, drop_id: DropId, ip: &str, port: u16) -> Result<(), StoreError> {
        let request = TrackerRequest::PostPeer {
            drop_id,
            peer: Peer::new(self.node_id.to_vec(), ip, port),
        };
        let response = send_tracker_request(&request, &self.ip, self.port).await?;
        if response.ok {
            Ok(())
        } else {
            Err(StoreError::Tracker(response.message))
        }
    }

    pub async fn request_peers(&self, drop_id: DropId) -> Result<Vec<Peer>, StoreError> {
        let request = TrackerRequest::GetPeers { drop_id };
        let response = send_tracker_request(&request, &self.ip, self.port).await?;
        if !response.ok {
            return Err(StoreError::Tracker(response.message));
        }
        let Some(data) = response.data else {
            return Ok(Vec::new());
        };
        let Some(entries) = data.as_list() else {
            return Err(StoreError::Tracker("peer list is not a list".into()));
        };
        // Entries the tracker mangled are dropped, not fatal.
        Ok(entries.iter().filter_map(Peer::from_value).collect())
    }
}

// ── Key store ────────────────────────────────────────────────────────────────

pub struct TrackerKeyStore {
    node_id: NodeId,
    ip: String,
    port: u16,
}

impl TrackerKeyStore {
    pub fn new(node_id: NodeId, config: TrackerConfig) -> Self {
        Self {
            node_id,
            ip: config.ip,
            port: config.port,
        }
    }

    /// Publish this node's public key under its own node ID.
    pub async fn set_key(&self, key_pem: &[u8]) -> Result<(), StoreError> {
        let request = TrackerRequest::PostKey {
            node_id: self.node_id.to_vec(),
            key: key_pem.to_vec(),
        };
        let response = send_tracker_request(&request, &self.ip, self.port).await?;
        if response.ok {
            Ok(())
        } else {
            Err(StoreError::Tracker(response.message))
        }
    }

    /// Fetch the raw PEM bytes published for a node.
    pub async fn request_key(&self, node_id: NodeId) -> Result<Vec<u8>, StoreError> {
        let request = TrackerRequest::GetKey {
            node_id: node_id.to_vec(),
        };
        let response = send_tracker_request(&request, &self.ip, self.port).await?;
        if !response.ok {
            return Err(StoreError::KeyNotFound(syncr_core::crypto::b64encode(&node_id)));
        }
        response
            .data
            .as_ref()
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StoreError::KeyNotFound(syncr_core::crypto::b64encode(&node_id)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
