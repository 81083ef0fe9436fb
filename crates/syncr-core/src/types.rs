//! Identifiers shared across the whole system.
//!
//! A node owns one long-lived RSA keypair; its node ID is the SHA-256 of the
//! PEM-serialized public key. A drop ID embeds ownership: the primary
//! owner's node ID followed by 32 random bytes. File IDs are content hashes
//! of the full byte stream.

use crate::codec::{CodecError, MapBuilder, Value};

/// A SHA-256 digest.
pub type Digest = [u8; 32];

/// Hash of a node's serialized public key.
pub type NodeId = [u8; 32];

/// Hash of a file's full byte stream.
pub type FileId = [u8; 32];

/// Primary owner's node ID (32 bytes) followed by a random nonce (32 bytes).
pub type DropId = [u8; 64];

pub const NODE_ID_SIZE: usize = 32;
pub const DROP_ID_SIZE: usize = 64;

/// Default per-file chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 23;

/// The node ID half of a drop ID. Informational only — ownership checks
/// always compare the explicit `primary_owner` field, never this prefix.
pub fn drop_id_owner(drop_id: &DropId) -> NodeId {
    let mut owner = [0u8; NODE_ID_SIZE];
    owner.copy_from_slice(&drop_id[..NODE_ID_SIZE]);
    owner
}

/// Parse a drop ID from raw bytes, rejecting anything but exactly 64 bytes.
pub fn drop_id_from_bytes(b: &[u8]) -> Option<DropId> {
    b.try_into().ok()
}

/// Parse a node or file ID from raw bytes (exactly 32).
pub fn id_from_bytes(b: &[u8]) -> Option<[u8; 32]> {
    b.try_into().ok()
}

// ── Drop version ─────────────────────────────────────────────────────────────

/// One record in a drop's lineage: a monotonically increasing version number
/// plus a random nonce distinguishing concurrent siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DropVersion {
    pub version: u64,
    pub nonce: u64,
}

impl DropVersion {
    pub fn new(version: u64, nonce: u64) -> Self {
        Self { version, nonce }
    }

    /// Canonical map form used inside `previous_versions` lists.
    pub fn to_value(&self) -> Value {
        MapBuilder::new()
            .entry(b"nonce", self.nonce)
            .entry(b"version", self.version)
            .build()
    }

    pub fn from_value(v: &Value) -> Result<Self, CodecError> {
        let version = v.get(b"version").and_then(Value::as_int);
        let nonce = v.get(b"nonce").and_then(Value::as_int);
        match (version, nonce) {
            (Some(version), Some(nonce)) => Ok(Self { version, nonce }),
            _ => Err(CodecError::MissingField("version/nonce")),
        }
    }
}

impl std::fmt::Display for DropVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.version, self.nonce)
    }
}

// ── Peer ─────────────────────────────────────────────────────────────────────

/// A peer serving a drop: its node ID plus the address it listens on.
///
/// The node ID is kept as raw bytes — peer lists travel through trackers and
/// DHT nodes that we do not control, and a malformed entry should be
/// filtered, not crash the decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub node_id: Vec<u8>,
    pub ip: String,
    pub port: u16,
}

impl Peer {
    pub fn new(node_id: impl Into<Vec<u8>>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Canonical list form `[node_id, ip, port]` used on the wire.
    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Bytes(self.node_id.clone()),
            Value::from(self.ip.as_str()),
            Value::Int(u64::from(self.port)),
        ])
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        let items = v.as_list()?;
        if items.len() < 3 {
            return None;
        }
        let node_id = items[0].as_bytes()?.to_vec();
        let ip = items[1].as_str()?.to_string();
        let port = u16::try_from(items[2].as_int()?).ok()?;
        Some(Self { node_id, ip, port })
    }
}
