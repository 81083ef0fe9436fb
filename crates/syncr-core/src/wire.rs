//! syncr wire format — typed request/response messages between peers, plus
//! the tracker client contract.
//!
//! Everything on the wire is a canonical-codec map. A connection carries one
//! request: the client writes the encoded map, half-closes its write side,
//! reads the encoded response to EOF, and closes. Request dispatch keys off
//! an explicit `request_type` integer; responses carry `status: "ok"` with a
//! payload or `status: "error"` with a numeric code.

use thiserror::Error;

use crate::codec::{CodecError, MapBuilder, Value};
use crate::types::{drop_id_from_bytes, id_from_bytes, DropId, DropVersion, FileId, Peer};

/// Version of the peer protocol spoken by this build.
pub const PROTOCOL_VERSION: u64 = 1;

// Request type codes.
pub const REQUEST_DROP_METADATA: u64 = 1;
pub const REQUEST_FILE_METADATA: u64 = 2;
pub const REQUEST_CHUNK_LIST: u64 = 3;
pub const REQUEST_CHUNK: u64 = 4;
pub const REQUEST_NEW_DROP_METADATA: u64 = 5;

// ── Error codes ──────────────────────────────────────────────────────────────

/// Numeric error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    /// Requested drop, version, file, or chunk is unknown to the server.
    NotExist = 0,
    /// Protocol version mismatch.
    IncompatibleProtocol = 1,
    /// Request map was malformed.
    InvalidInput = 2,
    /// Anything else went wrong server-side.
    Exception = 3,
}

impl TryFrom<u64> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u64) -> Result<Self, WireError> {
        match value {
            0 => Ok(ErrorCode::NotExist),
            1 => Ok(ErrorCode::IncompatibleProtocol),
            2 => Ok(ErrorCode::InvalidInput),
            3 => Ok(ErrorCode::Exception),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

// ── Peer requests ────────────────────────────────────────────────────────────

/// A typed peer-protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Fetch a drop metadata record; latest when `version` is absent.
    DropMetadata {
        drop_id: DropId,
        version: Option<DropVersion>,
    },
    /// Fetch a file metadata record.
    FileMetadata { drop_id: DropId, file_id: FileId },
    /// List the chunk indices the server holds locally for a file.
    ChunkList { drop_id: DropId, file_id: FileId },
    /// Fetch one raw chunk.
    Chunk {
        drop_id: DropId,
        file_id: FileId,
        index: u64,
    },
    /// Reserved notification that a new version exists. Servers log it and
    /// answer NotExist; nothing dispatches on the payload yet.
    NewDropMetadata {
        drop_id: DropId,
        latest: DropVersion,
    },
}

impl Request {
    pub fn to_value(&self) -> Value {
        let builder = MapBuilder::new().entry(b"protocol_version", PROTOCOL_VERSION);
        match self {
            Request::DropMetadata { drop_id, version } => {
                let mut b = builder
                    .entry(b"request_type", REQUEST_DROP_METADATA)
                    .entry(b"drop_id", drop_id.as_slice());
                if let Some(v) = version {
                    b = b.entry(b"version", v.version).entry(b"nonce", v.nonce);
                }
                b.build()
            }
            Request::FileMetadata { drop_id, file_id } => builder
                .entry(b"request_type", REQUEST_FILE_METADATA)
                .entry(b"drop_id", drop_id.as_slice())
                .entry(b"file_id", file_id.as_slice())
                .build(),
            Request::ChunkList { drop_id, file_id } => builder
                .entry(b"request_type", REQUEST_CHUNK_LIST)
                .entry(b"drop_id", drop_id.as_slice())
                .entry(b"file_id", file_id.as_slice())
                .build(),
            Request::Chunk {
                drop_id,
                file_id,
                index,
            } => builder
                .entry(b"request_type", REQUEST_CHUNK)
                .entry(b"drop_id", drop_id.as_slice())
                .entry(b"file_id", file_id.as_slice())
                .entry(b"index", *index)
                .build(),
            Request::NewDropMetadata { drop_id, latest } => builder
                .entry(b"request_type", REQUEST_NEW_DROP_METADATA)
                .entry(b"drop_id", drop_id.as_slice())
                .entry(b"latest_version", latest.version)
                .entry(b"latest_nonce", latest.nonce)
                .build(),
        }
    }

    /// Parse and validate an incoming request map.
    ///
    /// The protocol version is checked first: a mismatch is
    /// [`WireError::IncompatibleProtocol`] regardless of the rest of the map.
    pub fn from_value(v: &Value) -> Result<Self, WireError> {
        let protocol = v
            .get(b"protocol_version")
            .and_then(Value::as_int)
            .ok_or(WireError::Malformed("protocol_version"))?;
        if protocol != PROTOCOL_VERSION {
            return Err(WireError::IncompatibleProtocol(protocol));
        }

        let request_type = v
            .get(b"request_type")
            .and_then(Value::as_int)
            .ok_or(WireError::Malformed("request_type"))?;

        let drop_id = v
            .get(b"drop_id")
            .and_then(Value::as_bytes)
            .and_then(drop_id_from_bytes)
            .ok_or(WireError::Malformed("drop_id"))?;

        let file_id = || {
            v.get(b"file_id")
                .and_then(Value::as_bytes)
                .and_then(id_from_bytes)
                .ok_or(WireError::Malformed("file_id"))
        };

        match request_type {
            REQUEST_DROP_METADATA => {
                let version = v.get(b"version").and_then(Value::as_int);
                let nonce = v.get(b"nonce").and_then(Value::as_int);
                let version = match (version, nonce) {
                    (Some(version), Some(nonce)) => Some(DropVersion::new(version, nonce)),
                    (None, None) => None,
                    _ => return Err(WireError::Malformed("version/nonce")),
                };
                Ok(Request::DropMetadata { drop_id, version })
            }
            REQUEST_FILE_METADATA => Ok(Request::FileMetadata {
                drop_id,
                file_id: file_id()?,
            }),
            REQUEST_CHUNK_LIST => Ok(Request::ChunkList {
                drop_id,
                file_id: file_id()?,
            }),
            REQUEST_CHUNK => Ok(Request::Chunk {
                drop_id,
                file_id: file_id()?,
                index: v
                    .get(b"index")
                    .and_then(Value::as_int)
                    .ok_or(WireError::Malformed("index"))?,
            }),
            REQUEST_NEW_DROP_METADATA => {
                let version = v
                    .get(b"latest_version")
                    .and_then(Value::as_int)
                    .ok_or(WireError::Malformed("latest_version"))?;
                let nonce = v
                    .get(b"latest_nonce")
                    .and_then(Value::as_int)
                    .ok_or(WireError::Malformed("latest_nonce"))?;
                Ok(Request::NewDropMetadata {
                    drop_id,
                    latest: DropVersion::new(version, nonce),
                })
            }
            other => Err(WireError::UnknownRequestType(other)),
        }
    }
}

// ── Peer responses ───────────────────────────────────────────────────────────

/// A peer-protocol response: an `ok` payload or a numeric error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Value),
    Error(ErrorCode),
}

impl Response {
    pub fn to_value(&self) -> Value {
        match self {
            Response::Ok(payload) => MapBuilder::new()
                .entry(b"status", "ok")
                .entry(b"response", payload.clone())
                .build(),
            Response::Error(code) => MapBuilder::new()
                .entry(b"status", "error")
                .entry(b"error", *code as u64)
                .build(),
        }
    }

    pub fn from_value(v: &Value) -> Result<Self, WireError> {
        match v.get(b"status").and_then(Value::as_str) {
            Some("ok") => {
                let payload = v
                    .get(b"response")
                    .ok_or(WireError::Malformed("response"))?
                    .clone();
                Ok(Response::Ok(payload))
            }
            Some("error") => {
                let code = v
                    .get(b"error")
                    .and_then(Value::as_int)
                    .ok_or(WireError::Malformed("error"))?;
                Ok(Response::Error(ErrorCode::try_from(code)?))
            }
            _ => Err(WireError::Malformed("status")),
        }
    }
}

// ── Tracker contract ─────────────────────────────────────────────────────────

// Tracker request type codes.
pub const TRACKER_GET_KEY: u64 = 0;
pub const TRACKER_POST_KEY: u64 = 1;
pub const TRACKER_GET_PEERS: u64 = 2;
pub const TRACKER_POST_PEER: u64 = 3;

pub const TRACKER_OK: &str = "OK";
pub const TRACKER_ERROR: &str = "ERROR";

/// A request to the tracker. The tracker server itself is an external
/// collaborator; only this wire contract is ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    GetKey { node_id: Vec<u8> },
    PostKey { node_id: Vec<u8>, key: Vec<u8> },
    GetPeers { drop_id: DropId },
    PostPeer { drop_id: DropId, peer: Peer },
}

impl TrackerRequest {
    pub fn to_value(&self) -> Value {
        match self {
            TrackerRequest::GetKey { node_id } => MapBuilder::new()
                .entry(b"request_type", TRACKER_GET_KEY)
                .entry(b"node_id", node_id.clone())
                .build(),
            TrackerRequest::PostKey { node_id, key } => MapBuilder::new()
                .entry(b"request_type", TRACKER_POST_KEY)
                .entry(b"node_id", node_id.clone())
                .entry(b"data", key.clone())
                .build(),
            TrackerRequest::GetPeers { drop_id } => MapBuilder::new()
                .entry(b"request_type", TRACKER_GET_PEERS)
                .entry(b"drop_id", drop_id.as_slice())
                .build(),
            TrackerRequest::PostPeer { drop_id, peer } => MapBuilder::new()
                .entry(b"request_type", TRACKER_POST_PEER)
                .entry(b"drop_id", drop_id.as_slice())
                .entry(b"data", peer.to_value())
                .build(),
        }
    }
}

/// A tracker response: `{result: "OK"|"ERROR", message, data?}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub ok: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl TrackerResponse {
    pub fn from_value(v: &Value) -> Result<Self, WireError> {
        let result = v
            .get(b"result")
            .and_then(Value::as_str)
            .ok_or(WireError::Malformed("result"))?;
        let ok = match result {
            TRACKER_OK => true,
            TRACKER_ERROR => false,
            _ => return Err(WireError::Malformed("result")),
        };
        let message = v
            .get(b"message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            ok,
            message,
            data: v.get(b"data").cloned(),
        })
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown request type {0}")]
    UnknownRequestType(u64),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u64),

    #[error("peer speaks protocol version {0}, we speak {PROTOCOL_VERSION}")]
    IncompatibleProtocol(u64),

    #[error("malformed message: missing or mistyped {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ── Tests ────────────────────────────────────────────────────────────────────
