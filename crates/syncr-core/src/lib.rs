//! syncr-core — canonical codec, cryptographic primitives, and wire types.
//! All other syncr crates depend on this one.

pub mod codec;
pub mod crypto;
pub mod types;
pub mod wire;

pub use types::{Digest, DropId, DropVersion, FileId, NodeId, Peer};
