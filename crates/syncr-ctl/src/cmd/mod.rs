pub mod configs;
pub mod dht;
pub mod drops;
pub mod node;

use anyhow::{Context, Result};

use syncr_core::crypto;
use syncr_core::types::{drop_id_from_bytes, DropId};

/// Parse a base64 drop ID argument.
pub fn parse_drop_id(text: &str) -> Result<DropId> {
    let raw = crypto::b64decode(text).context("drop ID is not valid base64")?;
    drop_id_from_bytes(&raw).context("drop ID must decode to exactly 64 bytes")
}
