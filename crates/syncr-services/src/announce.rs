//! Peer availability announcer.
//!
//! A background task re-publishes this node's peer entry for every local
//! drop on a period comfortably inside the availability TTL, so entries
//! never age out while the node is up. Announcing publishes intent to
//! serve — it says nothing about download completeness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use syncr_core::crypto;

use crate::discovery::{self, StoreError, PEER_AVAILABILITY_TTL};
use crate::node::Node;

/// Re-announce period: `TTL/2 - 1` seconds.
pub const ANNOUNCE_INTERVAL: Duration =
    Duration::from_secs(PEER_AVAILABILITY_TTL.as_secs() / 2 - 1);

/// Publish this node's public key to the PKS. Run once at startup so peers
/// can verify records we sign.
pub async fn send_my_pub_key(node: &Node) -> Result<(), StoreError> {
    let pks = discovery::get_public_key_store(node).await?;
    let pem = crypto::dump_public_key(node.keypair().public())?;
    pks.set_key(&pem).await
}

/// Announce every local drop until the shutdown flag flips.
pub async fn announce_loop(
    node: Arc<Node>,
    ip: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = announce_all(&node, &ip, port).await {
            tracing::warn!(error = %e, "announce pass failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("announcer shutting down");
                    return;
                }
            }
        }
    }
}

async fn announce_all(node: &Node, ip: &str, port: u16) -> Result<(), StoreError> {
    let dps = discovery::get_drop_peer_store(node).await?;
    let drops = node.list_drops().await.map_err(|e| {
        StoreError::Io(std::io::Error::other(e))
    })?;
    tracing::debug!(count = drops.len(), "announcing local drops");
    for drop_id in drops {
        if let Err(e) = dps.announce(drop_id, ip, port).await {
            tracing::warn!(
                drop_id = %crypto::b64encode(&drop_id),
                error = %e,
                "announce failed"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_sits_inside_the_ttl() {
        assert!(ANNOUNCE_INTERVAL * 2 < PEER_AVAILABILITY_TTL);
        assert_eq!(ANNOUNCE_INTERVAL, Duration::from_secs(149));
    }
}
