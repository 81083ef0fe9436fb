//! The sync orchestrator: reconciling a local drop root with remote state.
//!
//! `sync_drop` drives one drop to (at best) completeness: it resolves peers
//! through the DPS, fetches and verifies metadata, and fans out per-file
//! download tasks. Each file runs a chunk scheduler that asks peers for
//! their chunk lists, reserves disjoint chunk sets per peer per pass, and
//! drains a bounded worker pool into the `.part` file. Everything retries
//! around individual peers; only verification failures abort a sync.
//!
//! Concurrency bounds: one sync per drop, `MAX_CONCURRENT_FILE_DOWNLOADS`
//! file tasks per sync, `MAX_CONCURRENT_CHUNK_DOWNLOADS` chunk tasks per
//! file, and at most `MAX_CHUNKS_PER_PEER` reservations per peer pass.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use syncr_core::crypto;
use syncr_core::types::{DropId, DropVersion, FileId, Peer};

use crate::discovery::{self, StoreError};
use crate::drop_metadata::{drop_metadata_dir, file_metadata_dir, DropMetadata, MetadataError};
use crate::file_metadata::FileMetadata;
use crate::fileio::FileIoError;
use crate::net::{client, NetError};
use crate::node::{Node, NodeError};

pub const MAX_CONCURRENT_FILE_DOWNLOADS: usize = 4;
pub const MAX_CONCURRENT_CHUNK_DOWNLOADS: usize = 8;
pub const MAX_CHUNKS_PER_PEER: usize = 8;

/// Small delay between file-task starts, so tasks hit their (rotated) peer
/// lists out of phase instead of stampeding the first peer.
const FILE_START_STAGGER: Duration = Duration::from_millis(10);

// ── Peer resolution ──────────────────────────────────────────────────────────

/// Resolve the current peer set for a drop through the DPS.
///
/// The order is randomized here once; per-file tasks then rotate it so
/// distinct files start on distinct peers.
pub async fn get_drop_peers(node: &Node, drop_id: DropId) -> Result<Vec<Peer>, SyncError> {
    let dps = discovery::get_drop_peer_store(node).await?;
    let mut peers = dps
        .request_peers(drop_id)
        .await
        .map_err(|e| SyncError::PeerStore(e.to_string()))?;
    // Our own announcement comes back too; asking ourselves is never useful.
    let me = node.node_id();
    peers.retain(|peer| peer.node_id != me);
    if peers.is_empty() {
        return Err(SyncError::PeerStore("no peers advertise this drop".into()));
    }
    peers.shuffle(&mut rand::thread_rng());
    Ok(peers)
}

fn rotate(peers: &[Peer], by: usize) -> Vec<Peer> {
    if peers.is_empty() {
        return Vec::new();
    }
    let split = by % peers.len();
    let mut rotated = peers[split..].to_vec();
    rotated.extend_from_slice(&peers[..split]);
    rotated
}

// ── Metadata acquisition ─────────────────────────────────────────────────────

/// Get a drop metadata record: from the local store if present, otherwise
/// from peers. Remote records go through the full verification pipeline
/// (files hash, header signature via the PKS, lineage policy) before being
/// written to disk; with `version` absent the LATEST pointer is updated.
pub async fn get_drop_metadata(
    node: &Arc<Node>,
    drop_id: DropId,
    peers: &[Peer],
    save_dir: Option<&Path>,
    version: Option<DropVersion>,
) -> Result<DropMetadata, SyncError> {
    // The LRU fronts lookups that have no local store to read from (probes,
    // lineage checks). With a save dir, the disk is authoritative — a cache
    // hit must never short-circuit the write-to-disk below.
    if save_dir.is_none() {
        if let Some(v) = version {
            let mut cache = node.metadata_cache.lock().expect("cache lock poisoned");
            if let Some(hit) = cache.get(&(drop_id, v.version, v.nonce)) {
                return Ok(hit.clone());
            }
        }
    }

    if let Some(dir) = save_dir {
        if let Some(record) = DropMetadata::read(&drop_id, &drop_metadata_dir(dir), version).await? {
            // Local records were verified when they were fetched or created.
            return Ok(record);
        }
    }

    tracing::debug!(
        drop_id = %crypto::b64encode(&drop_id),
        "drop metadata not on disk, fetching from peers"
    );
    let record = client::do_request(peers, |peer| async move {
        client::request_drop_metadata(&peer, drop_id, version).await
    })
    .await?;

    if record.drop_id != drop_id {
        return Err(SyncError::Verification("peer returned a different drop".into()));
    }
    let pks = discovery::get_public_key_store(node).await?;
    let signer_key = pks.request_key(record.signed_by).await?;
    record
        .verify_header(&signer_key)
        .map_err(|_| SyncError::Verification("header signature".into()))?;
    verify_version(node, &record, peers, save_dir).await?;

    if let Some(dir) = save_dir {
        // Repoint LATEST when this is the newest record we know of. Lineage
        // verification also fetches parents; those must never move LATEST
        // backwards.
        let local_latest = DropMetadata::read(&drop_id, &drop_metadata_dir(dir), None).await?;
        let mark_latest = match (&version, &local_latest) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(_), Some(latest)) => record.version.version > latest.version.version,
        };
        record.write(&drop_metadata_dir(dir), mark_latest).await?;
    }
    let v = record.version;
    node.metadata_cache
        .lock()
        .expect("cache lock poisoned")
        .put((drop_id, v.version, v.nonce), record.clone());
    Ok(record)
}

/// Enforce the version-chain policy on a fetched record.
///
/// Roots must be self-signed by the primary owner. A linear bump must be
/// signed from inside the parent's owner set, and only the parent's primary
/// owner may change the owner set. A merge must be signed by the primary
/// owner and may not change ownership across any parent. Parents are
/// resolved through [`get_drop_metadata`], so remote parents verify
/// recursively down to the root.
pub async fn verify_version(
    node: &Arc<Node>,
    record: &DropMetadata,
    peers: &[Peer],
    save_dir: Option<&Path>,
) -> Result<(), SyncError> {
    let fail = |what: &str| Err(SyncError::Verification(what.to_string()));

    match record.previous_versions.len() {
        0 => {
            if record.signed_by != record.primary_owner {
                return fail("root record not signed by the primary owner");
            }
            Ok(())
        }
        1 => {
            let parent_version = record.previous_versions[0];
            if record.version.version <= parent_version.version {
                return fail("version number did not increase");
            }
            let parent = Box::pin(get_drop_metadata(
                node,
                record.drop_id,
                peers,
                save_dir,
                Some(parent_version),
            ))
            .await?;
            if !parent.is_owner(&record.signed_by) {
                return fail("signer is not in the parent's owner set");
            }
            if record.signed_by != parent.primary_owner
                && (record.primary_owner != parent.primary_owner
                    || record.other_owners != parent.other_owners)
            {
                return fail("ownership change not signed by the primary owner");
            }
            Ok(())
        }
        _ => {
            // Merge: several parents.
            if record.signed_by != record.primary_owner {
                return fail("merge not signed by the primary owner");
            }
            for parent_version in &record.previous_versions {
                if record.version.version <= parent_version.version {
                    return fail("version number did not increase");
                }
                let parent = Box::pin(get_drop_metadata(
                    node,
                    record.drop_id,
                    peers,
                    save_dir,
                    Some(*parent_version),
                ))
                .await?;
                if parent.primary_owner != record.primary_owner {
                    return fail("merge changed the primary owner");
                }
            }
            Ok(())
        }
    }
}

/// Get a file metadata record, local-first.
///
/// `file_name` rides along because records are keyed by file ID alone — the
/// same content may live under several names, and the caller decides which
/// name this read is for.
pub async fn get_file_metadata(
    node: &Node,
    drop_id: DropId,
    file_id: FileId,
    save_dir: &Path,
    file_name: &str,
    peers: &[Peer],
) -> Result<FileMetadata, SyncError> {
    let dir = file_metadata_dir(save_dir);
    if let Some(record) = FileMetadata::read(&file_id, &dir).await? {
        return Ok(record);
    }
    tracing::debug!(file_name, "file metadata not on disk, fetching from peers");
    let record = client::do_request(peers, |peer| async move {
        client::request_file_metadata(&peer, drop_id, file_id).await
    })
    .await?;
    record.write(&dir).await?;
    Ok(record)
}

// ── Drop sync ────────────────────────────────────────────────────────────────

/// Synchronize one drop into `save_dir`.
///
/// Returns `(done, drop_id)`: `done` is false when some chunks could not be
/// fetched from any peer — re-invoking retries exactly the missing pieces.
/// Holding the per-drop mutex, so two syncs of one drop never interleave.
pub async fn sync_drop(
    node: &Arc<Node>,
    drop_id: DropId,
    save_dir: &Path,
    version: Option<DropVersion>,
) -> Result<(bool, DropId), SyncError> {
    let lock = node.sync_lock(drop_id);
    let _guard = lock.lock().await;

    tracing::info!(
        drop_id = %crypto::b64encode(&drop_id),
        save_dir = %save_dir.display(),
        "syncing drop"
    );

    let peers = get_drop_peers(node, drop_id).await?;

    tokio::fs::create_dir_all(drop_metadata_dir(save_dir)).await?;
    tokio::fs::create_dir_all(file_metadata_dir(save_dir)).await?;
    node.save_drop_location(drop_id, save_dir).await?;

    let metadata = get_drop_metadata(node, drop_id, &peers, Some(save_dir), version).await?;

    let file_slots = Arc::new(Semaphore::new(MAX_CONCURRENT_FILE_DOWNLOADS));
    let mut tasks: JoinSet<Result<bool, SyncError>> = JoinSet::new();
    for (i, (file_name, file_id)) in metadata.files.iter().enumerate() {
        let node = node.clone();
        let file_name = file_name.clone();
        let file_id = *file_id;
        let save_dir = save_dir.to_path_buf();
        let peers = rotate(&peers, i);
        let file_slots = file_slots.clone();
        tasks.spawn(async move {
            let _permit = file_slots.acquire_owned().await.expect("semaphore never closed");
            tokio::time::sleep(FILE_START_STAGGER * i as u32).await;
            sync_and_finalize_file(&node, drop_id, file_id, &file_name, peers, &save_dir).await
        });
    }

    let mut all_complete = true;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => all_complete = false,
            Ok(Err(e)) if e.is_verification() => return Err(e),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "file sync failed");
                all_complete = false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "file sync task aborted");
                all_complete = false;
            }
        }
    }
    Ok((all_complete, drop_id))
}

/// Sync one file's contents and finalize it if everything arrived.
async fn sync_and_finalize_file(
    node: &Arc<Node>,
    drop_id: DropId,
    file_id: FileId,
    file_name: &str,
    peers: Vec<Peer>,
    save_dir: &Path,
) -> Result<bool, SyncError> {
    let remaining = sync_file_contents(node, drop_id, file_id, file_name, peers, save_dir).await?;
    if remaining.is_empty() {
        node.fileio.mark_complete(&save_dir.join(file_name)).await?;
        tracing::info!(file_name, "file complete");
        Ok(true)
    } else {
        tracing::warn!(
            file_name,
            missing = remaining.len(),
            "file incomplete after exhausting peers"
        );
        Ok(false)
    }
}

/// The per-file chunk scheduler. Returns the chunk IDs still needed — empty
/// means the file's bytes are all on disk (though possibly still `.part`).
pub async fn sync_file_contents(
    node: &Arc<Node>,
    drop_id: DropId,
    file_id: FileId,
    file_name: &str,
    mut peers: Vec<Peer>,
    save_dir: &Path,
) -> Result<HashSet<u64>, SyncError> {
    let metadata = get_file_metadata(node, drop_id, file_id, save_dir, file_name, &peers).await?;
    let full_path = save_dir.join(file_name);

    // The re-hash step: whatever is already intact on disk stays.
    let mut needed = metadata.needed_chunks(&node.fileio, &full_path).await?;
    tracing::debug!(file_name, needed = needed.len(), total = metadata.num_chunks(), "chunks needed");
    let on_disk = node.fileio.is_complete(&full_path).await.is_ok();
    if needed.is_empty() && on_disk {
        return Ok(needed);
    }

    node.fileio.create_file(&full_path, metadata.file_length).await?;
    if needed.is_empty() {
        // Zero-length file: materialized above, nothing to download.
        return Ok(needed);
    }
    let metadata = Arc::new(metadata);
    let mut refreshed_peers = false;

    while !needed.is_empty() {
        // Reservation pass: intersect each peer's chunk list with the
        // working set, claiming at most MAX_CHUNKS_PER_PEER per peer, so
        // two peers never race for the same chunk within a pass.
        let mut reservations: Vec<(Peer, Vec<u64>)> = Vec::new();
        let mut working = needed.clone();
        for peer in &peers {
            if working.is_empty() {
                break;
            }
            let available = match peer_chunk_list(node, peer, drop_id, file_id).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::debug!(ip = %peer.ip, error = %e, "chunk list unavailable");
                    continue;
                }
            };
            let take: Vec<u64> = available
                .into_iter()
                .filter(|index| working.contains(index))
                .take(MAX_CHUNKS_PER_PEER)
                .collect();
            if take.is_empty() {
                // Nothing useful here this pass; the peer stays in rotation.
                continue;
            }
            for index in &take {
                working.remove(index);
            }
            reservations.push((peer.clone(), take));
        }

        if reservations.is_empty() {
            if refreshed_peers {
                break;
            }
            refreshed_peers = true;
            match get_drop_peers(node, drop_id).await {
                Ok(fresh) => peers = fresh,
                Err(e) => {
                    tracing::debug!(error = %e, "peer refresh failed");
                    break;
                }
            }
            continue;
        }

        // Drain the reservations through a bounded worker pool; results
        // flow back over a channel as they land.
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(MAX_CONCURRENT_CHUNK_DOWNLOADS));
        let mut pool = JoinSet::new();
        for (peer, chunk_ids) in reservations {
            for index in chunk_ids {
                let node = node.clone();
                let peer = peer.clone();
                let full_path = full_path.clone();
                let metadata = metadata.clone();
                let workers = workers.clone();
                let result_tx = result_tx.clone();
                pool.spawn(async move {
                    let _permit = workers.acquire_owned().await.expect("semaphore never closed");
                    let result =
                        download_chunk_from_peer(&node, &peer, drop_id, file_id, index, &full_path, &metadata)
                            .await;
                    let _ = result_tx.send((index, peer, result));
                });
            }
        }
        drop(result_tx);

        let mut progressed = false;
        while let Some((index, peer, result)) = result_rx.recv().await {
            match result {
                Ok(()) => {
                    needed.remove(&index);
                    progressed = true;
                }
                Err(SyncError::FileIo(FileIoError::Verification)) => {
                    // Bad bytes from this peer: the chunk stays needed and
                    // its stale chunk list is distrusted.
                    tracing::warn!(index, ip = %peer.ip, "chunk failed verification, retrying elsewhere");
                    node.chunk_list_cache
                        .invalidate(&(peer.ip.clone(), peer.port, file_id));
                }
                Err(e) => {
                    tracing::debug!(index, ip = %peer.ip, error = %e, "chunk download failed");
                }
            }
        }
        while pool.join_next().await.is_some() {}

        if !progressed {
            if refreshed_peers {
                break;
            }
            refreshed_peers = true;
            match get_drop_peers(node, drop_id).await {
                Ok(fresh) => peers = fresh,
                Err(_) => break,
            }
        }
    }

    Ok(needed)
}

/// A peer's chunk list, cached for the availability TTL.
async fn peer_chunk_list(
    node: &Node,
    peer: &Peer,
    drop_id: DropId,
    file_id: FileId,
) -> Result<Vec<u64>, SyncError> {
    let key = (peer.ip.clone(), peer.port, file_id);
    if let Some(cached) = node.chunk_list_cache.get(&key) {
        return Ok(cached);
    }
    let list = client::request_chunk_list(peer, drop_id, file_id).await?;
    node.chunk_list_cache.insert(key, list.clone());
    Ok(list)
}

async fn download_chunk_from_peer(
    node: &Node,
    peer: &Peer,
    drop_id: DropId,
    file_id: FileId,
    index: u64,
    full_path: &Path,
    metadata: &FileMetadata,
) -> Result<(), SyncError> {
    let bytes = client::request_chunk(peer, drop_id, file_id, index).await?;
    node.fileio
        .write_chunk(
            full_path,
            index,
            &bytes,
            &metadata.chunks[index as usize],
            metadata.chunk_size,
        )
        .await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("this node does not own the drop")]
    Permission,

    #[error("peer store lookup failed: {0}")]
    PeerStore(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    FileIo(#[from] FileIoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Hash or signature mismatches are never silently retried — they mean
    /// corruption or an attack, and the containing sync must fail loud.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            SyncError::Verification(_)
                | SyncError::Metadata(MetadataError::Verification(_))
                | SyncError::Net(NetError::Metadata(MetadataError::Verification(_)))
                | SyncError::FileIo(FileIoError::Verification)
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
