//! Drop lifecycle: initialization, change detection, and new versions.
//!
//! A drop only ever changes by appending a version. `make_new_version`
//! re-walks the directory, rebuilds every file record, and writes a new
//! signed header whose `previous_versions` names the old LATEST. Change
//! detection compares a fresh walk against the LATEST record without
//! writing anything.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use syncr_core::crypto;
use syncr_core::types::{DropId, DropVersion, NodeId};

use crate::drop_metadata::{
    drop_metadata_dir, file_metadata_dir, gen_drop_id, DropMetadata,
};
use crate::file_metadata::{make_file_metadata, FileMetadata};
use crate::fileio::walk_with_ignore;
use crate::node::Node;
use crate::sync::{self, SyncError};

/// Files classified by a walk against the LATEST record.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DropChanges {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl DropChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Walk a drop directory and build fresh metadata for everything in it.
async fn walk_drop_files(
    directory: &Path,
    drop_id: DropId,
) -> Result<BTreeMap<String, FileMetadata>, SyncError> {
    let mut records = BTreeMap::new();
    for (rel_dir, file_name) in walk_with_ignore(directory, &[])? {
        let rel_path = rel_dir.join(&file_name);
        let name = rel_path.to_string_lossy().into_owned();
        let record = make_file_metadata(&directory.join(&rel_path), drop_id).await?;
        records.insert(name, record);
    }
    Ok(records)
}

async fn write_all_metadata(
    save_dir: &Path,
    record: &DropMetadata,
    files: &BTreeMap<String, FileMetadata>,
) -> Result<(), SyncError> {
    let file_dir = file_metadata_dir(save_dir);
    for file_record in files.values() {
        file_record.write(&file_dir).await?;
    }
    record.write(&drop_metadata_dir(save_dir), true).await?;
    Ok(())
}

// ── Drop initialization ──────────────────────────────────────────────────────

/// Initialize a drop from a directory: generate the drop ID, build and sign
/// all metadata, and register the save path. The directory's basename
/// becomes the drop name unless one is given.
pub async fn initialize_drop(
    node: &Arc<Node>,
    directory: &Path,
    name: Option<&str>,
) -> Result<DropId, SyncError> {
    let owner = node.node_id();
    let drop_id = gen_drop_id(&owner);
    let name = match name {
        Some(name) => name.to_string(),
        None => directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drop".to_string()),
    };

    let files = walk_drop_files(directory, drop_id).await?;
    let mut record = DropMetadata::new(
        drop_id,
        name,
        DropVersion::new(1, crypto::random_nonce()),
        Vec::new(),
        owner,
        BTreeMap::new(),
        owner,
        files.iter().map(|(n, fm)| (n.clone(), fm.file_id)).collect(),
    );
    record.sign(node.keypair().private())?;

    write_all_metadata(directory, &record, &files).await?;
    node.save_drop_location(drop_id, directory).await?;
    tracing::info!(
        drop_id = %crypto::b64encode(&drop_id),
        files = files.len(),
        "drop initialized"
    );
    Ok(drop_id)
}

// ── Change detection ─────────────────────────────────────────────────────────

/// Compare the drop directory against the local LATEST record.
pub async fn check_for_changes(node: &Arc<Node>, drop_id: DropId) -> Result<DropChanges, SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    let current = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None)
        .await?
        .ok_or(SyncError::Verification("no local record for drop".into()))?;

    let on_disk = walk_drop_files(&save_dir, drop_id).await?;
    let mut changes = DropChanges::default();
    for (name, record) in &on_disk {
        match current.files.get(name) {
            None => {
                changes.added.insert(name.clone());
            }
            Some(known) if *known == record.file_id => {
                changes.unchanged.insert(name.clone());
            }
            Some(_) => {
                changes.changed.insert(name.clone());
            }
        }
    }
    for name in current.files.keys() {
        if !on_disk.contains_key(name) {
            changes.removed.insert(name.clone());
        }
    }
    Ok(changes)
}

/// Ask peers for the newest drop metadata and compare against the local
/// LATEST.
///
/// Strictly newer: `(remote, true)`. Same version, same nonce: `(remote,
/// false)`. Same version, different nonce: a conflict — two lineages claim
/// the same slot, and that is surfaced as a verification error for
/// higher-level handling, never merged silently.
pub async fn check_for_update(
    node: &Arc<Node>,
    drop_id: DropId,
) -> Result<(DropMetadata, bool), SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    let local = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None)
        .await?
        .ok_or(SyncError::Verification("no local record for drop".into()))?;

    let peers = sync::get_drop_peers(node, drop_id).await?;
    // No save dir: probe without touching the local LATEST pointer.
    let remote = sync::get_drop_metadata(node, drop_id, &peers, None, None).await?;

    if remote.version.version > local.version.version {
        return Ok((remote, true));
    }
    if remote.version.version == local.version.version && remote.version.nonce != local.version.nonce
    {
        return Err(SyncError::Verification(
            "same version, different nonce".into(),
        ));
    }
    Ok((remote, false))
}

// ── New versions ─────────────────────────────────────────────────────────────

/// Create and store a new version from the current on-disk state.
///
/// Fails with a permission error unless this node is an owner; changing the
/// owner set additionally requires being the primary owner, since peers
/// will reject an ownership transition signed by anyone else.
pub async fn make_new_version(
    node: &Arc<Node>,
    drop_id: DropId,
    add_owner: Option<NodeId>,
    remove_owner: Option<NodeId>,
) -> Result<DropMetadata, SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    let current = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None)
        .await?
        .ok_or(SyncError::Verification("no local record for drop".into()))?;

    let me = node.node_id();
    if !current.is_owner(&me) {
        return Err(SyncError::Permission);
    }

    let mut other_owners = current.other_owners.clone();
    if add_owner.is_some() || remove_owner.is_some() {
        if me != current.primary_owner {
            return Err(SyncError::Permission);
        }
        if let Some(id) = add_owner {
            other_owners.insert(id, 1);
        }
        if let Some(id) = remove_owner {
            other_owners.remove(&id);
        }
    }

    let files = walk_drop_files(&save_dir, drop_id).await?;
    let mut record = DropMetadata::new(
        drop_id,
        current.name.clone(),
        DropVersion::new(current.version.version + 1, crypto::random_nonce()),
        vec![current.version],
        current.primary_owner,
        other_owners,
        me,
        files.iter().map(|(n, fm)| (n.clone(), fm.file_id)).collect(),
    );
    record.sign(node.keypair().private())?;

    // Replace the file-metadata directory wholesale: records for files that
    // no longer exist must not linger.
    let file_dir = file_metadata_dir(&save_dir);
    if file_dir.exists() {
        tokio::fs::remove_dir_all(&file_dir).await?;
    }
    write_all_metadata(&save_dir, &record, &files).await?;
    tracing::info!(
        drop_id = %crypto::b64encode(&drop_id),
        version = %record.version,
        "new version created"
    );
    Ok(record)
}

// ── Removal ──────────────────────────────────────────────────────────────────

/// Delete a drop locally: the registry entry and the drop directory. The
/// lineage lives on wherever else it is subscribed.
pub async fn delete_drop(node: &Arc<Node>, drop_id: DropId) -> Result<(), SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    node.remove_drop_location(drop_id).await?;
    if save_dir.exists() {
        tokio::fs::remove_dir_all(&save_dir).await?;
    }
    tracing::info!(drop_id = %crypto::b64encode(&drop_id), "drop deleted");
    Ok(())
}

/// Stop serving and tracking a drop but leave its files in place.
pub async fn unsubscribe(node: &Arc<Node>, drop_id: DropId) -> Result<(), SyncError> {
    node.remove_drop_location(drop_id).await?;
    tracing::info!(drop_id = %crypto::b64encode(&drop_id), "unsubscribed");
    Ok(())
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Full local verification pass: every file in the LATEST record is
/// complete on disk and every chunk hashes to its metadata entry.
pub async fn check_drop(node: &Arc<Node>, drop_id: DropId) -> Result<bool, SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    let record = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None)
        .await?
        .ok_or(SyncError::Verification("no local record for drop".into()))?;

    for (name, file_id) in &record.files {
        let full_path = save_dir.join(name);
        match node.fileio.is_complete(&full_path).await {
            Ok(true) => {}
            Ok(false) | Err(crate::fileio::FileIoError::NotFound(_)) => {
                tracing::info!(name, "file missing or incomplete");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(metadata) = FileMetadata::read(file_id, &file_metadata_dir(&save_dir)).await?
        else {
            tracing::info!(name, "file metadata missing");
            return Ok(false);
        };
        let downloaded = metadata.downloaded_chunks(&node.fileio, &full_path).await?;
        if downloaded.len() as u64 != metadata.num_chunks() {
            tracing::info!(
                name,
                intact = downloaded.len(),
                expected = metadata.num_chunks(),
                "chunks failed re-hash"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

// ── Tests ────────────────────────────────────────────────────────────────────
