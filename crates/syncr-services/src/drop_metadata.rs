//! Drop metadata records: the signed, versioned header of a drop.
//!
//! One record exists per known version, content-addressed on disk by
//! `(drop_id, version, nonce)`, with a LATEST pointer naming the newest. A
//! record is immutable once written; a drop only changes by appending a new
//! version whose `previous_versions` names its parents.
//!
//! The decode pipeline preserves the invariants: canonical decode, then the
//! `files_hash` recomputation, then (with the signer's public key) the
//! header signature over the blanked header. Records that fail any step
//! never reach the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use syncr_core::codec::{CodecError, MapBuilder, Value};
use syncr_core::crypto::{self, CryptoError, PrivateKey, PublicKey};
use syncr_core::types::{drop_id_from_bytes, id_from_bytes, Digest, DropId, DropVersion, FileId, NodeId};
use syncr_core::wire::PROTOCOL_VERSION;

/// Per-drop metadata directory, rooted inside the drop's save dir.
pub const METADATA_DIR: &str = ".syncr";
pub const DROP_METADATA_SUBDIR: &str = "drop";
pub const FILE_METADATA_SUBDIR: &str = "files";

const LATEST: &str = "LATEST";

pub fn drop_metadata_dir(save_dir: &Path) -> PathBuf {
    save_dir.join(METADATA_DIR).join(DROP_METADATA_SUBDIR)
}

pub fn file_metadata_dir(save_dir: &Path) -> PathBuf {
    save_dir.join(METADATA_DIR).join(FILE_METADATA_SUBDIR)
}

/// Generate a drop ID for a new drop: owner node ID followed by 32 random
/// bytes. The prefix is informational; ownership checks always use the
/// explicit `primary_owner` field.
pub fn gen_drop_id(first_owner: &NodeId) -> DropId {
    let mut id = [0u8; 64];
    id[..32].copy_from_slice(first_owner);
    id[32..].copy_from_slice(&crypto::random_bytes());
    id
}

// ── Record ───────────────────────────────────────────────────────────────────

/// One version record of a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropMetadata {
    pub drop_id: DropId,
    pub name: String,
    pub version: DropVersion,
    /// At most one parent for a linear bump; several only for merges.
    pub previous_versions: Vec<DropVersion>,
    pub primary_owner: NodeId,
    /// Secondary owners. The value is an opaque capability tag — presence
    /// in the map is what denotes ownership.
    pub other_owners: BTreeMap<NodeId, u64>,
    /// Signer of this record. Must be in the owner set.
    pub signed_by: NodeId,
    /// Relative path → file ID. The same file ID may appear under several
    /// names: records are keyed by content, not by name.
    pub files: BTreeMap<String, FileId>,
    pub protocol_version: u64,
    files_hash: Option<Digest>,
    signature: Option<Vec<u8>>,
}

impl DropMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drop_id: DropId,
        name: String,
        version: DropVersion,
        previous_versions: Vec<DropVersion>,
        primary_owner: NodeId,
        other_owners: BTreeMap<NodeId, u64>,
        signed_by: NodeId,
        files: BTreeMap<String, FileId>,
    ) -> Self {
        Self {
            drop_id,
            name,
            version,
            previous_versions,
            primary_owner,
            other_owners,
            signed_by,
            files,
            protocol_version: PROTOCOL_VERSION,
            files_hash: None,
            signature: None,
        }
    }

    /// Is this node ID in the owner set (primary or secondary)?
    pub fn is_owner(&self, node_id: &NodeId) -> bool {
        self.primary_owner == *node_id || self.other_owners.contains_key(node_id)
    }

    /// First name the given file ID appears under, if any.
    pub fn file_name_for(&self, file_id: &FileId) -> Option<&str> {
        self.files
            .iter()
            .find(|(_, id)| *id == file_id)
            .map(|(name, _)| name.as_str())
    }

    fn files_value(&self) -> Value {
        let mut map = BTreeMap::new();
        for (name, id) in &self.files {
            map.insert(name.clone().into_bytes(), Value::Bytes(id.to_vec()));
        }
        Value::Dict(map)
    }

    /// Hash of the canonicalized `files` map. Denormalized into the header
    /// so the header signature also covers the file listing.
    pub fn files_hash(&self) -> Digest {
        match self.files_hash {
            Some(h) => h,
            None => crypto::hash_value(&self.files_value()),
        }
    }

    fn verify_files_hash(&self) -> Result<(), MetadataError> {
        let stored = self
            .files_hash
            .ok_or(MetadataError::Verification("files_hash missing"))?;
        if stored != crypto::hash_value(&self.files_value()) {
            return Err(MetadataError::Verification("files_hash mismatch"));
        }
        Ok(())
    }

    fn header_with(&self, signature: &[u8], files: Value) -> Value {
        let mut owners = BTreeMap::new();
        for (id, tag) in &self.other_owners {
            owners.insert(id.to_vec(), Value::Int(*tag));
        }
        MapBuilder::new()
            .entry(b"protocol_version", self.protocol_version)
            .entry(b"drop_id", self.drop_id.as_slice())
            .entry(b"name", self.name.as_str())
            .entry(b"version", self.version.version)
            .entry(b"version_nonce", self.version.nonce)
            .entry(
                b"previous_versions",
                Value::List(self.previous_versions.iter().map(DropVersion::to_value).collect()),
            )
            .entry(b"primary_owner", self.primary_owner.as_slice())
            .entry(b"other_owners", Value::Dict(owners))
            .entry(b"header_signature", signature)
            .entry(b"signed_by", self.signed_by.as_slice())
            .entry(b"files_hash", self.files_hash().as_slice())
            .entry(b"files", files)
            .build()
    }

    /// The signature input: the header with `header_signature` blanked and
    /// `files` emptied.
    pub fn unsigned_header(&self) -> Value {
        self.header_with(b"", Value::Dict(BTreeMap::new()))
    }

    /// Sign this record as `signed_by`.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), MetadataError> {
        self.files_hash = Some(self.files_hash());
        self.signature = Some(crypto::sign_value(key, &self.unsigned_header())?);
        Ok(())
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Verify the header signature against the signer's public key.
    pub fn verify_header(&self, key: &PublicKey) -> Result<(), MetadataError> {
        let signature = self.signature.as_deref().ok_or(MetadataError::Unsigned)?;
        crypto::verify_value(key, signature, &self.unsigned_header())
            .map_err(|_| MetadataError::Verification("header signature"))
    }

    /// Encode the full record, file listing included. The record must have
    /// been signed.
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        let signature = self.signature.as_deref().ok_or(MetadataError::Unsigned)?;
        Ok(self.header_with(signature, self.files_value()).encode())
    }

    /// Decode a record and check every locally checkable invariant: the
    /// canonical form, the `files_hash` recomputation, and signer membership
    /// in the owner set. The header signature still needs the signer's key —
    /// callers fetch it from the PKS and call [`DropMetadata::verify_header`].
    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        let value = Value::decode(bytes)?;
        let field = |name: &'static str, key: &[u8]| {
            value.get(key).ok_or(MetadataError::Missing(name))
        };

        let drop_id = field("drop_id", b"drop_id")?
            .as_bytes()
            .and_then(drop_id_from_bytes)
            .ok_or(MetadataError::Missing("drop_id"))?;
        let name = field("name", b"name")?
            .as_str()
            .ok_or(MetadataError::Missing("name"))?
            .to_string();
        let version = DropVersion::new(
            field("version", b"version")?
                .as_int()
                .ok_or(MetadataError::Missing("version"))?,
            field("version_nonce", b"version_nonce")?
                .as_int()
                .ok_or(MetadataError::Missing("version_nonce"))?,
        );

        let mut previous_versions = Vec::new();
        for entry in field("previous_versions", b"previous_versions")?
            .as_list()
            .ok_or(MetadataError::Missing("previous_versions"))?
        {
            previous_versions.push(DropVersion::from_value(entry)?);
        }

        let primary_owner = field("primary_owner", b"primary_owner")?
            .as_bytes()
            .and_then(id_from_bytes)
            .ok_or(MetadataError::Missing("primary_owner"))?;

        let mut other_owners = BTreeMap::new();
        for (key, tag) in field("other_owners", b"other_owners")?
            .as_dict()
            .ok_or(MetadataError::Missing("other_owners"))?
        {
            let id = id_from_bytes(key).ok_or(MetadataError::Missing("other_owners key"))?;
            let tag = tag.as_int().ok_or(MetadataError::Missing("other_owners tag"))?;
            other_owners.insert(id, tag);
        }

        let signed_by = field("signed_by", b"signed_by")?
            .as_bytes()
            .and_then(id_from_bytes)
            .ok_or(MetadataError::Missing("signed_by"))?;

        let signature = field("header_signature", b"header_signature")?
            .as_bytes()
            .ok_or(MetadataError::Missing("header_signature"))?
            .to_vec();
        if signature.is_empty() {
            return Err(MetadataError::Unsigned);
        }

        let files_hash = field("files_hash", b"files_hash")?
            .as_bytes()
            .and_then(id_from_bytes)
            .ok_or(MetadataError::Missing("files_hash"))?;

        let mut files = BTreeMap::new();
        for (key, id) in field("files", b"files")?
            .as_dict()
            .ok_or(MetadataError::Missing("files"))?
        {
            let name = String::from_utf8(key.clone())
                .map_err(|_| MetadataError::Missing("files key"))?;
            let id = id
                .as_bytes()
                .and_then(id_from_bytes)
                .ok_or(MetadataError::Missing("files value"))?;
            files.insert(name, id);
        }

        let record = Self {
            drop_id,
            name,
            version,
            previous_versions,
            primary_owner,
            other_owners,
            signed_by,
            files,
            protocol_version: field("protocol_version", b"protocol_version")?
                .as_int()
                .ok_or(MetadataError::Missing("protocol_version"))?,
            files_hash: Some(files_hash),
            signature: Some(signature),
        };

        record.verify_files_hash()?;
        if !record.is_owner(&record.signed_by) {
            return Err(MetadataError::Verification("signer is not an owner"));
        }
        Ok(record)
    }

    // ── On-disk layout ───────────────────────────────────────────────────────

    /// Record file name: `<b64(drop_id)>_<version>_<nonce>`.
    pub fn make_filename(drop_id: &DropId, version: DropVersion) -> String {
        format!("{}_{}", crypto::b64encode(drop_id), version)
    }

    fn latest_filename(drop_id: &DropId) -> String {
        format!("{}_{}", crypto::b64encode(drop_id), LATEST)
    }

    /// Write this record under `metadata_dir`, and repoint LATEST at it when
    /// `mark_latest` is set. The record write happens before the pointer
    /// update, so a reader never follows LATEST to a missing record.
    pub async fn write(&self, metadata_dir: &Path, mark_latest: bool) -> Result<(), MetadataError> {
        tokio::fs::create_dir_all(metadata_dir).await?;
        let file_name = Self::make_filename(&self.drop_id, self.version);
        tokio::fs::write(metadata_dir.join(&file_name), self.encode()?).await?;
        if mark_latest {
            Self::write_latest(&self.drop_id, self.version, metadata_dir).await?;
        }
        Ok(())
    }

    pub async fn write_latest(
        drop_id: &DropId,
        version: DropVersion,
        metadata_dir: &Path,
    ) -> Result<(), MetadataError> {
        let pointer = metadata_dir.join(Self::latest_filename(drop_id));
        tokio::fs::write(&pointer, Self::make_filename(drop_id, version)).await?;
        Ok(())
    }

    async fn read_latest(
        drop_id: &DropId,
        metadata_dir: &Path,
    ) -> Result<Option<String>, MetadataError> {
        let pointer = metadata_dir.join(Self::latest_filename(drop_id));
        match tokio::fs::read_to_string(&pointer).await {
            Ok(name) => Ok(Some(name.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a record from disk: the named version, or the one LATEST points
    /// at. `None` when the drop (or version) is not present locally.
    pub async fn read(
        drop_id: &DropId,
        metadata_dir: &Path,
        version: Option<DropVersion>,
    ) -> Result<Option<Self>, MetadataError> {
        let file_name = match version {
            Some(v) => Self::make_filename(drop_id, v),
            None => match Self::read_latest(drop_id, metadata_dir).await? {
                Some(name) => name,
                None => return Ok(None),
            },
        };
        match tokio::fs::read(metadata_dir.join(&file_name)).await {
            Ok(bytes) => Ok(Some(Self::decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("verification failed: {0}")]
    Verification(&'static str),

    #[error("record is not signed")]
    Unsigned,

    #[error("missing or mistyped field: {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────
