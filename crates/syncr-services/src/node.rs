//! Node identity and the central registry.
//!
//! A node's long-lived state lives under one init directory (`~/.syncr` by
//! default, or `$SYNCR_HOME`): the private key, the cached public keys of
//! peers, the discovery config files, and the `drops/` registry mapping drop
//! IDs to their save paths on disk.
//!
//! [`Node`] bundles the loaded identity with the shared services every
//! orchestrator call needs — the file I/O layer, the metadata and chunk-list
//! caches, and the per-drop sync locks. It is created once at startup and
//! threaded through everything; nothing in this crate lives in a global.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lru::LruCache;
use thiserror::Error;

use syncr_core::codec::{CodecError, Value};
use syncr_core::crypto::{self, CryptoError, Keypair};
use syncr_core::types::{drop_id_from_bytes, DropId, FileId, NodeId};

use crate::cache::TtlCache;
use crate::discovery::PEER_AVAILABILITY_TTL;
use crate::drop_metadata::DropMetadata;
use crate::fileio::FileIo;

pub const DEFAULT_HOME_DIR: &str = ".syncr";
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const DROPS_DIR: &str = "drops";
pub const PUB_KEYS_DIR: &str = "pub_keys";

const METADATA_CACHE_SIZE: usize = 64;
const CHUNK_LIST_CACHE_SIZE: usize = 256;

/// The node init directory: `$SYNCR_HOME`, else `~/.syncr`.
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("SYNCR_HOME") {
        return PathBuf::from(home);
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_HOME_DIR)
}

pub fn is_node_initialized(home: &Path) -> bool {
    home.join(PRIVATE_KEY_FILE).exists()
}

/// Initialize a node: create the directory tree and generate the keypair.
///
/// With `force`, an existing init directory is wiped first; without it,
/// reinitializing is an error — the keypair is the node's identity and
/// silently replacing it would orphan every published drop.
pub async fn initialize_node(home: &Path, force: bool) -> Result<(), NodeError> {
    if home.exists() {
        if !force {
            return Err(NodeError::AlreadyInitialized(home.to_path_buf()));
        }
        tracing::warn!(home = %home.display(), "forcing node re-initialization");
        tokio::fs::remove_dir_all(home).await?;
    }

    tracing::info!(home = %home.display(), "initializing node");
    tokio::fs::create_dir_all(home.join(DROPS_DIR)).await?;
    tokio::fs::create_dir_all(home.join(PUB_KEYS_DIR)).await?;

    let keypair = tokio::task::spawn_blocking(Keypair::generate)
        .await
        .map_err(|e| NodeError::Io(std::io::Error::other(e)))??;
    write_private_key(home, &keypair).await
}

/// Write the private key PEM (mode 0600 on unix). Refuses to overwrite.
pub async fn write_private_key(home: &Path, keypair: &Keypair) -> Result<(), NodeError> {
    let path = home.join(PRIVATE_KEY_FILE);
    if path.exists() {
        return Err(NodeError::AlreadyInitialized(home.to_path_buf()));
    }
    tokio::fs::create_dir_all(home).await?;
    tokio::fs::create_dir_all(home.join(DROPS_DIR)).await?;
    tokio::fs::create_dir_all(home.join(PUB_KEYS_DIR)).await?;
    tokio::fs::write(&path, keypair.private_pem()?.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

pub async fn load_keypair(home: &Path) -> Result<Keypair, NodeError> {
    let path = home.join(PRIVATE_KEY_FILE);
    if !path.exists() {
        return Err(NodeError::NotInitialized(home.to_path_buf()));
    }
    let pem = tokio::fs::read_to_string(&path).await?;
    Ok(Keypair::from_private_pem(&pem)?)
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// The loaded node: identity plus the services threaded through the
/// orchestrator.
pub struct Node {
    home: PathBuf,
    keypair: Arc<Keypair>,
    node_id: NodeId,
    pub fileio: FileIo,
    /// LRU fronting on-disk drop-metadata reads, keyed by explicit version.
    pub(crate) metadata_cache: Mutex<LruCache<(DropId, u64, u64), DropMetadata>>,
    /// Per-peer chunk lists, bounded by the peer-availability TTL.
    pub(crate) chunk_list_cache: TtlCache<(String, u16, FileId), Vec<u64>>,
    sync_locks: DashMap<DropId, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("home", &self.home)
            .field("node_id", &crypto::b64encode(&self.node_id))
            .field("fileio", &self.fileio)
            .field("chunk_list_cache", &self.chunk_list_cache)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Load the node from its init directory.
    pub async fn load(home: Option<PathBuf>) -> Result<Arc<Self>, NodeError> {
        let home = home.unwrap_or_else(default_home);
        let keypair = load_keypair(&home).await?;
        let node_id = keypair.node_id()?;
        tracing::info!(
            home = %home.display(),
            node_id = %crypto::b64encode(&node_id),
            "node loaded"
        );
        Ok(Arc::new(Self {
            home,
            keypair: Arc::new(keypair),
            node_id,
            fileio: FileIo::new(),
            metadata_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(METADATA_CACHE_SIZE).expect("nonzero"),
            )),
            chunk_list_cache: TtlCache::new(PEER_AVAILABILITY_TTL, CHUNK_LIST_CACHE_SIZE),
            sync_locks: DashMap::new(),
        }))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn pub_keys_dir(&self) -> PathBuf {
        self.home.join(PUB_KEYS_DIR)
    }

    fn drops_dir(&self) -> PathBuf {
        self.home.join(DROPS_DIR)
    }

    /// The mutex excluding concurrent syncs of one drop.
    pub fn sync_lock(&self, drop_id: DropId) -> Arc<tokio::sync::Mutex<()>> {
        self.sync_locks
            .entry(drop_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Registry: drop_id → save path, file per entry ───────────────────────

    pub async fn save_drop_location(
        &self,
        drop_id: DropId,
        location: &Path,
    ) -> Result<(), NodeError> {
        let dir = self.drops_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let entry = Value::Bytes(location.to_string_lossy().into_owned().into_bytes());
        tokio::fs::write(dir.join(crypto::b64encode(&drop_id)), entry.encode()).await?;
        Ok(())
    }

    pub async fn get_drop_location(&self, drop_id: DropId) -> Result<PathBuf, NodeError> {
        let path = self.drops_dir().join(crypto::b64encode(&drop_id));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::UnknownDrop(crypto::b64encode(&drop_id)));
            }
            Err(e) => return Err(e.into()),
        };
        let value = Value::decode(&raw)?;
        let location = value
            .as_str()
            .ok_or(CodecError::MissingField("save path"))?;
        Ok(PathBuf::from(location))
    }

    pub async fn remove_drop_location(&self, drop_id: DropId) -> Result<(), NodeError> {
        let path = self.drops_dir().join(crypto::b64encode(&drop_id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All drop IDs in the registry.
    pub async fn list_drops(&self) -> Result<Vec<DropId>, NodeError> {
        let dir = self.drops_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut drops = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match crypto::b64decode(&name).ok().as_deref().and_then(drop_id_from_bytes) {
                Some(id) => drops.push(id),
                None => tracing::warn!(name, "skipping malformed registry entry"),
            }
        }
        drops.sort();
        Ok(drops)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is not initialized at {0} — run node-init first")]
    NotInitialized(PathBuf),

    #[error("node already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("drop {0} is not registered on this node")]
    UnknownDrop(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_node(dir: &Path) -> Arc<Node> {
        let keypair = Keypair::generate_with_size(2048).unwrap();
        write_private_key(dir, &keypair).await.unwrap();
        Node::load(Some(dir.to_path_buf())).await.unwrap()
    }

    #[tokio::test]
    async fn load_fails_without_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = Node::load(Some(dir.path().to_path_buf())).await.unwrap_err();
        assert!(matches!(err, NodeError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn keypair_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let reloaded = Node::load(Some(dir.path().to_path_buf())).await.unwrap();
        assert_eq!(node.node_id(), reloaded.node_id());
    }

    #[tokio::test]
    async fn write_private_key_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate_with_size(2048).unwrap();
        write_private_key(dir.path(), &kp).await.unwrap();
        let err = write_private_key(dir.path(), &kp).await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;

        let drop_id = [7u8; 64];
        let location = dir.path().join("my-drop");
        node.save_drop_location(drop_id, &location).await.unwrap();
        assert_eq!(node.get_drop_location(drop_id).await.unwrap(), location);
        assert_eq!(node.list_drops().await.unwrap(), vec![drop_id]);

        node.remove_drop_location(drop_id).await.unwrap();
        assert!(matches!(
            node.get_drop_location(drop_id).await,
            Err(NodeError::UnknownDrop(_))
        ));
        assert!(node.list_drops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_lock_is_shared_per_drop() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let a = node.sync_lock([1u8; 64]);
        let b = node.sync_lock([1u8; 64]);
        assert!(Arc::ptr_eq(&a, &b));
        let c = node.sync_lock([2u8; 64]);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
