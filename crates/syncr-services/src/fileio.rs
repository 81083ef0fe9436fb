//! Chunked random-access file I/O with the `.part` discipline.
//!
//! A file under construction lives at `<path>.part` and is renamed into
//! place once every chunk has arrived. The rename is the visibility point:
//! anything served to peers is always the completed name, and `.part` never
//! leaves this module. Chunk writes verify the expected hash before touching
//! the disk and are serialized per path.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use glob::Pattern;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use syncr_core::crypto;
use syncr_core::types::Digest;

/// Suffix carried by files under construction.
pub const PART_SUFFIX: &str = ".part";

/// Patterns always excluded from directory walks: the metadata directory
/// and in-flight downloads.
pub const DEFAULT_IGNORE: &[&str] = &[".syncr*", "*.part"];

/// The `.part` sibling of a completed path.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// File I/O service. Cheap to clone; all clones share one lock table.
#[derive(Clone, Default)]
#[derive(Debug)]
pub struct FileIo {
    /// Per-path write locks. Chunks for one file may arrive from several
    /// peer tasks at once; their writes must not interleave seeks.
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Prepare a `.part` file of exactly `length` bytes at `path`.
    ///
    /// If the completed file already exists it is demoted to `.part` first —
    /// an update is being started and its intact chunks can be reused. An
    /// existing `.part` keeps its contents and is resized.
    pub async fn create_file(&self, path: &Path, length: u64) -> Result<(), FileIoError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let part = part_path(path);
        if tokio::fs::try_exists(path).await? {
            tokio::fs::rename(path, &part).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&part)
            .await?;
        file.set_len(length).await?;
        Ok(())
    }

    /// Write one verified chunk into the `.part` file.
    ///
    /// Fails with [`FileIoError::Verification`] before any disk write when
    /// `contents` does not hash to `expected_hash`.
    pub async fn write_chunk(
        &self,
        path: &Path,
        index: u64,
        contents: &[u8],
        expected_hash: &Digest,
        chunk_size: u64,
    ) -> Result<(), FileIoError> {
        if &crypto::hash(contents) != expected_hash {
            return Err(FileIoError::Verification);
        }

        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let part = part_path(path);
        let mut file = OpenOptions::new().write(true).open(&part).await?;
        file.seek(SeekFrom::Start(index * chunk_size)).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read at most `chunk_size` bytes at chunk `index`, preferring the
    /// completed file over the `.part` file. Returns the bytes and their hash.
    pub async fn read_chunk(
        &self,
        path: &Path,
        index: u64,
        chunk_size: u64,
    ) -> Result<(Vec<u8>, Digest), FileIoError> {
        let source = if tokio::fs::try_exists(path).await? {
            path.to_path_buf()
        } else {
            let part = part_path(path);
            if !tokio::fs::try_exists(&part).await? {
                return Err(FileIoError::NotFound(path.to_path_buf()));
            }
            part
        };

        let mut file = File::open(&source).await?;
        file.seek(SeekFrom::Start(index * chunk_size)).await?;
        let mut buf = vec![0u8; chunk_size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let digest = crypto::hash(&buf);
        Ok((buf, digest))
    }

    /// Atomically rename `path.part` to `path`. Idempotent when the file is
    /// already complete.
    pub async fn mark_complete(&self, path: &Path) -> Result<(), FileIoError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        let part = part_path(path);
        if !tokio::fs::try_exists(&part).await? {
            return Err(FileIoError::NotFound(path.to_path_buf()));
        }
        tokio::fs::rename(&part, path).await?;
        Ok(())
    }

    /// Whether the completed file exists. `false` when only `.part` does,
    /// [`FileIoError::NotFound`] when neither does.
    pub async fn is_complete(&self, path: &Path) -> Result<bool, FileIoError> {
        if tokio::fs::try_exists(path).await? {
            return Ok(true);
        }
        if tokio::fs::try_exists(&part_path(path)).await? {
            return Ok(false);
        }
        Err(FileIoError::NotFound(path.to_path_buf()))
    }
}

// ── Directory walk ───────────────────────────────────────────────────────────

/// Walk the files under `root`, yielding `(relative_dir, filename)` pairs and
/// skipping anything that matches `patterns` or the built-in ignore set.
///
/// A pattern is tried against the relative directory, the bare filename, and
/// the full relative path, so `".syncr*"` prunes the metadata tree and
/// `"*.part"` hides in-flight downloads.
pub fn walk_with_ignore(
    root: &Path,
    patterns: &[String],
) -> Result<Vec<(PathBuf, String)>, FileIoError> {
    let mut compiled = Vec::new();
    for p in patterns.iter().map(String::as_str).chain(DEFAULT_IGNORE.iter().copied()) {
        compiled.push(Pattern::new(p)?);
    }

    let mut out = Vec::new();
    walk_dir(root, Path::new(""), &compiled, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_dir(
    root: &Path,
    rel_dir: &Path,
    ignore: &[Pattern],
    out: &mut Vec<(PathBuf, String)>,
) -> Result<(), FileIoError> {
    let matches_any = |candidate: &str| ignore.iter().any(|p| p.matches(candidate));

    if matches_any(&rel_dir.to_string_lossy()) {
        return Ok(());
    }

    for entry in std::fs::read_dir(root.join(rel_dir))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel_path = rel_dir.join(&name);
        if matches_any(&name) || matches_any(&rel_path.to_string_lossy()) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &rel_path, ignore, out)?;
        } else if file_type.is_file() {
            out.push((rel_dir.to_path_buf(), name));
        }
    }
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FileIoError {
    #[error("chunk contents do not match the expected hash")]
    Verification,

    #[error("no such file: {0} (neither complete nor .part)")]
    NotFound(PathBuf),

    #[error("bad ignore pattern: {0}")]
    BadPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────
