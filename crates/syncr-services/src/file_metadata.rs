//! File metadata records: per-file chunk hashes.
//!
//! One record per file ID per drop, stored under
//! `<drop_root>/.syncr/files/<b64(file_id)>`. The record carries a hash per
//! chunk; a file on disk is the file iff every chunk hashes to its entry,
//! which is also exactly when the whole stream hashes to the file ID.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use syncr_core::codec::{MapBuilder, Value};
use syncr_core::crypto::{self, Hasher};
use syncr_core::types::{drop_id_from_bytes, id_from_bytes, Digest, DropId, FileId, DEFAULT_CHUNK_SIZE};
use syncr_core::wire::PROTOCOL_VERSION;

use crate::drop_metadata::MetadataError;
use crate::fileio::{FileIo, FileIoError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// One hash per chunk index.
    pub chunks: Vec<Digest>,
    pub file_id: FileId,
    pub file_length: u64,
    pub chunk_size: u64,
    pub drop_id: DropId,
    pub protocol_version: u64,
}

impl FileMetadata {
    pub fn new(chunks: Vec<Digest>, file_id: FileId, file_length: u64, drop_id: DropId) -> Self {
        Self {
            chunks,
            file_id,
            file_length,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drop_id,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn num_chunks(&self) -> u64 {
        self.file_length.div_ceil(self.chunk_size)
    }

    pub fn encode(&self) -> Vec<u8> {
        MapBuilder::new()
            .entry(b"protocol_version", self.protocol_version)
            .entry(b"chunk_size", self.chunk_size)
            .entry(b"file_length", self.file_length)
            .entry(b"file_id", self.file_id.as_slice())
            .entry(
                b"chunks",
                Value::List(self.chunks.iter().map(|h| Value::Bytes(h.to_vec())).collect()),
            )
            .entry(b"drop_id", self.drop_id.as_slice())
            .build()
            .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        let value = Value::decode(bytes)?;
        let field = |name: &'static str, key: &[u8]| {
            value.get(key).ok_or(MetadataError::Missing(name))
        };

        let mut chunks = Vec::new();
        for entry in field("chunks", b"chunks")?
            .as_list()
            .ok_or(MetadataError::Missing("chunks"))?
        {
            chunks.push(
                entry
                    .as_bytes()
                    .and_then(id_from_bytes)
                    .ok_or(MetadataError::Missing("chunk hash"))?,
            );
        }

        let record = Self {
            chunks,
            file_id: field("file_id", b"file_id")?
                .as_bytes()
                .and_then(id_from_bytes)
                .ok_or(MetadataError::Missing("file_id"))?,
            file_length: field("file_length", b"file_length")?
                .as_int()
                .ok_or(MetadataError::Missing("file_length"))?,
            chunk_size: field("chunk_size", b"chunk_size")?
                .as_int()
                .filter(|&s| s > 0)
                .ok_or(MetadataError::Missing("chunk_size"))?,
            drop_id: field("drop_id", b"drop_id")?
                .as_bytes()
                .and_then(drop_id_from_bytes)
                .ok_or(MetadataError::Missing("drop_id"))?,
            protocol_version: field("protocol_version", b"protocol_version")?
                .as_int()
                .ok_or(MetadataError::Missing("protocol_version"))?,
        };

        if record.chunks.len() as u64 != record.num_chunks() {
            return Err(MetadataError::Verification("chunk count / file length"));
        }
        Ok(record)
    }

    /// On-disk name of this record: the encoded file ID.
    pub fn make_filename(file_id: &FileId) -> String {
        crypto::b64encode(file_id)
    }

    pub async fn write(&self, metadata_dir: &Path) -> Result<(), MetadataError> {
        tokio::fs::create_dir_all(metadata_dir).await?;
        let path = metadata_dir.join(Self::make_filename(&self.file_id));
        tokio::fs::write(path, self.encode()).await?;
        Ok(())
    }

    /// Read a record by file ID; `None` when not present locally.
    pub async fn read(
        file_id: &FileId,
        metadata_dir: &Path,
    ) -> Result<Option<Self>, MetadataError> {
        let path = metadata_dir.join(Self::make_filename(file_id));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Self::decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The chunk indices already intact on disk — the "re-hash" step.
    ///
    /// Reads each chunk of `full_path` (completed or `.part`) and keeps the
    /// indices whose contents hash to the expected entry. A file that does
    /// not exist at all simply has no downloaded chunks.
    pub async fn downloaded_chunks(
        &self,
        fileio: &FileIo,
        full_path: &Path,
    ) -> Result<HashSet<u64>, FileIoError> {
        let mut downloaded = HashSet::new();
        for index in 0..self.num_chunks() {
            match fileio.read_chunk(full_path, index, self.chunk_size).await {
                Ok((_, digest)) => {
                    if digest == self.chunks[index as usize] {
                        downloaded.insert(index);
                    }
                }
                Err(FileIoError::NotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(downloaded)
    }

    /// The complement of [`FileMetadata::downloaded_chunks`].
    pub async fn needed_chunks(
        &self,
        fileio: &FileIo,
        full_path: &Path,
    ) -> Result<HashSet<u64>, FileIoError> {
        let downloaded = self.downloaded_chunks(fileio, full_path).await?;
        Ok((0..self.num_chunks())
            .filter(|i| !downloaded.contains(i))
            .collect())
    }
}

/// Build the metadata for a file on disk: hash every chunk, and the whole
/// stream for the file ID. Runs on the blocking pool — this is the one
/// CPU-heavy path in metadata handling.
pub async fn make_file_metadata(
    path: &Path,
    drop_id: DropId,
) -> Result<FileMetadata, MetadataError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut chunks = Vec::new();
        let mut whole = Hasher::new();
        let mut length: u64 = 0;
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE as usize];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            chunks.push(crypto::hash(&buf[..filled]));
            whole.update(&buf[..filled]);
            length += filled as u64;
            if filled < buf.len() {
                break;
            }
        }
        Ok::<_, MetadataError>(FileMetadata::new(chunks, whole.finalize(), length, drop_id))
    })
    .await
    .map_err(|e| MetadataError::Io(std::io::Error::other(e)))?
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        FileMetadata {
            chunks: vec![[0x01; 32], [0x02; 32], [0x03; 32]],
            file_id: [0xaa; 32],
            file_length: 2 * 1024 + 1,
            chunk_size: 1024,
            drop_id: [0xbb; 64],
            protocol_version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let fm = sample();
        assert_eq!(FileMetadata::decode(&fm.encode()).unwrap(), fm);
    }

    #[test]
    fn chunk_count_must_match_length() {
        let mut fm = sample();
        fm.chunks.pop();
        let err = FileMetadata::decode(&fm.encode()).unwrap_err();
        assert!(matches!(err, MetadataError::Verification(_)));
    }

    #[test]
    fn num_chunks_is_ceiling() {
        let mut fm = sample();
        fm.file_length = 0;
        assert_eq!(fm.num_chunks(), 0);
        fm.file_length = 1024;
        assert_eq!(fm.num_chunks(), 1);
        fm.file_length = 1025;
        assert_eq!(fm.num_chunks(), 2);
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fm = sample();
        fm.write(dir.path()).await.unwrap();
        assert_eq!(
            FileMetadata::read(&fm.file_id, dir.path()).await.unwrap().unwrap(),
            fm
        );
        assert!(FileMetadata::read(&[0u8; 32], dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn make_file_metadata_hashes_chunks_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let contents = b"some file contents".to_vec();
        std::fs::write(&path, &contents).unwrap();

        let fm = make_file_metadata(&path, [0u8; 64]).await.unwrap();
        assert_eq!(fm.file_length, contents.len() as u64);
        assert_eq!(fm.chunks, vec![crypto::hash(&contents)]);
        assert_eq!(fm.file_id, crypto::hash(&contents));
        assert_eq!(fm.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn make_file_metadata_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let fm = make_file_metadata(&path, [0u8; 64]).await.unwrap();
        assert_eq!(fm.file_length, 0);
        assert!(fm.chunks.is_empty());
        assert_eq!(fm.file_id, crypto::hash(b""));
    }

    #[tokio::test]
    async fn downloaded_chunks_rehashes_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let fileio = FileIo::new();

        // Two 4-byte chunks expected; only the first is present and intact.
        let fm = FileMetadata {
            chunks: vec![crypto::hash(b"aaaa"), crypto::hash(b"bbbb")],
            file_id: [0u8; 32],
            file_length: 8,
            chunk_size: 4,
            drop_id: [0u8; 64],
            protocol_version: PROTOCOL_VERSION,
        };

        // Nothing on disk yet: no chunks downloaded.
        assert!(fm.downloaded_chunks(&fileio, &path).await.unwrap().is_empty());

        fileio.create_file(&path, 8).await.unwrap();
        fileio
            .write_chunk(&path, 0, b"aaaa", &crypto::hash(b"aaaa"), 4)
            .await
            .unwrap();

        let downloaded = fm.downloaded_chunks(&fileio, &path).await.unwrap();
        assert_eq!(downloaded, HashSet::from([0]));
        let needed = fm.needed_chunks(&fileio, &path).await.unwrap();
        assert_eq!(needed, HashSet::from([1]));
    }
}
