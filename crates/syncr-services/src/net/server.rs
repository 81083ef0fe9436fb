//! Server side of the peer protocol.
//!
//! A TCP listener dispatches inbound requests against the local drop store:
//! registry lookup, metadata read, chunk read. Anything locally unknown —
//! the drop, the version, the file, or a chunk that has not finished
//! downloading — answers `NotExist` so the client moves on to the next
//! peer. Outgoing metadata is served as-is; verification is the client's
//! decode pipeline, not ours.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use syncr_core::codec::Value;
use syncr_core::crypto;
use syncr_core::types::{DropId, FileId};
use syncr_core::wire::{ErrorCode, Request, Response, WireError};

use crate::drop_metadata::{drop_metadata_dir, file_metadata_dir, DropMetadata};
use crate::file_metadata::FileMetadata;
use crate::node::Node;

use super::NetError;

/// Accept and serve peer requests until the shutdown flag flips.
pub async fn serve(listener: TcpListener, node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("request listener shutting down");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "peer connected");
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, node).await {
                            tracing::debug!(%addr, error = %e, "peer connection failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, node: Arc<Node>) -> Result<(), NetError> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let response = respond(&node, &raw).await;
    stream.write_all(&response.to_value().encode()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Decode, dispatch, and answer one request. Never fails: every problem
/// becomes a typed error response.
pub(crate) async fn respond(node: &Node, raw: &[u8]) -> Response {
    let value = match Value::decode(raw) {
        Ok(v) => v,
        Err(_) => return Response::Error(ErrorCode::InvalidInput),
    };
    let request = match Request::from_value(&value) {
        Ok(r) => r,
        Err(WireError::IncompatibleProtocol(version)) => {
            tracing::debug!(version, "incompatible peer protocol");
            return Response::Error(ErrorCode::IncompatibleProtocol);
        }
        Err(e) => {
            tracing::debug!(error = %e, "malformed request");
            return Response::Error(ErrorCode::InvalidInput);
        }
    };

    match request {
        Request::DropMetadata { drop_id, version } => {
            handle_drop_metadata(node, drop_id, version).await
        }
        Request::FileMetadata { drop_id, file_id } => {
            handle_file_metadata(node, drop_id, file_id).await
        }
        Request::ChunkList { drop_id, file_id } => handle_chunk_list(node, drop_id, file_id).await,
        Request::Chunk {
            drop_id,
            file_id,
            index,
        } => handle_chunk(node, drop_id, file_id, index).await,
        Request::NewDropMetadata { drop_id, latest } => {
            // Reserved request type: acknowledge nothing, but leave a trace.
            tracing::info!(
                drop_id = %crypto::b64encode(&drop_id),
                version = %latest,
                "ignoring NEW_DROP_METADATA notification (not implemented)"
            );
            Response::Error(ErrorCode::NotExist)
        }
    }
}

async fn handle_drop_metadata(
    node: &Node,
    drop_id: DropId,
    version: Option<syncr_core::DropVersion>,
) -> Response {
    let save_dir = match node.get_drop_location(drop_id).await {
        Ok(dir) => dir,
        Err(_) => return Response::Error(ErrorCode::NotExist),
    };
    match DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), version).await {
        Ok(Some(record)) => match record.encode() {
            Ok(bytes) => Response::Ok(Value::Bytes(bytes)),
            Err(e) => {
                tracing::warn!(error = %e, "stored drop metadata failed to encode");
                Response::Error(ErrorCode::Exception)
            }
        },
        Ok(None) => Response::Error(ErrorCode::NotExist),
        Err(e) => {
            tracing::warn!(error = %e, "drop metadata read failed");
            Response::Error(ErrorCode::Exception)
        }
    }
}

async fn handle_file_metadata(node: &Node, drop_id: DropId, file_id: FileId) -> Response {
    let save_dir = match node.get_drop_location(drop_id).await {
        Ok(dir) => dir,
        Err(_) => return Response::Error(ErrorCode::NotExist),
    };
    match FileMetadata::read(&file_id, &file_metadata_dir(&save_dir)).await {
        Ok(Some(record)) => Response::Ok(Value::Bytes(record.encode())),
        Ok(None) => Response::Error(ErrorCode::NotExist),
        Err(e) => {
            tracing::warn!(error = %e, "file metadata read failed");
            Response::Error(ErrorCode::Exception)
        }
    }
}

/// Resolve the on-disk path a file ID lives at within a drop, via the
/// drop's latest record. `None` when the file is not in the drop.
async fn resolve_file(
    node: &Node,
    drop_id: DropId,
    file_id: FileId,
) -> Option<(std::path::PathBuf, FileMetadata)> {
    let save_dir = node.get_drop_location(drop_id).await.ok()?;
    let record = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None)
        .await
        .ok()??;
    let name = record.file_name_for(&file_id)?.to_string();
    let metadata = FileMetadata::read(&file_id, &file_metadata_dir(&save_dir))
        .await
        .ok()??;
    Some((save_dir.join(name), metadata))
}

async fn handle_chunk_list(node: &Node, drop_id: DropId, file_id: FileId) -> Response {
    let Some((path, metadata)) = resolve_file(node, drop_id, file_id).await else {
        return Response::Error(ErrorCode::NotExist);
    };
    match metadata.downloaded_chunks(&node.fileio, &path).await {
        Ok(downloaded) => {
            let mut indices: Vec<u64> = downloaded.into_iter().collect();
            indices.sort_unstable();
            Response::Ok(Value::List(indices.into_iter().map(Value::Int).collect()))
        }
        Err(e) => {
            tracing::warn!(error = %e, "chunk re-hash failed");
            Response::Error(ErrorCode::Exception)
        }
    }
}

async fn handle_chunk(node: &Node, drop_id: DropId, file_id: FileId, index: u64) -> Response {
    let Some((path, metadata)) = resolve_file(node, drop_id, file_id).await else {
        return Response::Error(ErrorCode::NotExist);
    };
    if index >= metadata.num_chunks() {
        return Response::Error(ErrorCode::NotExist);
    }
    match node.fileio.read_chunk(&path, index, metadata.chunk_size).await {
        Ok((bytes, digest)) => {
            // Serve only chunks that are actually intact; a hole in the
            // .part file reads as garbage and must look not-yet-downloaded.
            if digest == metadata.chunks[index as usize] {
                Response::Ok(Value::Bytes(bytes))
            } else {
                Response::Error(ErrorCode::NotExist)
            }
        }
        Err(crate::fileio::FileIoError::NotFound(_)) => Response::Error(ErrorCode::NotExist),
        Err(e) => {
            tracing::warn!(error = %e, "chunk read failed");
            Response::Error(ErrorCode::Exception)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use syncr_core::crypto::Keypair;
    use syncr_core::types::{DropVersion, Peer};

    use crate::drop_metadata::gen_drop_id;
    use crate::net::client;
    use crate::node;

    /// A node with one registered drop containing a single on-disk file.
    async fn node_with_drop(home: &Path, save_dir: &Path) -> (Arc<Node>, DropId, FileId) {
        let keypair = Keypair::generate_with_size(2048).unwrap();
        node::write_private_key(home, &keypair).await.unwrap();
        let node = Node::load(Some(home.to_path_buf())).await.unwrap();

        let owner = node.node_id();
        let drop_id = gen_drop_id(&owner);

        let contents = b"the quick brown fox".to_vec();
        std::fs::create_dir_all(save_dir).unwrap();
        std::fs::write(save_dir.join("fox.txt"), &contents).unwrap();

        let fm = crate::file_metadata::make_file_metadata(&save_dir.join("fox.txt"), drop_id)
            .await
            .unwrap();
        let file_id = fm.file_id;
        fm.write(&file_metadata_dir(save_dir)).await.unwrap();

        let mut files = BTreeMap::new();
        files.insert("fox.txt".to_string(), file_id);
        let mut record = DropMetadata::new(
            drop_id,
            "fox".into(),
            DropVersion::new(1, 7),
            Vec::new(),
            owner,
            BTreeMap::new(),
            owner,
            files,
        );
        record.sign(node.keypair().private()).unwrap();
        record.write(&drop_metadata_dir(save_dir), true).await.unwrap();

        node.save_drop_location(drop_id, save_dir).await.unwrap();
        (node, drop_id, file_id)
    }

    async fn spawn_server(node: Arc<Node>) -> (Peer, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, node, rx));
        (Peer::new(vec![0u8; 32], "127.0.0.1", addr.port()), tx)
    }

    #[tokio::test]
    async fn serves_drop_and_file_metadata() {
        let home = tempfile::tempdir().unwrap();
        let drop_dir = tempfile::tempdir().unwrap();
        let (node, drop_id, file_id) = node_with_drop(home.path(), drop_dir.path()).await;
        let (peer, _shutdown) = spawn_server(node).await;

        let record = client::request_drop_metadata(&peer, drop_id, None).await.unwrap();
        assert_eq!(record.name, "fox");
        assert_eq!(record.files["fox.txt"], file_id);

        let fm = client::request_file_metadata(&peer, drop_id, file_id).await.unwrap();
        assert_eq!(fm.file_id, file_id);
        assert_eq!(fm.chunks.len(), 1);
    }

    #[tokio::test]
    async fn serves_chunk_list_and_chunks() {
        let home = tempfile::tempdir().unwrap();
        let drop_dir = tempfile::tempdir().unwrap();
        let (node, drop_id, file_id) = node_with_drop(home.path(), drop_dir.path()).await;
        let (peer, _shutdown) = spawn_server(node).await;

        let chunk_list = client::request_chunk_list(&peer, drop_id, file_id).await.unwrap();
        assert_eq!(chunk_list, vec![0]);

        let chunk = client::request_chunk(&peer, drop_id, file_id, 0).await.unwrap();
        assert_eq!(chunk, b"the quick brown fox");
    }

    #[tokio::test]
    async fn unknown_objects_answer_not_exist() {
        let home = tempfile::tempdir().unwrap();
        let drop_dir = tempfile::tempdir().unwrap();
        let (node, drop_id, file_id) = node_with_drop(home.path(), drop_dir.path()).await;
        let (peer, _shutdown) = spawn_server(node).await;

        // Unknown drop
        let err = client::request_drop_metadata(&peer, [9u8; 64], None).await.unwrap_err();
        assert!(matches!(err, NetError::NotExist));

        // Unknown version of a known drop
        let err = client::request_drop_metadata(&peer, drop_id, Some(DropVersion::new(8, 8)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NotExist));

        // Unknown file, out-of-range chunk
        let err = client::request_file_metadata(&peer, drop_id, [9u8; 32]).await.unwrap_err();
        assert!(matches!(err, NetError::NotExist));
        let err = client::request_chunk(&peer, drop_id, file_id, 99).await.unwrap_err();
        assert!(matches!(err, NetError::NotExist));
    }

    #[tokio::test]
    async fn malformed_and_incompatible_requests() {
        let home = tempfile::tempdir().unwrap();
        let drop_dir = tempfile::tempdir().unwrap();
        let (node, _, _) = node_with_drop(home.path(), drop_dir.path()).await;

        let resp = respond(&node, b"not canonical at all").await;
        assert_eq!(resp, Response::Error(ErrorCode::InvalidInput));

        let v = syncr_core::codec::MapBuilder::new()
            .entry(b"protocol_version", 99u64)
            .entry(b"request_type", 1u64)
            .entry(b"drop_id", [0u8; 64].as_slice())
            .build();
        let resp = respond(&node, &v.encode()).await;
        assert_eq!(resp, Response::Error(ErrorCode::IncompatibleProtocol));
    }

    #[tokio::test]
    async fn new_drop_metadata_is_logged_and_refused() {
        let home = tempfile::tempdir().unwrap();
        let drop_dir = tempfile::tempdir().unwrap();
        let (node, drop_id, _) = node_with_drop(home.path(), drop_dir.path()).await;

        let req = Request::NewDropMetadata {
            drop_id,
            latest: DropVersion::new(2, 2),
        };
        let resp = respond(&node, &req.to_value().encode()).await;
        assert_eq!(resp, Response::Error(ErrorCode::NotExist));
    }
}
