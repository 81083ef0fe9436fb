//! Typed peer-protocol client.
//!
//! Each function sends one request to one peer and decodes the typed
//! response; [`do_request`] walks a peer list until one of them answers.
//! Metadata responses are decoded through the verifying pipeline, so a
//! malicious peer cannot hand back a record whose `files_hash` lies.

use std::future::Future;

use syncr_core::codec::Value;
use syncr_core::types::{DropId, DropVersion, FileId, Peer};
use syncr_core::wire::{ErrorCode, Request, Response};

use crate::drop_metadata::DropMetadata;
use crate::file_metadata::FileMetadata;

use super::{exchange, NetError};

async fn request_value(peer: &Peer, request: &Request) -> Result<Value, NetError> {
    let raw = exchange(&peer.ip, peer.port, &request.to_value().encode()).await?;
    match Response::from_value(&Value::decode(&raw)?)? {
        Response::Ok(payload) => Ok(payload),
        Response::Error(ErrorCode::NotExist) => Err(NetError::NotExist),
        Response::Error(ErrorCode::IncompatibleProtocol) => Err(NetError::IncompatibleProtocol),
        Response::Error(ErrorCode::InvalidInput) => Err(NetError::InvalidInput),
        Response::Error(ErrorCode::Exception) => Err(NetError::RemoteException),
    }
}

/// Fetch a drop metadata record (latest when `version` is `None`).
///
/// The returned record has passed the files-hash check and the signer-set
/// check; the header signature is verified by the caller once the signer's
/// public key is resolved.
pub async fn request_drop_metadata(
    peer: &Peer,
    drop_id: DropId,
    version: Option<DropVersion>,
) -> Result<DropMetadata, NetError> {
    let payload = request_value(peer, &Request::DropMetadata { drop_id, version }).await?;
    let bytes = payload
        .as_bytes()
        .ok_or(NetError::InvalidInput)?;
    Ok(DropMetadata::decode(bytes)?)
}

pub async fn request_file_metadata(
    peer: &Peer,
    drop_id: DropId,
    file_id: FileId,
) -> Result<FileMetadata, NetError> {
    let payload = request_value(peer, &Request::FileMetadata { drop_id, file_id }).await?;
    let bytes = payload
        .as_bytes()
        .ok_or(NetError::InvalidInput)?;
    let record = FileMetadata::decode(bytes)?;
    if record.file_id != file_id || record.drop_id != drop_id {
        return Err(NetError::InvalidInput);
    }
    Ok(record)
}

/// Ask a peer which chunk indices it holds locally for a file.
pub async fn request_chunk_list(
    peer: &Peer,
    drop_id: DropId,
    file_id: FileId,
) -> Result<Vec<u64>, NetError> {
    let payload = request_value(peer, &Request::ChunkList { drop_id, file_id }).await?;
    payload
        .as_list()
        .map(|items| items.iter().filter_map(Value::as_int).collect())
        .ok_or(NetError::InvalidInput)
}

/// Fetch one raw chunk. The caller verifies the hash at write time.
pub async fn request_chunk(
    peer: &Peer,
    drop_id: DropId,
    file_id: FileId,
    index: u64,
) -> Result<Vec<u8>, NetError> {
    let payload = request_value(
        peer,
        &Request::Chunk {
            drop_id,
            file_id,
            index,
        },
    )
    .await?;
    payload
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or(NetError::InvalidInput)
}

/// Run a request against each peer in order, returning the first success.
///
/// Fails with [`NetError::NoPeers`] on an empty list; otherwise re-raises
/// the last peer's error once the list is exhausted.
pub async fn do_request<T, F, Fut>(peers: &[Peer], request_fn: F) -> Result<T, NetError>
where
    F: Fn(Peer) -> Fut,
    Fut: Future<Output = Result<T, NetError>>,
{
    if peers.is_empty() {
        return Err(NetError::NoPeers);
    }
    let mut last_error = None;
    for peer in peers {
        match request_fn(peer.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                tracing::debug!(ip = %peer.ip, port = peer.port, error = %e, "peer request failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(NetError::NoPeers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn do_request_empty_list_is_no_peers() {
        let result: Result<(), _> =
            do_request(&[], |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(NetError::NoPeers)));
    }

    #[tokio::test]
    async fn do_request_returns_first_success() {
        let peers = vec![
            Peer::new(vec![1], "a", 1),
            Peer::new(vec![2], "b", 2),
            Peer::new(vec![3], "c", 3),
        ];
        let result = do_request(&peers, |peer| async move {
            if peer.port == 2 {
                Ok(peer.ip)
            } else {
                Err(NetError::NotExist)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "b");
    }

    #[tokio::test]
    async fn do_request_reraises_last_error() {
        let peers = vec![Peer::new(vec![1], "a", 1), Peer::new(vec![2], "b", 2)];
        let result: Result<(), _> = do_request(&peers, |peer| async move {
            if peer.port == 1 {
                Err(NetError::Timeout)
            } else {
                Err(NetError::NotExist)
            }
        })
        .await;
        assert!(matches!(result, Err(NetError::NotExist)));
    }
}
