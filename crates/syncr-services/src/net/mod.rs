//! Peer-protocol networking: the framed exchange, the typed client, and the
//! server-side request handler.
//!
//! Transport discipline is one request per TCP connection: write the
//! canonical-encoded map, half-close the write side, read the response to
//! EOF, close. Timeouts are treated as connection failures so the client's
//! retry loop falls through to the next peer.

pub mod client;
pub mod server;

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use syncr_core::codec::CodecError;
use syncr_core::wire::WireError;

use crate::drop_metadata::MetadataError;

/// How long one peer or tracker exchange may take end to end.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Perform one framed request/response exchange.
pub async fn exchange(ip: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>, NetError> {
    let fut = async {
        let mut stream = TcpStream::connect((ip, port)).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, NetError>(response)
    };
    tokio::time::timeout(REQUEST_TIMEOUT, fut)
        .await
        .map_err(|_| NetError::Timeout)?
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no peers available")]
    NoPeers,

    #[error("peer does not have the requested object")]
    NotExist,

    #[error("peer speaks an incompatible protocol version")]
    IncompatibleProtocol,

    #[error("peer rejected the request as malformed")]
    InvalidInput,

    #[error("peer failed internally")]
    RemoteException,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
