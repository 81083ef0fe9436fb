//! Frontend IPC boundary.
//!
//! A local-only request/response server for UI processes: a Unix-domain
//! socket under the node init directory on POSIX, a loopback TCP port
//! elsewhere. Requests are canonical-encoded maps with an `action` key;
//! each action translates to one orchestrator call. The layer holds no
//! state of its own, and every handler failure is caught and returned as an
//! error response — a buggy frontend request must never take the daemon
//! down.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use syncr_core::codec::{MapBuilder, Value};
use syncr_core::crypto;
use syncr_core::types::{drop_id_from_bytes, id_from_bytes, DropId};
use syncr_core::wire::ErrorCode;

use syncr_services::drop_metadata::{drop_metadata_dir, DropMetadata};
use syncr_services::queue::SyncQueue;
use syncr_services::sync::SyncError;
use syncr_services::{version, Node};

#[cfg(unix)]
pub const IPC_SOCKET_FILE: &str = "ipc.sock";
#[cfg(not(unix))]
pub const IPC_TCP_PORT: u16 = 47666;

/// Serve frontend requests until shutdown.
pub async fn serve_ipc(
    node: Arc<Node>,
    queue: SyncQueue,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let socket_path: PathBuf = node.home().join(IPC_SOCKET_FILE);
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        let listener = tokio::net::UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "IPC server listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = tokio::fs::remove_file(&socket_path).await;
                        tracing::info!("IPC server shutting down");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    spawn_ipc_task(stream, node.clone(), queue.clone());
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let listener =
            tokio::net::TcpListener::bind(("127.0.0.1", IPC_TCP_PORT)).await?;
        tracing::info!(port = IPC_TCP_PORT, "IPC server listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("IPC server shutting down");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    spawn_ipc_task(stream, node.clone(), queue.clone());
                }
            }
        }
    }
}

fn spawn_ipc_task<S>(mut stream: S, node: Arc<Node>, queue: SyncQueue)
where
    S: AsyncReadExt + AsyncWriteExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut raw = Vec::new();
        if stream.read_to_end(&mut raw).await.is_err() {
            return;
        }
        let response = dispatch(&node, &queue, &raw).await;
        let _ = stream.write_all(&response.encode()).await;
        let _ = stream.shutdown().await;
    });
}

fn ok_response(result: Option<Value>, message: &str) -> Value {
    let mut b = MapBuilder::new()
        .entry(b"status", "ok")
        .entry(b"message", message);
    if let Some(result) = result {
        b = b.entry(b"result", result);
    }
    b.build()
}

fn error_response(message: &str) -> Value {
    MapBuilder::new()
        .entry(b"status", "error")
        .entry(b"error", ErrorCode::Exception as u64)
        .entry(b"message", message)
        .build()
}

/// Decode and route one frontend request.
pub async fn dispatch(node: &Arc<Node>, queue: &SyncQueue, raw: &[u8]) -> Value {
    let Ok(request) = Value::decode(raw) else {
        return error_response("malformed request");
    };
    let Some(action) = request.get(b"action").and_then(Value::as_str).map(String::from) else {
        return error_response("missing action");
    };

    let result = match action.as_str() {
        "get_owned_drops" => handle_list_drops(node, true).await,
        "get_subscribed_drops" => handle_list_drops(node, false).await,
        "get_selected_drop" => handle_selected_drop(node, &request).await,
        "input_subscribe_drop" => handle_subscribe(node, queue, &request).await,
        "add_owner" => handle_owner_change(node, &request, true).await,
        "remove_owner" => handle_owner_change(node, &request, false).await,
        "initialize_drop" => handle_initialize_drop(node, &request).await,
        "new_version" => handle_new_version(node, &request).await,
        "delete_drop" => handle_delete_drop(node, &request).await,
        "unsubscribe" => handle_unsubscribe(node, &request).await,
        "share_drop" => handle_share_drop(node, &request).await,
        "pending_changes" => handle_pending_changes(node, &request).await,
        other => Err(SyncError::Verification(format!("unknown action: {other}"))),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(action, error = %e, "IPC request failed");
            error_response(&e.to_string())
        }
    }
}

fn request_drop_id(request: &Value) -> Result<DropId, SyncError> {
    request
        .get(b"drop_id")
        .and_then(Value::as_bytes)
        .and_then(drop_id_from_bytes)
        .ok_or_else(|| SyncError::Verification("missing drop_id".into()))
}

async fn drop_summary(node: &Arc<Node>, drop_id: DropId) -> Result<Option<Value>, SyncError> {
    let save_dir = node.get_drop_location(drop_id).await?;
    let Some(record) = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None).await?
    else {
        return Ok(None);
    };
    Ok(Some(
        MapBuilder::new()
            .entry(b"drop_id", drop_id.as_slice())
            .entry(b"name", record.name.as_str())
            .entry(b"version", record.version.version)
            .entry(b"version_nonce", record.version.nonce)
            .entry(b"primary_owner", record.primary_owner.as_slice())
            .entry(b"save_dir", save_dir.to_string_lossy().as_ref())
            .entry(b"file_count", record.files.len() as u64)
            .build(),
    ))
}

/// Owned drops have this node in the owner set; subscribed drops are the
/// rest of the registry.
async fn handle_list_drops(node: &Arc<Node>, owned: bool) -> Result<Value, SyncError> {
    let me = node.node_id();
    let mut drops = Vec::new();
    for drop_id in node.list_drops().await? {
        let save_dir = match node.get_drop_location(drop_id).await {
            Ok(dir) => dir,
            Err(_) => continue,
        };
        let Some(record) = DropMetadata::read(&drop_id, &drop_metadata_dir(&save_dir), None).await?
        else {
            continue;
        };
        if record.is_owner(&me) == owned {
            if let Some(summary) = drop_summary(node, drop_id).await? {
                drops.push(summary);
            }
        }
    }
    Ok(ok_response(Some(Value::List(drops)), ""))
}

async fn handle_selected_drop(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    match drop_summary(node, drop_id).await? {
        Some(summary) => Ok(ok_response(Some(summary), "")),
        None => Ok(error_response("drop has no local metadata")),
    }
}

async fn handle_subscribe(
    _node: &Arc<Node>,
    queue: &SyncQueue,
    request: &Value,
) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    let save_dir = request
        .get(b"save_dir")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Verification("missing save_dir".into()))?;
    queue
        .queue_sync(drop_id, PathBuf::from(save_dir))
        .map_err(|e| SyncError::Verification(e.to_string()))?;
    Ok(ok_response(None, "subscription queued"))
}

async fn handle_owner_change(
    node: &Arc<Node>,
    request: &Value,
    add: bool,
) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    let owner = request
        .get(b"owner_id")
        .and_then(Value::as_bytes)
        .and_then(id_from_bytes)
        .ok_or_else(|| SyncError::Verification("missing owner_id".into()))?;
    let record = if add {
        version::make_new_version(node, drop_id, Some(owner), None).await?
    } else {
        version::make_new_version(node, drop_id, None, Some(owner)).await?
    };
    Ok(ok_response(
        Some(Value::Int(record.version.version)),
        if add { "owner added" } else { "owner removed" },
    ))
}

async fn handle_initialize_drop(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let directory = request
        .get(b"directory")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Verification("missing directory".into()))?;
    let drop_id = version::initialize_drop(node, std::path::Path::new(directory), None).await?;
    Ok(ok_response(
        Some(Value::Bytes(drop_id.to_vec())),
        "drop initialized",
    ))
}

async fn handle_new_version(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    let record = version::make_new_version(node, drop_id, None, None).await?;
    Ok(ok_response(
        Some(Value::Int(record.version.version)),
        "new version created",
    ))
}

async fn handle_delete_drop(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    version::delete_drop(node, drop_id).await?;
    Ok(ok_response(None, "drop deleted"))
}

async fn handle_unsubscribe(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    version::unsubscribe(node, drop_id).await?;
    Ok(ok_response(None, "unsubscribed"))
}

async fn handle_share_drop(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    // Confirm we actually have it before handing out an ID.
    node.get_drop_location(drop_id).await?;
    Ok(ok_response(
        Some(Value::from(crypto::b64encode(&drop_id))),
        "share this drop ID",
    ))
}

async fn handle_pending_changes(node: &Arc<Node>, request: &Value) -> Result<Value, SyncError> {
    let drop_id = request_drop_id(request)?;
    let changes = version::check_for_changes(node, drop_id).await?;
    let to_list = |set: &std::collections::BTreeSet<String>| {
        Value::List(set.iter().map(|s| Value::from(s.as_str())).collect())
    };
    Ok(ok_response(
        Some(
            MapBuilder::new()
                .entry(b"added", to_list(&changes.added))
                .entry(b"removed", to_list(&changes.removed))
                .entry(b"changed", to_list(&changes.changed))
                .entry(b"unchanged", to_list(&changes.unchanged))
                .build(),
        ),
        "",
    ))
}

// ── Tests ────────────────────────────────────────────────────────────────────
