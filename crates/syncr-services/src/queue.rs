//! The background sync queue.
//!
//! Subscriptions and retries funnel through a bounded queue; a worker
//! drains it with a small concurrency and puts failed syncs back after a
//! cooldown. The worker observes the shutdown flag between items — in-flight
//! syncs finish, nothing new starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};

use syncr_core::crypto;
use syncr_core::types::DropId;

use crate::node::Node;
use crate::sync;

/// Most drops that can sync at once out of the queue.
pub const MAX_CONCURRENT_QUEUED_SYNCS: usize = 4;

/// Queue depth; `queue_sync` fails once this many requests are waiting.
pub const SYNC_QUEUE_DEPTH: usize = 32;

/// How long a failed sync waits before it is re-enqueued.
pub const RETRY_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub drop_id: DropId,
    pub save_dir: PathBuf,
}

/// Producer handle for the sync queue.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncRequest>,
}

impl SyncQueue {
    pub fn new() -> (Self, mpsc::Receiver<SyncRequest>) {
        let (tx, rx) = mpsc::channel(SYNC_QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    /// Enqueue a sync. Fails when the queue is full or the worker is gone.
    pub fn queue_sync(&self, drop_id: DropId, save_dir: PathBuf) -> Result<(), QueueFullError> {
        self.tx
            .try_send(SyncRequest { drop_id, save_dir })
            .map_err(|_| QueueFullError)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sync queue is full")]
pub struct QueueFullError;

/// Drain the queue until shutdown. Each request syncs under the concurrency
/// cap; incomplete or failed syncs are re-enqueued after [`RETRY_COOLDOWN`].
pub async fn process_sync_queue(
    node: Arc<Node>,
    queue: SyncQueue,
    mut rx: mpsc::Receiver<SyncRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(MAX_CONCURRENT_QUEUED_SYNCS));
    loop {
        let request = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("sync queue worker shutting down");
                    return;
                }
                continue;
            }
            request = rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let node = node.clone();
        let queue = queue.clone();
        let slots = slots.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = slots.acquire_owned().await.expect("semaphore never closed");
            let drop_id = request.drop_id;
            let done = match sync::sync_drop(&node, drop_id, &request.save_dir, None).await {
                Ok((done, _)) => done,
                Err(e) => {
                    tracing::warn!(
                        drop_id = %crypto::b64encode(&drop_id),
                        error = %e,
                        "queued sync failed"
                    );
                    false
                }
            };
            if !done && !*shutdown.borrow() {
                tokio::time::sleep(RETRY_COOLDOWN).await;
                if *shutdown.borrow() {
                    return;
                }
                if queue.queue_sync(drop_id, request.save_dir).is_err() {
                    tracing::warn!(
                        drop_id = %crypto::b64encode(&drop_id),
                        "could not re-enqueue incomplete sync"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_rejects_when_full() {
        let (queue, _rx) = SyncQueue::new();
        for _ in 0..SYNC_QUEUE_DEPTH {
            queue.queue_sync([0u8; 64], PathBuf::from("/tmp/x")).unwrap();
        }
        assert!(queue.queue_sync([0u8; 64], PathBuf::from("/tmp/x")).is_err());
    }

    #[tokio::test]
    async fn requests_flow_through() {
        let (queue, mut rx) = SyncQueue::new();
        queue.queue_sync([1u8; 64], PathBuf::from("/tmp/a")).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.drop_id, [1u8; 64]);
        assert_eq!(got.save_dir, PathBuf::from("/tmp/a"));
    }
}
