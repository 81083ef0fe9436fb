//! Two-node download scenarios: full sync, resume, and failure surfacing.

use crate::*;

use syncr_services::fileio::part_path;
use syncr_services::sync::{self, SyncError};
use syncr_services::version;

/// Node A publishes a drop with a small file and a 20 MiB (3 chunk) binary;
/// node B syncs it bit-identically and passes the full verification pass.
#[tokio::test]
async fn full_sync_between_two_nodes() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    let big = big_payload(20);
    populate(dir_a.path(), &[("a.txt", &vec![b'x'; 1024]), ("b.bin", &big)]);

    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    let dir_b = tempfile::tempdir().unwrap();
    let (done, synced_id) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done, "sync should complete with A as the only peer");
    assert_eq!(synced_id, drop_id);

    assert_eq!(
        std::fs::read(dir_b.path().join("a.txt")).unwrap(),
        vec![b'x'; 1024]
    );
    assert_eq!(std::fs::read(dir_b.path().join("b.bin")).unwrap(), big);
    assert!(version::check_drop(&b.node, drop_id).await.unwrap());
}

/// A sync interrupted mid-file leaves a `.part` with intact chunks; the
/// next sync keeps them and only fetches the rest.
#[tokio::test]
async fn partial_download_resumes() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    let big = big_payload(20);
    populate(dir_a.path(), &[("b.bin", &big)]);

    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    // Simulate the interrupted first sync: the first chunk (8 MiB) already
    // sits in a .part file of the right length.
    let dir_b = tempfile::tempdir().unwrap();
    let target = dir_b.path().join("b.bin");
    let mut partial = big[..8 * 1024 * 1024].to_vec();
    partial.resize(big.len(), 0);
    std::fs::write(part_path(&target), &partial).unwrap();

    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done);
    assert_eq!(std::fs::read(&target).unwrap(), big);
    assert!(version::check_drop(&b.node, drop_id).await.unwrap());
}

/// With nobody announcing the drop, sync fails with a peer-store error.
#[tokio::test]
async fn sync_without_peers_fails() {
    let dht = start_dht().await;
    let b = start_node(&dht).await;

    let dir_b = tempfile::tempdir().unwrap();
    let err = sync::sync_drop(&b.node, [0x42; 64], dir_b.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PeerStore(_)), "got: {err}");
}

/// Both sides serve after a sync: a third node can fetch from B alone.
#[tokio::test]
async fn synced_node_serves_onward() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;
    let c = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    populate(dir_a.path(), &[("f.txt", b"pass it on")]);
    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    let dir_b = tempfile::tempdir().unwrap();
    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done);

    // A disappears; only B announces now.
    drop(a);
    announce_drop(&b, drop_id).await;

    let dir_c = tempfile::tempdir().unwrap();
    let (done, _) = sync::sync_drop(&c.node, drop_id, dir_c.path(), None)
        .await
        .unwrap();
    assert!(done);
    assert_eq!(std::fs::read(dir_c.path().join("f.txt")).unwrap(), b"pass it on");
}
