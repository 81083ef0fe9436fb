//! Version propagation between nodes: updates, ownership, and conflicts.

use crate::*;

use syncr_services::sync::{self, SyncError};
use syncr_services::version;

/// A publishes v2 with a changed small file; B sees the update and syncs it
/// while the untouched big file stays in place.
#[tokio::test]
async fn new_version_propagates() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    let big = big_payload(9);
    populate(dir_a.path(), &[("a.txt", b"version one"), ("b.bin", &big)]);
    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    let dir_b = tempfile::tempdir().unwrap();
    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done);

    // Up to date right now.
    let (_, newer) = version::check_for_update(&b.node, drop_id).await.unwrap();
    assert!(!newer);

    // A changes the small file and publishes.
    std::fs::write(dir_a.path().join("a.txt"), b"version two").unwrap();
    let v2 = version::make_new_version(&a.node, drop_id, None, None)
        .await
        .unwrap();

    let (remote, newer) = version::check_for_update(&b.node, drop_id).await.unwrap();
    assert!(newer);
    assert_eq!(remote.version, v2.version);

    // Keep a timestamp on the already-complete big file; it must not be
    // rewritten by the update sync.
    let before = std::fs::metadata(dir_b.path().join("b.bin")).unwrap().modified().unwrap();

    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), Some(remote.version))
        .await
        .unwrap();
    assert!(done);
    assert_eq!(std::fs::read(dir_b.path().join("a.txt")).unwrap(), b"version two");
    assert_eq!(std::fs::read(dir_b.path().join("b.bin")).unwrap(), big);
    let after = std::fs::metadata(dir_b.path().join("b.bin")).unwrap().modified().unwrap();
    assert_eq!(before, after, "unchanged file must not be rewritten");

    assert!(version::check_drop(&b.node, drop_id).await.unwrap());
}

/// Ownership handoff: A adds B as an owner; B can then publish a version
/// that A accepts.
#[tokio::test]
async fn added_owner_can_publish() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    populate(dir_a.path(), &[("shared.txt", b"original")]);
    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    let dir_b = tempfile::tempdir().unwrap();
    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done);

    // v2: B joins the owner set.
    version::make_new_version(&a.node, drop_id, Some(b.node.node_id()), None)
        .await
        .unwrap();
    let (remote, newer) = version::check_for_update(&b.node, drop_id).await.unwrap();
    assert!(newer);
    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), Some(remote.version))
        .await
        .unwrap();
    assert!(done);

    // v3: B publishes a change, A verifies and syncs it.
    std::fs::write(dir_b.path().join("shared.txt"), b"changed by b").unwrap();
    let v3 = version::make_new_version(&b.node, drop_id, None, None)
        .await
        .unwrap();
    assert_eq!(v3.version.version, 3);
    announce_drop(&b, drop_id).await;

    let (remote, newer) = version::check_for_update(&a.node, drop_id).await.unwrap();
    assert!(newer);
    assert_eq!(remote.signed_by, b.node.node_id());
    let (done, _) = sync::sync_drop(&a.node, drop_id, dir_a.path(), Some(remote.version))
        .await
        .unwrap();
    assert!(done);
    assert_eq!(
        std::fs::read(dir_a.path().join("shared.txt")).unwrap(),
        b"changed by b"
    );
}

/// Two owners publish the same version number with different nonces from
/// one parent; the conflict is surfaced, not merged.
#[tokio::test]
async fn concurrent_versions_surface_a_conflict() {
    let dht = start_dht().await;
    let a = start_node(&dht).await;
    let b = start_node(&dht).await;

    let dir_a = tempfile::tempdir().unwrap();
    populate(dir_a.path(), &[("f.txt", b"base")]);
    let drop_id = version::initialize_drop(&a.node, dir_a.path(), None).await.unwrap();
    announce_drop(&a, drop_id).await;

    // v2 brings B into the owner set; B syncs it.
    version::make_new_version(&a.node, drop_id, Some(b.node.node_id()), None)
        .await
        .unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (done, _) = sync::sync_drop(&b.node, drop_id, dir_b.path(), None)
        .await
        .unwrap();
    assert!(done);

    // Both sides publish a v3 independently.
    std::fs::write(dir_a.path().join("f.txt"), b"a's change").unwrap();
    version::make_new_version(&a.node, drop_id, None, None).await.unwrap();
    std::fs::write(dir_b.path().join("f.txt"), b"b's change").unwrap();
    version::make_new_version(&b.node, drop_id, None, None).await.unwrap();

    // B asks the network (i.e. A) and sees the sibling v3.
    let err = version::check_for_update(&b.node, drop_id).await.unwrap_err();
    match err {
        SyncError::Verification(message) => {
            assert!(message.contains("same version, different nonce"), "{message}");
        }
        other => panic!("expected a verification error, got {other}"),
    }
}
