//! Shared fixtures: an in-process DHT and fully wired test nodes.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use syncr_core::crypto::Keypair;
use syncr_core::types::DropId;

use syncr_services::announce;
use syncr_services::discovery::dht::{serve_dht, DhtStorage};
use syncr_services::discovery::{self, DPS_CONFIG_FILE, PEER_AVAILABILITY_TTL, PKS_CONFIG_FILE};
use syncr_services::net::server;
use syncr_services::node;
use syncr_services::Node;

/// An in-process DHT server backing both discovery stores.
pub struct TestDht {
    pub port: u16,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestDht {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn start_dht() -> TestDht {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(serve_dht(
        listener,
        Arc::new(DhtStorage::new(PEER_AVAILABILITY_TTL)),
        rx,
    ));
    TestDht { port, shutdown }
}

/// One node: home dir, identity, discovery configs, and a live request
/// listener on a loopback port.
pub struct TestNode {
    pub node: Arc<Node>,
    pub port: u16,
    _home: tempfile::TempDir,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn start_node(dht: &TestDht) -> TestNode {
    let home = tempfile::tempdir().unwrap();

    // 2048-bit keys keep the suite fast; the protocol paths are identical.
    let keypair = Keypair::generate_with_size(2048).unwrap();
    node::write_private_key(home.path(), &keypair).await.unwrap();

    let config = format!(
        r#"{{"type": "dht", "bootstrap_ips": ["127.0.0.1"], "bootstrap_ports": [{}]}}"#,
        dht.port
    );
    std::fs::write(home.path().join(DPS_CONFIG_FILE), &config).unwrap();
    std::fs::write(home.path().join(PKS_CONFIG_FILE), &config).unwrap();

    let node = Node::load(Some(home.path().to_path_buf())).await.unwrap();
    announce::send_my_pub_key(&node).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(server::serve(listener, node.clone(), rx));

    TestNode {
        node,
        port,
        _home: home,
        shutdown,
    }
}

/// Announce that a node serves a drop at its listener port.
pub async fn announce_drop(test_node: &TestNode, drop_id: DropId) {
    let dps = discovery::get_drop_peer_store(&test_node.node).await.unwrap();
    dps.announce(drop_id, "127.0.0.1", test_node.port).await.unwrap();
}

/// Write a directory tree of (relative path, contents) pairs.
pub fn populate(dir: &Path, files: &[(&str, &[u8])]) {
    for (name, contents) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

/// A deterministic multi-chunk payload (with the 8 MiB default chunk size,
/// `mib` > 8 spans several chunks).
pub fn big_payload(mib: usize) -> Vec<u8> {
    let mut data = vec![0u8; mib * 1024 * 1024];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    data
}
