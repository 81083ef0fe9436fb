//! `run-dht-server` — serve the peer-list aware key/value store.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use syncr_services::discovery::dht::{serve_dht, DhtStorage};
use syncr_services::discovery::PEER_AVAILABILITY_TTL;

pub async fn run_dht_server(args: &[&str]) -> Result<()> {
    let [listen_port] = args else {
        bail!("usage: run-dht-server <listen_port>");
    };
    let listen_port: u16 = listen_port.parse().context("listen port must be a number")?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .with_context(|| format!("binding port {listen_port}"))?;
    println!("DHT server listening on port {listen_port} (ctrl-c to stop)");

    let storage = Arc::new(DhtStorage::new(PEER_AVAILABILITY_TTL));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_dht(listener, storage, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    Ok(())
}
