//! syncrd — the syncr backend daemon.
//!
//! Wires the long-lived tasks together: the peer request listener, the
//! availability announcer, the sync-queue worker, and (unless
//! `--backendonly`) the frontend IPC server. A single shutdown flag flips
//! on ctrl-c and every loop exits at its next boundary.

mod ipc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use syncr_services::announce;
use syncr_services::net::server;
use syncr_services::queue::{self, SyncQueue};
use syncr_services::Node;

fn print_usage() {
    println!("Usage: syncrd <ip> <port> [options]");
    println!();
    println!("Runs the syncr backend: serves chunks and metadata to peers,");
    println!("announces local drops, and processes queued syncs.");
    println!();
    println!("Options:");
    println!("  --backendonly             Do not start the frontend IPC server");
    println!("  --external-address <ip>   Announce this address instead of the bind address");
    println!("  --external-port <port>    Announce this port instead of the bind port");
}

struct Args {
    ip: String,
    port: u16,
    backend_only: bool,
    external_address: Option<String>,
    external_port: Option<u16>,
}

fn parse_args() -> Result<Args> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut positional = Vec::new();
    let mut backend_only = false;
    let mut external_address = None;
    let mut external_port = None;

    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--backendonly" => backend_only = true,
            "--external-address" => {
                i += 1;
                external_address =
                    Some(raw.get(i).context("--external-address requires a value")?.clone());
            }
            "--external-port" => {
                i += 1;
                external_port = Some(
                    raw.get(i)
                        .context("--external-port requires a value")?
                        .parse()
                        .context("--external-port must be a number")?,
                );
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    if positional.len() != 2 {
        print_usage();
        anyhow::bail!("expected <ip> <port>");
    }
    Ok(Args {
        ip: positional[0].clone(),
        port: positional[1].parse().context("port must be a number")?,
        backend_only,
        external_address,
        external_port,
    })
}

fn init_tracing() {
    // RUST_LOG wins; LOG_LEVEL is the documented knob (default INFO).
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = parse_args()?;

    let node = Node::load(None).await.context("loading node identity")?;

    let listener = tokio::net::TcpListener::bind((args.ip.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.ip, args.port))?;
    tracing::info!(ip = %args.ip, port = args.port, "syncrd starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Peers verify our signatures against the PKS; publish the key first.
    if let Err(e) = announce::send_my_pub_key(&node).await {
        tracing::warn!(error = %e, "could not publish public key");
    }

    let listener_task = tokio::spawn(server::serve(listener, node.clone(), shutdown_rx.clone()));

    let announce_ip = args.external_address.clone().unwrap_or_else(|| args.ip.clone());
    let announce_port = args.external_port.unwrap_or(args.port);
    let announcer_task = tokio::spawn(announce::announce_loop(
        node.clone(),
        announce_ip,
        announce_port,
        shutdown_rx.clone(),
    ));

    let (sync_queue, queue_rx) = SyncQueue::new();
    let queue_task = tokio::spawn(queue::process_sync_queue(
        node.clone(),
        sync_queue.clone(),
        queue_rx,
        shutdown_rx.clone(),
    ));

    let ipc_task = if args.backend_only {
        None
    } else {
        Some(tokio::spawn(ipc::serve_ipc(
            node.clone(),
            sync_queue,
            shutdown_rx.clone(),
        )))
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = listener_task.await;
    let _ = announcer_task.await;
    let _ = queue_task.await;
    if let Some(task) = ipc_task {
        if let Ok(Err(e)) = task.await {
            tracing::warn!(error = %e, "IPC server exited with error");
        }
    }
    tracing::info!("syncrd stopped");
    Ok(())
}
