//! Discovery config generators.
//!
//! Both stores read the same JSON shape; these commands write `dps.json`
//! and `pks.json` under the node home so the backend and CLI pick the
//! backend up on their next start.

use anyhow::{bail, Context, Result};
use serde_json::json;

use syncr_services::discovery::{DPS_CONFIG_FILE, PKS_CONFIG_FILE};
use syncr_services::node;

async fn write_both(config: serde_json::Value) -> Result<()> {
    let home = node::default_home();
    if !node::is_node_initialized(&home) {
        bail!("node is not initialized at {} — run node-init first", home.display());
    }
    let text = serde_json::to_string_pretty(&config)?;
    for file in [DPS_CONFIG_FILE, PKS_CONFIG_FILE] {
        let path = home.join(file);
        tokio::fs::write(&path, &text)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

pub async fn make_tracker_configs(args: &[&str]) -> Result<()> {
    let [ip, port] = args else {
        bail!("usage: make-tracker-configs <ip> <port>");
    };
    let port: u16 = port.parse().context("port must be a number")?;
    write_both(json!({
        "type": "tracker",
        "ip": ip,
        "port": port,
    }))
    .await
}

pub async fn make_dht_configs(args: &[&str]) -> Result<()> {
    let Some((listen_port, bootstrap)) = args.split_first() else {
        bail!("usage: make-dht-configs <listen_port> [<ip> <port>]...");
    };
    let listen_port: u16 = listen_port.parse().context("listen port must be a number")?;
    if bootstrap.len() % 2 != 0 {
        bail!("bootstrap nodes come in <ip> <port> pairs");
    }

    let mut ips = Vec::new();
    let mut ports = Vec::new();
    for pair in bootstrap.chunks(2) {
        ips.push(pair[0].to_string());
        ports.push(pair[1].parse::<u16>().context("bootstrap port must be a number")?);
    }

    write_both(json!({
        "type": "dht",
        "bootstrap_ips": ips,
        "bootstrap_ports": ports,
        "listen_port": listen_port,
    }))
    .await
}
