//! `node-init` — create the node identity.

use anyhow::{bail, Result};

use syncr_core::crypto;
use syncr_services::node;

pub async fn node_init(args: &[&str]) -> Result<()> {
    let mut force = false;
    for arg in args {
        match *arg {
            "--force" => force = true,
            other => bail!("unexpected argument: {other}"),
        }
    }

    let home = node::default_home();
    if node::is_node_initialized(&home) && !force {
        bail!(
            "node already initialized at {} (use --force to wipe and regenerate)",
            home.display()
        );
    }

    println!("Generating RSA keypair; this can take a moment...");
    node::initialize_node(&home, force).await?;

    let keypair = node::load_keypair(&home).await?;
    println!("Node initialized at {}", home.display());
    println!("Node ID: {}", crypto::b64encode(&keypair.node_id()?));
    Ok(())
}
