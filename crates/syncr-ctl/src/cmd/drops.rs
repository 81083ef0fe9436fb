//! Drop lifecycle commands.

use std::path::Path;

use anyhow::{bail, Context, Result};

use syncr_core::crypto;
use syncr_services::{sync, version, Node};

use super::parse_drop_id;

pub async fn drop_init(args: &[&str]) -> Result<()> {
    let [directory] = args else {
        bail!("usage: drop-init <directory>");
    };
    let directory = Path::new(directory)
        .canonicalize()
        .with_context(|| format!("resolving {directory}"))?;

    let node = Node::load(None).await?;
    let drop_id = version::initialize_drop(&node, &directory, None).await?;
    println!("Drop initialized from {}", directory.display());
    println!("Drop ID: {}", crypto::b64encode(&drop_id));
    Ok(())
}

pub async fn sync_drop(args: &[&str]) -> Result<()> {
    let [drop_id, directory] = args else {
        bail!("usage: sync-drop <drop_id> <directory>");
    };
    let drop_id = parse_drop_id(drop_id)?;
    let directory = Path::new(directory);
    tokio::fs::create_dir_all(directory).await?;
    let directory = directory.canonicalize()?;

    let node = Node::load(None).await?;
    let (done, _) = sync::sync_drop(&node, drop_id, &directory, None).await?;
    if done {
        println!("Drop fully synced into {}", directory.display());
        Ok(())
    } else {
        println!("Sync incomplete; run sync-drop again to fetch the missing chunks");
        std::process::exit(1);
    }
}

/// Pull the newest published version into the drop's registered directory.
pub async fn update_drop(args: &[&str]) -> Result<()> {
    let [drop_id] = args else {
        bail!("usage: update-drop <drop_id>");
    };
    let drop_id = parse_drop_id(drop_id)?;

    let node = Node::load(None).await?;
    let save_dir = node.get_drop_location(drop_id).await?;
    let (remote, newer) = version::check_for_update(&node, drop_id).await?;
    if !newer {
        println!("Already at the newest version ({})", remote.version);
        return Ok(());
    }

    println!("Updating to version {}", remote.version);
    let (done, _) = sync::sync_drop(&node, drop_id, &save_dir, Some(remote.version)).await?;
    if done {
        println!("Drop updated");
        Ok(())
    } else {
        println!("Update incomplete; run update-drop again to fetch the missing chunks");
        std::process::exit(1);
    }
}

pub async fn check_for_updates(args: &[&str]) -> Result<()> {
    let [drop_id] = args else {
        bail!("usage: check-for-updates <drop_id>");
    };
    let drop_id = parse_drop_id(drop_id)?;

    let node = Node::load(None).await?;
    let (remote, newer) = version::check_for_update(&node, drop_id).await?;
    if newer {
        println!("Update available: version {}", remote.version);
    } else {
        println!("Up to date at version {}", remote.version);
    }
    Ok(())
}

pub async fn new_version(args: &[&str]) -> Result<()> {
    let mut drop_id = None;
    let mut add_owner = None;
    let mut remove_owner = None;

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--add-owner" => {
                i += 1;
                let id = args.get(i).context("--add-owner requires a node ID")?;
                add_owner = Some(parse_node_id(id)?);
            }
            "--remove-owner" => {
                i += 1;
                let id = args.get(i).context("--remove-owner requires a node ID")?;
                remove_owner = Some(parse_node_id(id)?);
            }
            other if drop_id.is_none() => drop_id = Some(parse_drop_id(other)?),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }
    let Some(drop_id) = drop_id else {
        bail!("usage: new-version <drop_id> [--add-owner <id>] [--remove-owner <id>]");
    };

    let node = Node::load(None).await?;
    let record = version::make_new_version(&node, drop_id, add_owner, remove_owner).await?;
    println!("Published version {}", record.version);
    Ok(())
}

pub async fn check_drop(args: &[&str]) -> Result<()> {
    let [drop_id] = args else {
        bail!("usage: check-drop <drop_id>");
    };
    let drop_id = parse_drop_id(drop_id)?;

    let node = Node::load(None).await?;
    if version::check_drop(&node, drop_id).await? {
        println!("Drop is fully downloaded and correct");
        Ok(())
    } else {
        println!("Drop is incomplete or corrupt");
        std::process::exit(1);
    }
}

fn parse_node_id(text: &str) -> Result<syncr_core::types::NodeId> {
    let raw = crypto::b64decode(text).context("node ID is not valid base64")?;
    syncr_core::types::id_from_bytes(&raw).context("node ID must decode to exactly 32 bytes")
}
