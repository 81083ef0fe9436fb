//! syncr-ctl — command-line interface for syncr.
//!
//! Local drop lifecycle (init, sync, versioning, verification) plus the
//! config generators and the standalone DHT server. The long-running
//! backend is the separate `syncrd` binary.

use anyhow::Result;

mod cmd;

fn print_usage() {
    println!("Usage: syncr-ctl <command> [args]");
    println!();
    println!("Node");
    println!("  node-init [--force]                   Create the node identity and home dir");
    println!("  make-tracker-configs <ip> <port>      Use a tracker for peer/key discovery");
    println!("  make-dht-configs <listen_port> [<ip> <port>]...");
    println!("                                        Use a DHT for peer/key discovery");
    println!();
    println!("Drops");
    println!("  drop-init <directory>                 Publish a directory as a new drop");
    println!("  sync-drop <drop_id> <directory>       Download a drop into a directory");
    println!("  update-drop <drop_id>                 Sync the newest published version");
    println!("  check-for-updates <drop_id>           Compare local state against peers");
    println!("  new-version <drop_id> [--add-owner <id>] [--remove-owner <id>]");
    println!("                                        Publish local changes as a new version");
    println!("  check-drop <drop_id>                  Exit 0 iff fully downloaded and correct");
    println!();
    println!("Servers");
    println!("  run-dht-server <listen_port>          Serve the DHT key/value store");
    println!();
    println!("Drop IDs are the base64 strings printed by drop-init and share-drop.");
    println!("LOG_LEVEL sets log verbosity (default INFO).");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let Some(command) = arg_refs.first() else {
        print_usage();
        std::process::exit(2);
    };

    // Accept snake_case spellings of every command too.
    let command = command.replace('_', "-");
    let rest = &arg_refs[1..];

    match command.as_str() {
        "node-init" => cmd::node::node_init(rest).await,
        "make-tracker-configs" => cmd::configs::make_tracker_configs(rest).await,
        "make-dht-configs" => cmd::configs::make_dht_configs(rest).await,
        "drop-init" => cmd::drops::drop_init(rest).await,
        "sync-drop" => cmd::drops::sync_drop(rest).await,
        "update-drop" => cmd::drops::update_drop(rest).await,
        "check-for-updates" => cmd::drops::check_for_updates(rest).await,
        "new-version" => cmd::drops::new_version(rest).await,
        "check-drop" => cmd::drops::check_drop(rest).await,
        "run-dht-server" => cmd::dht::run_dht_server(rest).await,
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("unknown command: {other}");
        }
    }
}
