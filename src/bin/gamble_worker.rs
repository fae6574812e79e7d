use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::storage::Layout;

/// Gamble worker: spins the slots for queued wagers.
#[derive(Parser)]
#[command(name = "chathub-gamble-worker")]
struct Args {
    /// Deployment root containing ChatManager/ and Bots/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Workers run fine without the central config; it only feeds logging.
    let layout = Layout::new(&args.root);
    let cfg = Config::load(&layout.config_path()).unwrap_or_default();
    chathub::logging::init("gamble_worker", &args.root, &cfg.logging);

    if let Err(e) = chathub::workers::gamble::run(&args.root).await {
        log::error!("[gamble] {}", e);
        std::process::exit(1);
    }
}
