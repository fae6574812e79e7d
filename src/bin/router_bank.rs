use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::services::router_bank::RouterBank;
use chathub::storage::Layout;

/// Router/Bank: command routing, points ledger, gamble FIFO.
#[derive(Parser)]
#[command(name = "chathub-router")]
struct Args {
    /// Deployment root containing ChatManager/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let layout = Layout::new(&args.root);
    // The router refuses to start without config.
    let cfg = match Config::load(&layout.config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[router] {}", e);
            std::process::exit(2);
        }
    };
    chathub::logging::init("router_bank", &args.root, &cfg.logging);

    match RouterBank::with_config(&layout, cfg) {
        Ok(mut router) => router.run().await,
        Err(e) => {
            log::error!("[router] startup failed: {}", e);
            std::process::exit(1);
        }
    }
}
