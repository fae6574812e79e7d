use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::storage::Layout;
use chathub::workers::music::{MusicApi, UnconfiguredMusic};

/// Music worker: chat-controlled playback, active/standby.
#[derive(Parser)]
#[command(name = "chathub-music-worker")]
struct Args {
    /// Deployment root containing ChatManager/ and Bots/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let layout = Layout::new(&args.root);
    let cfg = Config::load(&layout.config_path()).unwrap_or_default();
    chathub::logging::init("music_worker", &args.root, &cfg.logging);

    // The real client library is wired here when available; the placeholder
    // keeps the worker answering (with error replies) without it.
    let make_api = Box::new(|| Box::new(UnconfiguredMusic) as Box<dyn MusicApi>);

    if let Err(e) = chathub::workers::music::run(&args.root, make_api).await {
        log::error!("[music] {}", e);
        std::process::exit(1);
    }
}
