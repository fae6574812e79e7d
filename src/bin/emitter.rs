use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::services::emitter::Emitter;
use chathub::storage::Layout;

/// Emitter: delivers reply intents and overlay events.
#[derive(Parser)]
#[command(name = "chathub-emitter")]
struct Args {
    /// Deployment root containing ChatManager/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let layout = Layout::new(&args.root);
    let cfg = match Config::load(&layout.config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[emitter] {}", e);
            std::process::exit(2);
        }
    };
    chathub::logging::init("emitter", &args.root, &cfg.logging);

    match Emitter::with_config(&layout, &cfg) {
        Ok(mut emitter) => emitter.run().await,
        Err(e) => {
            log::error!("[emitter] startup failed: {}", e);
            std::process::exit(1);
        }
    }
}
