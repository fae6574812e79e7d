use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::services::ingestor::Ingestor;
use chathub::storage::Layout;

/// Chat ingestor: tails the upstream chat file and feeds the events bus.
#[derive(Parser)]
#[command(name = "chathub-ingestor")]
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
            eprintln!("[ingestor] {}", e);
            std::process::exit(2);
        }
    };
    chathub::logging::init("ingestor", &args.root, &cfg.logging);

    match Ingestor::with_config(&layout, &cfg) {
        Ok(mut ingestor) => ingestor.run().await,
        Err(e) => {
            log::error!("[ingestor] startup failed: {}", e);
            std::process::exit(1);
        }
    }
}
