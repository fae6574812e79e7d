use clap::Parser;
use std::path::PathBuf;

use chathub::config::Config;
use chathub::storage::Layout;
use chathub::supervisor::{OsMode, Supervisor, SupervisorArgs};
use tokio_util::sync::CancellationToken;

/// Supervisor: starts and monitors the ChatManager services and workers.
#[derive(Parser)]
#[command(name = "chathub-supervisor")]
struct Args {
    /// Deployment root containing ChatManager/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
    /// Run everything in the same console (windows only).
    #[arg(long)]
    same_console: bool,
    /// Do not start configured overlay/static servers.
    #[arg(long)]
    no_servers: bool,
    /// Skip the upstream chat-feed writer.
    #[arg(long)]
    skip_writer: bool,
    /// Do not start worker bots.
    #[arg(long)]
    no_workers: bool,
    #[arg(long, default_value_t = 8080)]
    overlay_port: u16,
    #[arg(long, default_value_t = 8788)]
    manager_port: u16,
    /// Restart services/workers when their bus activity goes stale.
    #[arg(long)]
    restart_stale: bool,
    #[arg(long, default_value_t = 45.0)]
    stale_services: f64,
    #[arg(long, default_value_t = 60.0)]
    stale_workers: f64,
    #[arg(long, default_value_t = 0.5)]
    check_every: f64,
    #[arg(long, default_value_t = 2.0)]
    status_every: f64,
    /// Allow multiple worker instances on one inbox (CAN duplicate work).
    #[arg(long)]
    allow_duplicate_inbox: bool,
    /// Teardown strategy; auto detects the current platform.
    #[arg(long, value_enum, default_value = "auto")]
    os: OsArg,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OsArg {
    Auto,
    Windows,
    Mac,
}

impl From<OsArg> for OsMode {
    fn from(value: OsArg) -> OsMode {
        match value {
            OsArg::Auto => OsMode::Auto,
            OsArg::Windows => OsMode::Windows,
            OsArg::Mac => OsMode::Mac,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let layout = Layout::new(&args.root);
    let cfg = match Config::load(&layout.config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[supervisor] {}", e);
            std::process::exit(2);
        }
    };
    chathub::logging::init("supervisor", &args.root, &cfg.logging);

    let sup_args = SupervisorArgs {
        same_console: args.same_console,
        no_servers: args.no_servers,
        skip_writer: args.skip_writer,
        no_workers: args.no_workers,
        overlay_port: args.overlay_port,
        manager_port: args.manager_port,
        restart_stale: args.restart_stale,
        stale_services: args.stale_services,
        stale_workers: args.stale_workers,
        check_every: args.check_every,
        status_every: args.status_every,
        allow_duplicate_inbox: args.allow_duplicate_inbox,
        os: args.os.into(),
    };

    let mut sup = match Supervisor::new(&args.root, sup_args) {
        Ok(sup) => sup,
        Err(e) => {
            eprintln!("[supervisor] {}", e);
            std::process::exit(2);
        }
    };
    sup.build();

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[supervisor] shutdown requested");
            cancel_for_signal.cancel();
        }
    });

    let rc = sup.run(cancel).await;
    std::process::exit(rc);
}
