//! Maintenance utility: clear pipeline/state/overlay/log files, with
//! backups. Run with all services stopped.

use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};

use chathub::config::Config;
use chathub::storage::Layout;

#[derive(Parser)]
#[command(name = "chathub-clear")]
struct Args {
    /// Deployment root containing ChatManager/.
    #[arg(long, default_value = ".", env = "CHATHUB_ROOT")]
    root: PathBuf,
    /// Clear bus pipeline files (*.jsonl).
    #[arg(long)]
    pipeline: bool,
    /// Clear state (offsets/inflight/gamble queue).
    #[arg(long)]
    state: bool,
    /// Also wipe user_state.json (points).
    #[arg(long)]
    reset_points: bool,
    /// Clear overlay extras (chat additions, events, mirrored user state).
    #[arg(long)]
    overlay: bool,
    /// Clear logs/*.log.
    #[arg(long)]
    logs: bool,
    /// Everything (pipeline + state + overlay + logs).
    #[arg(long)]
    all: bool,
    /// Do not back files up before clearing.
    #[arg(long)]
    no_backup: bool,
    /// Do not prompt for confirmation.
    #[arg(long)]
    yes: bool,
}

fn is_under(child: &Path, parent: &Path) -> bool {
    match (child.canonicalize(), parent.canonicalize()) {
        (Ok(c), Ok(p)) => c.starts_with(p),
        // Not-yet-existing paths: compare lexically.
        _ => child.starts_with(parent),
    }
}

fn glob_files(base: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(base) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(glob_files(&path, suffix));
        } else if path.to_string_lossy().ends_with(suffix) {
            out.push(path);
        }
    }
    out
}

fn backup_file(src: &Path, backup_root: &Path, root: &Path) -> std::io::Result<()> {
    let rel = src.strip_prefix(root).unwrap_or(src);
    let dst = backup_root.join(rel);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut args = Args::parse();
    let root = args.root.clone();
    let layout = Layout::new(&root);

    if !layout.manager_dir.exists() {
        eprintln!("[clear] ERROR: ChatManager folder not found at: {}", layout.manager_dir.display());
        return 2;
    }

    if args.all {
        args.pipeline = true;
        args.state = true;
        args.overlay = true;
        args.logs = true;
    }
    if !(args.pipeline || args.state || args.overlay || args.logs || args.reset_points) {
        eprintln!("[clear] Nothing selected. Use --pipeline/--state/--overlay/--logs or --all.");
        return 2;
    }

    // Overlay/log locations come from config when present.
    let cfg = Config::load(&layout.config_path()).unwrap_or_default();

    let mut to_truncate: Vec<PathBuf> = Vec::new();
    let mut to_delete: Vec<PathBuf> = Vec::new();

    if args.pipeline {
        to_truncate.extend(glob_files(&layout.bus_dir, ".jsonl"));
    }

    if args.state {
        for name in ["inflight.json", "gamble_queue.json"] {
            to_delete.push(layout.state_dir.join(name));
        }
        // Any offsets.*.json, including per-reader cursors.
        to_delete.extend(
            glob_files(&layout.state_dir, ".json")
                .into_iter()
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().starts_with("offsets."))
                        .unwrap_or(false)
                }),
        );
        // Worker-local cursors too.
        let bots_dir = root.join("Bots");
        to_delete.extend(
            glob_files(&bots_dir, "offsets.json"),
        );
        if args.reset_points {
            to_delete.push(layout.state_dir.join("user_state.json"));
        }
    }

    if args.overlay {
        let overlay = &cfg.overlay_fallback;
        if !overlay.chat_file.trim().is_empty() {
            to_truncate.push(layout.resolve_from_root(overlay.chat_file.trim()));
        }
        if !overlay.overlay_events_file.trim().is_empty() {
            to_truncate.push(layout.resolve_from_root(overlay.overlay_events_file.trim()));
        }
        if !overlay.user_state_mirror_file.trim().is_empty() {
            to_delete.push(layout.resolve_from_root(overlay.user_state_mirror_file.trim()));
        }
    }

    if args.logs {
        let logs_dir = if cfg.logging.dir.trim().is_empty() {
            layout.logs_dir()
        } else {
            layout.resolve_from_root(cfg.logging.dir.trim())
        };
        to_truncate.extend(glob_files(&logs_dir, ".log"));
    }

    // Dedup and keep everything under the root.
    let mut seen = std::collections::HashSet::new();
    let keep = |p: &PathBuf, seen: &mut std::collections::HashSet<String>| {
        let key = p.to_string_lossy().into_owned();
        is_under(p, &root) && seen.insert(key)
    };
    let to_truncate: Vec<PathBuf> =
        to_truncate.into_iter().filter(|p| keep(p, &mut seen)).collect();
    let to_delete: Vec<PathBuf> =
        to_delete.into_iter().filter(|p| keep(p, &mut seen)).collect();

    println!("[clear] Target root: {}", root.display());
    println!("[clear] Will TRUNCATE (empty) these files:");
    for p in &to_truncate {
        println!("   - {}", p.display());
    }
    println!("[clear] Will DELETE these files:");
    for p in &to_delete {
        println!("   - {}", p.display());
    }

    if !args.yes {
        print!("\nType YES to proceed: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() || line.trim() != "YES" {
            println!("[clear] Cancelled.");
            return 1;
        }
    }

    if !args.no_backup {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_root = root.join(".backup_clear").join(stamp.to_string());
        for p in to_truncate.iter().chain(&to_delete) {
            if p.exists() {
                if let Err(e) = backup_file(p, &backup_root, &root) {
                    eprintln!("[clear] WARN: backup failed for {}: {}", p.display(), e);
                }
            }
        }
        println!("[clear] Backup saved to: {}", backup_root.display());
    }

    for p in &to_truncate {
        if let Err(e) = std::fs::write(p, b"") {
            eprintln!("[clear] ERROR: could not truncate {}: {}", p.display(), e);
        }
    }
    for p in &to_delete {
        if p.exists() {
            if let Err(e) = std::fs::remove_file(p) {
                eprintln!("[clear] ERROR: could not delete {}: {}", p.display(), e);
            }
        }
    }

    println!("[clear] Done.");
    0
}
