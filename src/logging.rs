//! Per-service logging setup on the `log` facade.
//!
//! Console output goes through `env_logger` (millisecond timestamps,
//! `RUST_LOG` wins over the config level). When `logging.dir` is configured
//! the service instead writes to `<dir>/<service>.<YYYY-MM-DD>.log`, with a
//! size check at startup that shifts oversized files through numbered
//! backups.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::config::LoggingConfig;
use crate::storage;

fn level_filter(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => "error",
        "WARNING" | "WARN" => "warn",
        "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => "info",
    }
}

fn resolve_log_dir(root: &Path, cfg: &LoggingConfig) -> Option<PathBuf> {
    let raw = cfg.dir.trim();
    if raw.is_empty() {
        return None;
    }
    let p = Path::new(raw);
    if p.is_absolute() {
        Some(p.to_path_buf())
    } else {
        Some(root.join(p))
    }
}

/// Shift `file` → `file.1` → … → `file.<backup_count>` when it exceeds
/// `max_bytes`. Startup-only; a long-running service rotates on next launch.
fn rotate_if_oversized(path: &Path, max_bytes: u64, backup_count: u32) {
    if max_bytes == 0 || storage::file_size(path) < max_bytes {
        return;
    }
    for i in (1..=backup_count.max(1)).rev() {
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            numbered(path, i - 1)
        };
        let dst = numbered(path, i);
        if src.exists() {
            let _ = std::fs::rename(&src, &dst);
        }
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let mut name = path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
    name.push(format!(".{}", n));
    path.with_file_name(name)
}

/// Initialize logging for one service process. Safe to call more than once
/// (later calls are no-ops), which keeps tests simple.
pub fn init(service: &str, root: &Path, cfg: &LoggingConfig) {
    let filter = format!("chathub={},warn", level_filter(&cfg.level));
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter.as_str()));
    builder.format_timestamp_millis();

    if let Some(dir) = resolve_log_dir(root, cfg) {
        if storage::ensure_dir(&dir).is_ok() {
            let date = chrono::Local::now().format("%Y-%m-%d");
            let file_path = dir.join(format!("{}.{}.log", service, date));
            rotate_if_oversized(&file_path, cfg.max_bytes, cfg.backup_count);
            match OpenOptions::new().create(true).append(true).open(&file_path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => eprintln!("[{}] log file {} unavailable: {}", service, file_path.display(), e),
            }
        }
    }

    let _ = builder.try_init();
    log::debug!("[logging] initialized for {} (level={})", service, cfg.level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_is_case_insensitive() {
        assert_eq!(level_filter("debug"), "debug");
        assert_eq!(level_filter("WARN"), "warn");
        assert_eq!(level_filter("warning"), "warn");
        assert_eq!(level_filter("bogus"), "info");
    }

    #[test]
    fn rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.log");
        std::fs::write(&path, vec![b'x'; 100]).unwrap();
        std::fs::write(numbered(&path, 1), b"old").unwrap();

        rotate_if_oversized(&path, 50, 3);
        assert!(!path.exists());
        assert_eq!(std::fs::read(numbered(&path, 1)).unwrap().len(), 100);
        assert_eq!(std::fs::read(numbered(&path, 2)).unwrap(), b"old");
    }

    #[test]
    fn rotation_is_noop_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.log");
        std::fs::write(&path, b"small").unwrap();
        rotate_if_oversized(&path, 1024, 3);
        assert!(path.exists());
    }
}
