//! Atomic JSON state persistence and directory layout helpers.
//!
//! Every state file (cursors, user state, inflight map, gamble queue,
//! heartbeats, supervisor status) is published with write-tmp-then-rename so
//! readers in other processes observe either the old or the new content,
//! never a partial write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create an empty file (and its parent dirs) if it does not exist yet.
pub fn ensure_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    if !path.exists() {
        fs::write(path, b"")?;
    }
    Ok(())
}

/// Load a JSON file into `T`, falling back to `default` on any failure
/// (missing file, unreadable, malformed). State files are advisory; a broken
/// one is equivalent to a fresh start.
pub fn load_json_or<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or(default),
        Err(_) => default,
    }
}

/// Load a JSON file as a raw `Value`, or `None` when missing/malformed.
pub fn load_json_value(path: &Path) -> Option<serde_json::Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Atomic publish: serialize to `<path>.tmp`, then rename over `path`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).map_err(|e| format!("ensure_dir {} failed: {}", parent.display(), e))?;
    }
    let tmp = tmp_path(path);
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("serialize failed: {}", e))?;
    fs::write(&tmp, text).map_err(|e| format!("write {} failed: {}", tmp.display(), e))?;
    fs::rename(&tmp, path).map_err(|e| format!("rename to {} failed: {}", path.display(), e))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// File mtime in seconds since the epoch, 0.0 when unavailable.
pub fn mtime_secs(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Well-known paths under the deployment root.
///
/// ```text
/// <root>/ChatManager/commands.json      config
/// <root>/ChatManager/bus/               jsonl bus files
/// <root>/ChatManager/state/             cursors + router state
/// <root>/ChatManager/config/            slots config
/// <root>/Bots/<id>/state/               worker-local state (offsets, locks)
/// <root>/logs/                          service logs
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub manager_dir: PathBuf,
    pub bus_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Layout {
        let manager_dir = root.join("ChatManager");
        Layout {
            root: root.to_path_buf(),
            bus_dir: manager_dir.join("bus"),
            state_dir: manager_dir.join("state"),
            manager_dir,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.manager_dir.join("commands.json")
    }

    pub fn slots_config_path(&self) -> PathBuf {
        self.manager_dir.join("config").join("slots_config.json")
    }

    pub fn events_inbox(&self) -> PathBuf {
        self.bus_dir.join("events.inbox.jsonl")
    }

    pub fn replies_outbox(&self) -> PathBuf {
        self.bus_dir.join("replies.outbox.jsonl")
    }

    pub fn overlay_outbox(&self) -> PathBuf {
        self.bus_dir.join("overlay.outbox.jsonl")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("points_ledger.jsonl")
    }

    pub fn worker_dir(&self, bot_id: &str) -> PathBuf {
        self.root.join("Bots").join(bot_id)
    }

    pub fn worker_state_dir(&self, bot_id: &str) -> PathBuf {
        self.worker_dir(bot_id).join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Resolve a config-supplied path. Absolute paths pass through; relative
    /// paths are anchored at the ChatManager dir, with a leading
    /// `chatmanager/` segment stripped so config written against the root
    /// also works.
    pub fn resolve_relative(&self, raw: &str) -> PathBuf {
        let s = raw.replace('\\', "/");
        let s = s.trim();
        if s.is_empty() {
            return self.state_dir.join("missing.json");
        }
        let path = Path::new(s);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let lower = s.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("chatmanager/") {
            let tail = &s[s.len() - rest.len()..];
            return self.manager_dir.join(tail);
        }
        self.manager_dir.join(s)
    }

    /// Resolve a config-supplied path against the deployment root (used for
    /// files that live outside ChatManager, e.g. overlay append-files).
    pub fn resolve_from_root(&self, raw: &str) -> PathBuf {
        let s = raw.replace('\\', "/");
        let path = Path::new(s.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn atomic_write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut value: HashMap<String, i64> = HashMap::new();
        value.insert("points".into(), 120);

        atomic_write_json(&path, &value).unwrap();
        let loaded: HashMap<String, i64> = load_json_or(&path, HashMap::new());
        assert_eq!(loaded.get("points"), Some(&120));
        // The tmp file must not linger after a successful publish.
        assert!(!path.with_file_name("state.json.tmp").exists());
    }

    #[test]
    fn atomic_write_replaces_whole_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        atomic_write_json(&path, &vec![9]).unwrap();
        let loaded: Vec<i64> = load_json_or(&path, vec![]);
        assert_eq!(loaded, vec![9]);
    }

    #[test]
    fn load_json_or_falls_back_on_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{not json").unwrap();
        let loaded: Vec<i64> = load_json_or(&path, vec![7]);
        assert_eq!(loaded, vec![7]);
    }

    #[test]
    fn resolve_relative_strips_manager_prefix() {
        let layout = Layout::new(Path::new("/srv/stream"));
        assert_eq!(
            layout.resolve_relative("ChatManager/state/user_state.json"),
            PathBuf::from("/srv/stream/ChatManager/state/user_state.json")
        );
        assert_eq!(
            layout.resolve_relative("state/user_state.json"),
            PathBuf::from("/srv/stream/ChatManager/state/user_state.json")
        );
        assert_eq!(
            layout.resolve_relative("/abs/path.json"),
            PathBuf::from("/abs/path.json")
        );
    }
}
