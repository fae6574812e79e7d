//! Worker singleton coordination.
//!
//! Two flavors, both built on atomic exclusive file creation:
//!
//! - [`WorkerLock`]: one instance per machine, period. The lock carries the
//!   holder's pid; a lock whose pid is no longer alive is stale and removed.
//! - [`LeaderElection`]: active/standby. Holding `leader.lock` makes a
//!   process leader; only the leader heartbeats `leader_heartbeat.json`, and
//!   a standby may take over once the heartbeat is older than the TTL. The
//!   heartbeat age (not the lock file itself) decides staleness, so a
//!   crashed leader is replaced without any pid inspection.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::{now_ms, now_ts};
use crate::storage;

/// Is this pid a live process?
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes without delivering. EPERM still means "exists".
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct LockInfo {
    pid: u32,
    started_ts: u64,
}

/// Exclusive-create, or fail. Returns false when the file already exists.
fn try_create_exclusive<T: Serialize>(path: &Path, payload: &T) -> bool {
    if let Some(parent) = path.parent() {
        if storage::ensure_dir(parent).is_err() {
            return false;
        }
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    if let Ok(text) = serde_json::to_string(payload) {
        let _ = file.write_all(text.as_bytes());
    }
    true
}

/// Single-instance lock, released on drop. Survives crashes: the stored pid
/// is probed, and a dead holder's lock is cleared.
#[derive(Debug)]
pub struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    pub fn acquire(path: &Path) -> Result<WorkerLock, String> {
        if path.exists() {
            let info: LockInfo = storage::load_json_or(path, LockInfo::default());
            if info.pid != 0 && pid_alive(info.pid) {
                return Err(format!(
                    "lock {} held by running pid {}",
                    path.display(),
                    info.pid
                ));
            }
            // Stale: holder is gone.
            std::fs::remove_file(path)
                .map_err(|e| format!("stale lock {} could not be removed: {}", path.display(), e))?;
            log::info!("[lock] removed stale lock {}", path.display());
        }

        let payload = LockInfo { pid: std::process::id(), started_ts: now_ts() };
        if !try_create_exclusive(path, &payload) {
            return Err(format!("lock {} exists (lost creation race)", path.display()));
        }
        Ok(WorkerLock { path: path.to_path_buf() })
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LeaderInfo {
    pub pid: u32,
    pub role: String,
    pub instance: String,
    pub started_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct Heartbeat {
    heartbeat_ms: u64,
    pid: u32,
    role: String,
    instance: String,
}

#[derive(Debug)]
pub struct LeaderElection {
    lock_path: PathBuf,
    hb_path: PathBuf,
    ttl_sec: f64,
    payload: LeaderInfo,
}

impl LeaderElection {
    pub fn new(state_dir: &Path, payload: LeaderInfo, ttl_sec: f64) -> LeaderElection {
        LeaderElection {
            lock_path: state_dir.join("leader.lock"),
            hb_path: state_dir.join("leader_heartbeat.json"),
            ttl_sec,
            payload,
        }
    }

    fn hb_age_sec(&self) -> f64 {
        let hb: Heartbeat = storage::load_json_or(&self.hb_path, Heartbeat::default());
        if hb.heartbeat_ms == 0 {
            return f64::INFINITY;
        }
        (now_ms().saturating_sub(hb.heartbeat_ms)) as f64 / 1000.0
    }

    fn try_create_lock(&self) -> bool {
        try_create_exclusive(&self.lock_path, &self.payload)
    }

    fn steal_if_stale(&self) -> bool {
        if !self.lock_path.exists() {
            return self.try_create_lock();
        }
        if self.hb_age_sec() > self.ttl_sec {
            let _ = std::fs::remove_file(&self.lock_path);
            let _ = std::fs::remove_file(&self.hb_path);
            return self.try_create_lock();
        }
        false
    }

    /// One acquisition attempt: create the lock, or take over a stale one.
    pub fn try_acquire(&self) -> bool {
        if self.try_create_lock() || self.steal_if_stale() {
            log::info!(
                "[lock] leadership acquired (pid={}, role={})",
                self.payload.pid,
                self.payload.role
            );
            return true;
        }
        false
    }

    /// Leader-only. Atomically republishes the heartbeat file.
    pub fn heartbeat(&self) {
        let hb = Heartbeat {
            heartbeat_ms: now_ms(),
            pid: self.payload.pid,
            role: self.payload.role.clone(),
            instance: self.payload.instance.clone(),
        };
        if let Err(e) = storage::atomic_write_json(&self.hb_path, &hb) {
            log::error!("[lock] heartbeat write failed: {}", e);
        }
    }

    /// Does `leader.lock` still name us? A split-brain takeover rewrites the
    /// lock; the displaced leader must demote.
    pub fn still_leader(&self) -> bool {
        if !self.lock_path.exists() {
            return true;
        }
        let info: LeaderInfo = storage::load_json_or(&self.lock_path, LeaderInfo::default());
        info.pid == self.payload.pid
    }

    /// Best-effort cleanup on graceful shutdown.
    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.lock_path);
        let _ = std::fs::remove_file(&self.hb_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_holder_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        let _held = WorkerLock::acquire(&path).unwrap();
        // Same pid, alive by definition.
        let err = WorkerLock::acquire(&path).unwrap_err();
        assert!(err.contains("held by running pid"));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        {
            let _held = WorkerLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(WorkerLock::acquire(&path).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn stale_lock_from_dead_pid_is_reclaimed() {
        // A reaped child's pid is no longer alive.
        let child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        let mut child = child;
        child.wait().unwrap();
        assert!(!pid_alive(dead_pid));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        storage::atomic_write_json(&path, &LockInfo { pid: dead_pid, started_ts: 1 }).unwrap();

        let lock = WorkerLock::acquire(&path).unwrap();
        let info: LockInfo = storage::load_json_or(&path, LockInfo::default());
        assert_eq!(info.pid, std::process::id());
        drop(lock);
    }

    fn leader(dir: &Path, pid: u32, role: &str, ttl: f64) -> LeaderElection {
        LeaderElection::new(
            dir,
            LeaderInfo {
                pid,
                role: role.to_string(),
                instance: "0".to_string(),
                started_ms: now_ms(),
            },
            ttl,
        )
    }

    #[test]
    fn only_one_leader_while_heartbeat_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let a = leader(dir.path(), 1111, "primary", 8.0);
        let b = leader(dir.path(), 2222, "secondary", 8.0);

        assert!(a.try_acquire());
        a.heartbeat();
        assert!(!b.try_acquire());
        assert!(a.still_leader());
        assert!(!b.still_leader() || !dir.path().join("leader.lock").exists());
    }

    #[test]
    fn stale_heartbeat_allows_takeover_and_demotes_old_leader() {
        let dir = tempfile::tempdir().unwrap();
        let a = leader(dir.path(), 1111, "primary", 1.0);
        let b = leader(dir.path(), 2222, "secondary", 1.0);

        assert!(a.try_acquire());
        // Backdate the heartbeat past the TTL.
        storage::atomic_write_json(
            &dir.path().join("leader_heartbeat.json"),
            &Heartbeat { heartbeat_ms: now_ms() - 5_000, pid: 1111, ..Heartbeat::default() },
        )
        .unwrap();

        assert!(b.try_acquire());
        assert!(b.still_leader());
        // The displaced leader notices the lock no longer names it.
        assert!(!a.still_leader());
    }

    #[test]
    fn missing_heartbeat_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let a = leader(dir.path(), 1111, "primary", 8.0);
        assert!(a.try_acquire());
        // No heartbeat ever written: a standby may steal immediately.
        let b = leader(dir.path(), 2222, "secondary", 8.0);
        assert!(b.try_acquire());
        assert!(b.still_leader());
    }

    #[test]
    fn release_clears_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = leader(dir.path(), 1111, "primary", 8.0);
        assert!(a.try_acquire());
        a.heartbeat();
        a.release();
        assert!(!dir.path().join("leader.lock").exists());
        assert!(!dir.path().join("leader_heartbeat.json").exists());
    }
}
