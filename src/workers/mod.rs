//! Bot worker processes.
//!
//! A worker owns exactly one inbox/outbox/ack triple on the bus. It reads
//! tasks past its byte-offset cursor, computes the domain result, and appends
//! exactly one `reply` and one `ack` per task, also on error, so no task is
//! ever silently dropped.

pub mod gamble;
pub mod lock;
pub mod music;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::bus;
use crate::models::{WorkerAck, WorkerReply};
use crate::storage::{self, Layout};

/// Idle poll cadence; dropped to [`PROGRESS_POLL`] right after work arrived.
pub const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(80);
pub const PROGRESS_POLL: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct WorkerOffsets {
    /// `None` until seeded; absent on first start means "skip the backlog".
    #[serde(skip_serializing_if = "Option::is_none")]
    inbox_offset_bytes: Option<u64>,
}

/// A worker's view of the bus plus its cursor.
pub struct WorkerBus {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub ack: PathBuf,
    offsets_path: PathBuf,
    inbox_offset: u64,
}

impl WorkerBus {
    /// Paths from `BUS_INBOX`/`BUS_OUTBOX`/`BUS_ACK` env (relative to the
    /// worker's cwd) with bus-dir defaults; cursor state under the worker's
    /// own state dir.
    pub fn open(layout: &Layout, bot_id: &str) -> Result<WorkerBus, String> {
        let env_path = |name: &str, default: PathBuf| -> PathBuf {
            match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
                _ => default,
            }
        };
        let inbox = env_path("BUS_INBOX", layout.bus_dir.join(format!("{}.inbox.jsonl", bot_id)));
        let outbox = env_path("BUS_OUTBOX", layout.bus_dir.join(format!("{}.outbox.jsonl", bot_id)));
        let ack = env_path("BUS_ACK", layout.bus_dir.join(format!("{}.ack.jsonl", bot_id)));
        let state_dir = layout.worker_state_dir(bot_id);
        WorkerBus::open_with(inbox, outbox, ack, state_dir)
    }

    pub fn open_with(
        inbox: PathBuf,
        outbox: PathBuf,
        ack: PathBuf,
        state_dir: PathBuf,
    ) -> Result<WorkerBus, String> {
        storage::ensure_dir(&state_dir).map_err(|e| e.to_string())?;
        let offsets_path = state_dir.join("offsets.json");
        let mut offsets: WorkerOffsets =
            storage::load_json_or(&offsets_path, WorkerOffsets::default());

        // First start: seed to the current end so history is not replayed.
        let inbox_offset = match offsets.inbox_offset_bytes {
            Some(off) => off,
            None => {
                let size = storage::file_size(&inbox);
                offsets.inbox_offset_bytes = Some(size);
                storage::atomic_write_json(&offsets_path, &offsets)?;
                size
            }
        };

        Ok(WorkerBus { inbox, outbox, ack, offsets_path, inbox_offset })
    }

    /// Read new inbox records and persist the advanced cursor.
    pub fn drain(&mut self) -> Result<Vec<Value>, String> {
        let (records, new_off) = bus::read_new_jsonl(&self.inbox, self.inbox_offset);
        if new_off != self.inbox_offset {
            self.inbox_offset = new_off;
            storage::atomic_write_json(
                &self.offsets_path,
                &WorkerOffsets { inbox_offset_bytes: Some(new_off) },
            )?;
        }
        Ok(records)
    }

    pub fn send_reply(&self, reply: &WorkerReply) {
        if let Err(e) = bus::append_jsonl(&self.outbox, reply) {
            log::error!("[worker] reply append failed: {}", e);
        }
    }

    pub fn send_ack(&self, ack: &WorkerAck) {
        if let Err(e) = bus::append_jsonl(&self.ack, ack) {
            log::error!("[worker] ack append failed: {}", e);
        }
    }
}

/// Env override helper for worker tunables (`WORKER_POLL_SEC` etc).
pub fn env_secs(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(default)
}

/// Pick the loop sleep: fast while tasks are flowing, slower when idle.
pub fn poll_sleep(progressed: bool, idle: std::time::Duration) -> std::time::Duration {
    if progressed { PROGRESS_POLL } else { idle }
}
