//! Globally-serialized gamble FIFO.
//!
//! One file, one writer (the router). `active` plus `busy_until_ts` gate
//! dispatch so the casino overlay never plays two spins at once, across all
//! platforms and users. Wagers are not debited at enqueue time; they are
//! *reserved*: `reserved_points_for_user` keeps a user from queueing more
//! than they could cover.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::{now_ts, GambleTask};
use crate::storage;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GambleQueueData {
    pub queue: Vec<GambleTask>,
    pub active: Option<GambleTask>,
    pub busy_until_ts: u64,
}

#[derive(Debug)]
pub struct GambleQueue {
    path: PathBuf,
    pub data: GambleQueueData,
}

impl GambleQueue {
    pub fn open(path: PathBuf) -> GambleQueue {
        let data = storage::load_json_or(&path, GambleQueueData::default());
        GambleQueue { path, data }
    }

    pub fn save(&self) {
        if let Err(e) = storage::atomic_write_json(&self.path, &self.data) {
            log::error!("[gamble_queue] save failed: {}", e);
        }
    }

    /// Sum of bets this user has locked up: queued entries plus the active
    /// spin if it is theirs.
    pub fn reserved_points_for_user(&self, user_key: &str) -> i64 {
        let mut total: i64 = self
            .data
            .queue
            .iter()
            .filter(|t| t.user_key == user_key)
            .map(|t| t.bet)
            .sum();
        if let Some(active) = &self.data.active {
            if active.user_key == user_key {
                total += active.bet;
            }
        }
        total
    }

    /// Append and persist; returns the 1-based queue position.
    pub fn enqueue(&mut self, task: GambleTask) -> usize {
        self.data.queue.push(task);
        self.save();
        self.data.queue.len()
    }

    pub fn active_task_id(&self) -> Option<&str> {
        self.data.active.as_ref().map(|t| t.task_id.as_str())
    }

    pub fn can_dispatch(&self, now: u64) -> bool {
        if self.data.active.is_some() {
            return false;
        }
        if now < self.data.busy_until_ts {
            return false;
        }
        !self.data.queue.is_empty()
    }

    /// Pop the head into the active slot and persist. The caller appends the
    /// returned task to the gamble worker's inbox.
    pub fn pop_next_for_dispatch(&mut self) -> Option<GambleTask> {
        if self.data.queue.is_empty() {
            return None;
        }
        let next = self.data.queue.remove(0);
        self.data.active = Some(next.clone());
        self.save();
        Some(next)
    }

    /// Clear the active slot and open the busy window: `blocking_ms` is the
    /// overlay animation length reported by the worker.
    pub fn mark_done(&mut self, blocking_ms: i64) {
        self.data.active = None;
        let now = now_ts();
        self.data.busy_until_ts = if blocking_ms > 0 {
            now + (blocking_ms as u64) / 1000
        } else {
            now
        };
        self.save();
    }
}
