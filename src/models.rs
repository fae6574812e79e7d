//! Shared record types for the bus and router state.
//!
//! Records are tagged sum types by their `type` field with permissive
//! decoding: unknown fields are ignored, missing optional fields take
//! defaults. Malformed lines never reach these types; the bus reader drops
//! them (see `bus::read_new_jsonl`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::slots::SlotsConfig;

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Ordered permission class of a chat user. Comparisons use the declared
/// order: EVERYONE < SUB < VIP < MOD < BROADCASTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Tier {
    #[default]
    Everyone,
    Sub,
    Vip,
    Mod,
    Broadcaster,
}

impl Tier {
    /// Case-insensitive; anything unrecognized maps to EVERYONE.
    pub fn parse(s: &str) -> Tier {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUB" => Tier::Sub,
            "VIP" => Tier::Vip,
            "MOD" => Tier::Mod,
            "BROADCASTER" => Tier::Broadcaster,
            _ => Tier::Everyone,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Everyone => "EVERYONE",
            Tier::Sub => "SUB",
            Tier::Vip => "VIP",
            Tier::Mod => "MOD",
            Tier::Broadcaster => "BROADCASTER",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Tier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Tier, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Tier::parse(&s))
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Normalised chat event, produced by the ingestor and consumed by the
/// router. `kind` is one of `chat`, `like`, `share`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: u64,
    pub platform: String,
    pub user_key: String,
    pub reply_name: String,
    pub tier: Tier,
    pub text: String,
    pub event: String,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            kind: "chat".to_string(),
            ts: 0,
            platform: "unknown".to_string(),
            user_key: String::new(),
            reply_name: "User".to_string(),
            tier: Tier::Everyone,
            text: String::new(),
            event: String::new(),
        }
    }
}

/// Router → worker inbox record for standard (non-gamble) bot commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: String,
    pub ts: u64,
    pub bot: String,
    pub action: String,
    pub command: String,
    pub args: String,
    pub platform: String,
    pub reply_name: String,
    pub user_key: String,
    pub user_tier: Tier,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            kind: "task".to_string(),
            task_id: String::new(),
            ts: 0,
            bot: String::new(),
            action: String::new(),
            command: String::new(),
            args: String::new(),
            platform: String::new(),
            reply_name: String::new(),
            user_key: String::new(),
            user_tier: Tier::Everyone,
        }
    }
}

/// Gamble FIFO entry. Serialized both into `gamble_queue.json` and, on
/// dispatch, straight onto the gamble worker's inbox. The slots config
/// snapshot pins payout rules to what the user saw at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GambleTask {
    pub task_id: String,
    pub action: String,
    pub bet: i64,
    pub platform: String,
    pub reply_name: String,
    pub user_key: String,
    pub created_ts: u64,
    pub available_points: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots_cfg: Option<SlotsConfig>,
    pub command: String,
}

impl Default for GambleTask {
    fn default() -> Self {
        GambleTask {
            task_id: String::new(),
            action: "slots".to_string(),
            bet: 0,
            platform: String::new(),
            reply_name: "User".to_string(),
            user_key: String::new(),
            created_ts: 0,
            available_points: 0,
            slots_cfg: None,
            command: "slots".to_string(),
        }
    }
}

/// One overlay event as carried inside a worker reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayPayload {
    pub overlay: String,
    pub event: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Default for OverlayPayload {
    fn default() -> Self {
        OverlayPayload {
            overlay: String::new(),
            event: String::new(),
            payload: empty_object(),
        }
    }
}

/// Worker → router outbox record. `game` stays a raw `Value`: workers report
/// their domain result in slightly different shapes and the router probes it
/// permissively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: String,
    pub ts: u64,
    pub messages: Vec<String>,
    pub overlay_events: Vec<OverlayPayload>,
    pub blocking_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for WorkerReply {
    fn default() -> Self {
        WorkerReply {
            kind: "reply".to_string(),
            task_id: String::new(),
            ts: 0,
            messages: Vec::new(),
            overlay_events: Vec::new(),
            blocking_ms: 0,
            game: None,
            error: None,
        }
    }
}

/// Worker → router ack record, consumed offset-only by the router but used
/// by the supervisor's backlog staleness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerAck {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: String,
    pub ts: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl Default for WorkerAck {
    fn default() -> Self {
        WorkerAck {
            kind: "ack".to_string(),
            task_id: String::new(),
            ts: 0,
            status: "ok".to_string(),
            error: None,
            trace: None,
        }
    }
}

/// Router → emitter: a user-facing chat message to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyIntent {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: u64,
    pub platform: String,
    pub reply_name: String,
    pub text: String,
    pub bot: String,
}

impl Default for ReplyIntent {
    fn default() -> Self {
        ReplyIntent {
            kind: "reply_intent".to_string(),
            ts: 0,
            platform: String::new(),
            reply_name: "User".to_string(),
            text: String::new(),
            bot: String::new(),
        }
    }
}

/// Router → emitter: a payload for an overlay consumer (browser source).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayEventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: u64,
    pub overlay: String,
    pub event: String,
    pub event_id: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Default for OverlayEventRecord {
    fn default() -> Self {
        OverlayEventRecord {
            kind: "overlay_event".to_string(),
            ts: 0,
            overlay: String::new(),
            event: String::new(),
            event_id: String::new(),
            payload: empty_object(),
        }
    }
}

/// Append-only audit record: one line per point-moving event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LedgerEntry {
    pub ts: u64,
    pub platform: String,
    pub user_key: String,
    pub command: String,
    pub bot: String,
    pub delta: i64,
    pub before: i64,
    pub after: i64,
    pub note: String,
}

/// Per-user bank record. Points are clamped at zero by the router's
/// `set_points`; this struct never holds a negative balance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserRecord {
    pub points: i64,
    pub last_seen_ts: u64,
    pub last_award_ts: u64,
    pub cooldowns: HashMap<String, u64>,
}

/// A dispatched task awaiting its worker reply.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InflightEntry {
    pub bot: String,
    pub platform: String,
    pub reply_name: String,
    pub user_key: String,
    pub created_ts: u64,
}

pub fn new_task_id() -> String {
    format!("t_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

pub fn new_gamble_task_id() -> String {
    format!("g_{}", &uuid::Uuid::new_v4().simple().to_string()[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_matches_declaration() {
        assert!(Tier::Everyone < Tier::Sub);
        assert!(Tier::Sub < Tier::Vip);
        assert!(Tier::Vip < Tier::Mod);
        assert!(Tier::Mod < Tier::Broadcaster);
    }

    #[test]
    fn tier_parse_is_permissive() {
        assert_eq!(Tier::parse("broadcaster"), Tier::Broadcaster);
        assert_eq!(Tier::parse(" MOD "), Tier::Mod);
        assert_eq!(Tier::parse("whatever"), Tier::Everyone);
        assert_eq!(Tier::parse(""), Tier::Everyone);
    }

    #[test]
    fn reply_decodes_with_unknown_and_missing_fields() {
        let raw = r#"{"type":"reply","task_id":"t_abc","ts":5,"messages":["hi"],"surprise":true}"#;
        let reply: WorkerReply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.task_id, "t_abc");
        assert_eq!(reply.messages, vec!["hi".to_string()]);
        assert!(reply.overlay_events.is_empty());
        assert_eq!(reply.blocking_ms, 0);
        assert!(reply.game.is_none());
    }

    #[test]
    fn event_tier_field_round_trips_as_string() {
        let mut ev = Event::default();
        ev.tier = Tier::Vip;
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["tier"], "VIP");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.tier, Tier::Vip);
    }

    #[test]
    fn task_ids_have_expected_shape() {
        let t = new_task_id();
        assert!(t.starts_with("t_"));
        assert_eq!(t.len(), 2 + 12);
        let g = new_gamble_task_id();
        assert!(g.starts_with("g_"));
        assert_eq!(g.len(), 2 + 10);
    }
}
