//! Ingestor: tails the upstream chat file and emits normalised events.
//!
//! The upstream file comes in two shapes, auto-detected each poll:
//!
//! 1. a unified JSON feed `{ updatedTs, messages: [...] }`, rewritten in
//!    place by the chat-feed writer, consumed with a watermark cursor
//!    (last ts + a sliding window of message fingerprints);
//! 2. a plain JSONL append file, consumed with a byte-offset cursor.
//!
//! Bot-authored records are dropped so the pipeline never reacts to its own
//! output.

use serde_json::Value;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bus;
use crate::config::Config;
use crate::models::{now_ts, Event, Tier};
use crate::storage::{self, Layout};

/// Fingerprints longer than this are truncated. Deliberate memory bound; can
/// over-collide on very long duplicate-prefix messages.
const FINGERPRINT_MAX_CHARS: usize = 800;
/// Sliding window sizing for the unified-feed cursor.
const RECENT_FPS_KEEP: usize = 500;
const RECENT_FPS_APPEND: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IngestorOffsets {
    /// JSONL-mode cursor. `None` until seeded on first startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_feed_offset_bytes: Option<u64>,
    /// Unified-feed watermark. `None` until seeded on first startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_last_ts: Option<u64>,
    pub feed_recent_fps: Vec<String>,
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

fn scalar_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Tier from upstream boolean flags, most privileged first. Accepts the
/// aliases different platforms use for the same role.
pub fn detect_user_tier(user: &Value) -> Tier {
    let flag = |k: &str| truthy(user.get(k));
    if flag("isBroadcaster") || flag("isStreamer") || flag("isOwner") {
        Tier::Broadcaster
    } else if flag("isMod") || flag("isModerator") {
        Tier::Mod
    } else if flag("isVip") || flag("isVIP") {
        Tier::Vip
    } else if flag("isSub") || flag("isSubscriber") || flag("subscriber") {
        Tier::Sub
    } else {
        Tier::Everyone
    }
}

/// First usable display name, preferring human-readable fields over ids.
pub fn choose_reply_name(user: &Value) -> String {
    for k in ["name", "displayName", "username", "handle", "uniqueId", "nickname"] {
        if let Some(s) = user.get(k).and_then(|v| v.as_str()) {
            let s = s.trim();
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    for k in ["id", "userId", "uid"] {
        if let Some(s) = user.get(k).and_then(scalar_str) {
            let s = s.trim().to_string();
            if !s.is_empty() {
                return s;
            }
        }
    }
    if let Some(key) = user.get("key").and_then(|v| v.as_str()) {
        let key = key.trim();
        if !key.is_empty() {
            if let Some((_, tail)) = key.split_once(':') {
                if !tail.is_empty() {
                    return tail.to_string();
                }
            }
            return key.to_string();
        }
    }
    "User".to_string()
}

/// Platform-scoped stable user key. Keys that already carry the current
/// platform prefix are kept as-is so upstream-namespaced feeds don't get
/// double-prefixed; any other key is scoped under the current platform.
pub fn stable_user_key(platform: &str, user: &Value) -> String {
    let platform = {
        let p = platform.trim().to_ascii_lowercase();
        if p.is_empty() { "unknown".to_string() } else { p }
    };
    if let Some(raw) = user.get("key").and_then(|v| v.as_str()) {
        let raw = raw.trim();
        if !raw.is_empty() {
            if raw.to_ascii_lowercase().starts_with(&format!("{}:", platform)) {
                return raw.to_string();
            }
            return format!("{}:{}", platform, raw);
        }
    }
    for k in ["id", "userId", "uid", "uniqueId"] {
        if let Some(s) = user.get(k).and_then(scalar_str) {
            let s = s.trim().to_string();
            if !s.is_empty() {
                return format!("{}:{}", platform, s);
            }
        }
    }
    for k in ["name", "displayName", "username", "handle"] {
        if let Some(s) = user.get(k).and_then(|v| v.as_str()) {
            let s = s.trim();
            if !s.is_empty() {
                return format!("{}:{}", platform, s);
            }
        }
    }
    format!("{}:unknown", platform)
}

fn msg_platform(m: &Value) -> String {
    m.get("platform")
        .or_else(|| m.get("source"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .trim()
        .to_ascii_lowercase()
}

fn msg_user(m: &Value) -> Value {
    match m.get("user") {
        Some(u @ Value::Object(_)) => u.clone(),
        _ => Value::Object(serde_json::Map::new()),
    }
}

fn msg_text(m: &Value) -> String {
    m.get("message")
        .or_else(|| m.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn msg_ts(m: &Value) -> u64 {
    m.get("ts").and_then(|v| v.as_u64()).unwrap_or(0)
}

/// `"<platform>|<user_key>|<ts>|<text>"`, char-truncated to the fingerprint
/// bound.
pub fn fingerprint_msg(m: &Value) -> String {
    let platform = msg_platform(m);
    let user = msg_user(m);
    let fp = format!(
        "{}|{}|{}|{}",
        platform,
        stable_user_key(&platform, &user),
        msg_ts(m),
        msg_text(m)
    );
    if fp.chars().count() > FINGERPRINT_MAX_CHARS {
        fp.chars().take(FINGERPRINT_MAX_CHARS).collect()
    } else {
        fp
    }
}

/// Parse the whole file as a unified feed. `None` when it isn't one.
fn read_unified_feed(chat_file: &Path) -> Option<Vec<Value>> {
    let text = std::fs::read_to_string(chat_file).ok()?;
    let obj: Value = serde_json::from_str(&text).ok()?;
    match obj.get("messages") {
        Some(Value::Array(messages)) => Some(messages.clone()),
        _ => None,
    }
}

/// Read new upstream records, advancing whichever cursor matches the
/// detected format. A message from the unified feed passes when its ts is
/// past the watermark, or equal to it with an unseen fingerprint.
pub fn read_new_records(chat_file: &Path, offsets: &mut IngestorOffsets) -> Vec<Value> {
    if let Some(messages) = read_unified_feed(chat_file) {
        let mut last_ts = offsets.feed_last_ts.unwrap_or(0);
        let mut recent: Vec<String> = offsets
            .feed_recent_fps
            .iter()
            .rev()
            .take(RECENT_FPS_KEEP)
            .rev()
            .cloned()
            .collect();
        let recent_set: std::collections::HashSet<&String> = recent.iter().collect();

        let mut out: Vec<Value> = Vec::new();
        for m in &messages {
            if !m.is_object() {
                continue;
            }
            let ts = msg_ts(m);
            if ts == 0 {
                continue;
            }
            let fp = fingerprint_msg(m);
            if ts > last_ts || (ts == last_ts && !recent_set.contains(&fp)) {
                out.push(m.clone());
            }
        }
        drop(recent_set);

        out.sort_by_key(msg_ts);
        if !out.is_empty() {
            last_ts = last_ts.max(out.iter().map(msg_ts).max().unwrap_or(0));
            let skip = out.len().saturating_sub(RECENT_FPS_APPEND);
            for m in &out[skip..] {
                recent.push(fingerprint_msg(m));
            }
            if recent.len() > RECENT_FPS_KEEP {
                recent.drain(..recent.len() - RECENT_FPS_KEEP);
            }
        }

        offsets.feed_last_ts = Some(last_ts);
        offsets.feed_recent_fps = recent;
        return out;
    }

    // JSONL fallback.
    let off = offsets.chat_feed_offset_bytes.unwrap_or(0);
    let (records, new_off) = bus::read_new_jsonl(chat_file, off);
    offsets.chat_feed_offset_bytes = Some(new_off);
    records
}

/// Normalise one upstream record into an [`Event`]. `None` drops it: bot
/// authors, unsupported event types.
pub fn normalize_record(r: &Value, now: u64) -> Option<Event> {
    let user = msg_user(r);
    if truthy(user.get("isBot")) {
        return None;
    }

    let platform = msg_platform(r);
    let rtype = r
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("chat")
        .trim()
        .to_ascii_lowercase();
    let kind = if rtype.is_empty() { "chat".to_string() } else { rtype };
    if kind != "chat" && kind != "like" && kind != "share" {
        return None;
    }

    let ts = match msg_ts(r) {
        0 => now,
        t => t,
    };

    Some(Event {
        kind,
        ts,
        platform: platform.clone(),
        user_key: stable_user_key(&platform, &user),
        reply_name: choose_reply_name(&user),
        tier: detect_user_tier(&user),
        text: msg_text(r),
        event: r
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_ascii_lowercase(),
    })
}

pub struct Ingestor {
    chat_file: PathBuf,
    events_out: PathBuf,
    offsets_path: PathBuf,
    offsets: IngestorOffsets,
    poll: std::time::Duration,
}

impl Ingestor {
    pub fn new(root: &Path) -> Result<Ingestor, String> {
        let layout = Layout::new(root);
        let cfg = Config::load(&layout.config_path())?;
        Ingestor::with_config(&layout, &cfg)
    }

    pub fn with_config(layout: &Layout, cfg: &Config) -> Result<Ingestor, String> {
        let raw = cfg.chat_file.trim();
        if raw.is_empty() {
            return Err("config missing chat_file (or env var not set)".to_string());
        }
        let chat_file = layout.resolve_from_root(raw);
        let events_out = layout.events_inbox();
        storage::ensure_file(&events_out).map_err(|e| e.to_string())?;
        storage::ensure_file(&chat_file).map_err(|e| e.to_string())?;

        let offsets_path = layout.state_dir.join("offsets.ingestor.json");
        let mut offsets: IngestorOffsets =
            storage::load_json_or(&offsets_path, IngestorOffsets::default());
        seed_offsets(&mut offsets, &chat_file, cfg.process_existing_on_start);
        storage::atomic_write_json(&offsets_path, &offsets)?;

        log::info!("[ingestor] chat_file={}", chat_file.display());
        log::info!("[ingestor] events_out={}", events_out.display());

        Ok(Ingestor {
            chat_file,
            events_out,
            offsets_path,
            offsets,
            poll: cfg.poll_interval(),
        })
    }

    /// One poll: read, persist the advanced cursor, emit normalised events.
    pub fn poll_once(&mut self) -> Result<usize, String> {
        let records = read_new_records(&self.chat_file, &mut self.offsets);
        if !records.is_empty() {
            storage::atomic_write_json(&self.offsets_path, &self.offsets)?;
        }

        let now = now_ts();
        let mut emitted = 0usize;
        for r in &records {
            if let Some(event) = normalize_record(r, now) {
                bus::append_jsonl(&self.events_out, &event)?;
                emitted += 1;
            }
        }
        if emitted > 0 {
            log::debug!("[ingestor] emitted {} event(s)", emitted);
        }
        Ok(emitted)
    }

    pub async fn run(&mut self) {
        log::info!("[ingestor] started");
        loop {
            if let Err(e) = self.poll_once() {
                log::error!("[ingestor] loop error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

/// First-run cursor seeding. Unless configured to replay the backlog, both
/// cursors start at "now": byte offset at EOF, watermark at the newest ts
/// already in the feed.
fn seed_offsets(offsets: &mut IngestorOffsets, chat_file: &Path, process_existing: bool) {
    if offsets.chat_feed_offset_bytes.is_none() {
        offsets.chat_feed_offset_bytes = Some(if process_existing {
            0
        } else {
            storage::file_size(chat_file)
        });
    }
    if offsets.feed_last_ts.is_none() {
        let seed = if process_existing {
            0
        } else {
            read_unified_feed(chat_file)
                .map(|msgs| msgs.iter().map(msg_ts).max().unwrap_or(0))
                .unwrap_or(0)
        };
        offsets.feed_last_ts = Some(seed);
        offsets.feed_recent_fps = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_key_prefixing_is_idempotent() {
        let user = json!({"key": "twitch:alice"});
        let k1 = stable_user_key("twitch", &user);
        assert_eq!(k1, "twitch:alice");
        let again = json!({ "key": k1 });
        assert_eq!(stable_user_key("twitch", &again), "twitch:alice");

        // A key scoped to another platform still gets the current prefix.
        let foreign = json!({"key": "tiktok:abc"});
        assert_eq!(stable_user_key("twitch", &foreign), "twitch:tiktok:abc");

        // No key: fall back to ids, then names.
        assert_eq!(stable_user_key("twitch", &json!({"id": 42})), "twitch:42");
        assert_eq!(
            stable_user_key("Twitch", &json!({"username": "bob"})),
            "twitch:bob"
        );
        assert_eq!(stable_user_key("", &json!({})), "unknown:unknown");
    }

    #[test]
    fn tier_detection_prefers_highest_flag() {
        assert_eq!(detect_user_tier(&json!({"isMod": true, "isSub": true})), Tier::Mod);
        assert_eq!(detect_user_tier(&json!({"isStreamer": true})), Tier::Broadcaster);
        assert_eq!(detect_user_tier(&json!({"subscriber": 1})), Tier::Sub);
        assert_eq!(detect_user_tier(&json!({"isVIP": true})), Tier::Vip);
        assert_eq!(detect_user_tier(&json!({})), Tier::Everyone);
    }

    #[test]
    fn reply_name_prefers_readable_fields() {
        assert_eq!(choose_reply_name(&json!({"displayName": "Alice", "id": 7})), "Alice");
        assert_eq!(choose_reply_name(&json!({"id": 7})), "7");
        assert_eq!(choose_reply_name(&json!({"key": "twitch:alice"})), "alice");
        assert_eq!(choose_reply_name(&json!({})), "User");
    }

    #[test]
    fn bot_records_and_unknown_types_are_dropped() {
        assert!(normalize_record(&json!({"user": {"isBot": true}, "message": "!x"}), 1).is_none());
        assert!(normalize_record(&json!({"type": "raid", "user": {}}), 1).is_none());
        let ev = normalize_record(
            &json!({"type": "chat", "platform": "Twitch", "ts": 9,
                    "user": {"name": "A"}, "message": "!points"}),
            1,
        )
        .unwrap();
        assert_eq!(ev.platform, "twitch");
        assert_eq!(ev.ts, 9);
        assert_eq!(ev.text, "!points");
    }

    fn feed(messages: Vec<Value>) -> Value {
        json!({"updatedTs": 0, "messages": messages})
    }

    fn msg(ts: u64, name: &str, text: &str) -> Value {
        json!({"platform": "twitch", "ts": ts, "user": {"name": name}, "message": text})
    }

    #[test]
    fn unified_feed_emits_each_message_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        let messages = vec![msg(10, "a", "hi"), msg(11, "b", "yo")];
        std::fs::write(&path, feed(messages.clone()).to_string()).unwrap();

        let mut offsets = IngestorOffsets {
            feed_last_ts: Some(0),
            chat_feed_offset_bytes: Some(0),
            feed_recent_fps: Vec::new(),
        };
        let first = read_new_records(&path, &mut offsets);
        assert_eq!(first.len(), 2);
        assert_eq!(offsets.feed_last_ts, Some(11));

        // Second pass over the identical feed: nothing new.
        let second = read_new_records(&path, &mut offsets);
        assert!(second.is_empty());

        // Same ts, different fingerprint: passes the watermark tie-break.
        let mut extended = messages;
        extended.push(msg(11, "c", "late"));
        std::fs::write(&path, feed(extended).to_string()).unwrap();
        let third = read_new_records(&path, &mut offsets);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0]["user"]["name"], "c");
    }

    #[test]
    fn unified_feed_batch_is_sorted_by_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            feed(vec![msg(30, "a", "x"), msg(10, "b", "y"), msg(20, "c", "z")]).to_string(),
        )
        .unwrap();
        let mut offsets = IngestorOffsets {
            feed_last_ts: Some(0),
            chat_feed_offset_bytes: Some(0),
            feed_recent_fps: Vec::new(),
        };
        let out = read_new_records(&path, &mut offsets);
        let ts: Vec<u64> = out.iter().map(msg_ts).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }

    #[test]
    fn jsonl_fallback_uses_byte_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        bus::append_jsonl(&path, &msg(1, "a", "one")).unwrap();

        let mut offsets = IngestorOffsets {
            chat_feed_offset_bytes: Some(0),
            feed_last_ts: Some(0),
            feed_recent_fps: Vec::new(),
        };
        assert_eq!(read_new_records(&path, &mut offsets).len(), 1);
        let after_first = offsets.chat_feed_offset_bytes;

        bus::append_jsonl(&path, &msg(2, "b", "two")).unwrap();
        let out = read_new_records(&path, &mut offsets);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["ts"], 2);
        assert!(offsets.chat_feed_offset_bytes > after_first);
    }

    #[test]
    fn seeding_skips_backlog_unless_replaying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, feed(vec![msg(42, "a", "old")]).to_string()).unwrap();

        let mut offsets = IngestorOffsets::default();
        seed_offsets(&mut offsets, &path, false);
        assert_eq!(offsets.feed_last_ts, Some(42));
        assert_eq!(offsets.chat_feed_offset_bytes, Some(storage::file_size(&path)));

        let mut replay = IngestorOffsets::default();
        seed_offsets(&mut replay, &path, true);
        assert_eq!(replay.feed_last_ts, Some(0));
        assert_eq!(replay.chat_feed_offset_bytes, Some(0));
    }

    #[test]
    fn fingerprint_truncates_long_messages() {
        let long_text: String = "x".repeat(2000);
        let m = json!({"platform": "twitch", "ts": 5, "user": {"name": "a"}, "message": long_text});
        let fp = fingerprint_msg(&m);
        assert_eq!(fp.chars().count(), FINGERPRINT_MAX_CHARS);
    }
}
