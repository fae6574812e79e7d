//! Emitter: delivers reply intents and overlay events.
//!
//! Reply intents go to the upstream chat injector over HTTP when enabled;
//! platforms without an outbound chat API, and any failed or disabled send,
//! fall back to the overlay chat append-file. Overlay events always land in
//! the overlay events append-file, wrapped as bot-authored records so the
//! ingestor can never loop them back in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus;
use crate::config::Config;
use crate::models::{now_ts, ReplyIntent};
use crate::storage::{self, Layout};

const SEND_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct EmitterOffsets {
    replies_offset_bytes: u64,
    overlay_offset_bytes: u64,
}

/// Bot-specific chat prefix. The music bot's prefix comes from config; the
/// rest are fixed.
pub fn bot_prefix(bot: &str, music_prefix: &str) -> String {
    match bot.to_ascii_lowercase().as_str() {
        "music" if !music_prefix.is_empty() => music_prefix.to_string(),
        "gamble" => "[Slots]".to_string(),
        "manager" => "[Manager]".to_string(),
        "" => String::new(),
        other => {
            let mut cap = other.to_string();
            if let Some(first) = cap.get_mut(..1) {
                first.make_ascii_uppercase();
            }
            format!("[{}Bot]", cap)
        }
    }
}

/// Truncate to `max_len` characters, replacing the last kept character with
/// an ellipsis.
pub fn clamp_msg(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len || max_len == 0 {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_len - 1).collect();
    out.push('…');
    out
}

pub fn is_overlay_only(platform: &str, prefixes: &[String]) -> bool {
    let p = platform.to_ascii_lowercase();
    prefixes
        .iter()
        .any(|pref| !pref.is_empty() && p.starts_with(&pref.to_ascii_lowercase()))
}

/// Never write chat fallback lines into a `.json` feed file: that is the
/// unified feed's shape and a stray append would corrupt it.
fn normalize_overlay_chat_path(p: PathBuf) -> PathBuf {
    let is_json = p
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        p.with_file_name("overlay_additions.jsonl")
    } else {
        p
    }
}

pub struct Emitter {
    poll: Duration,
    music_prefix: String,
    max_len: usize,
    ssn_enabled: bool,
    ssn_host: String,
    ssn_session: String,
    platform_map: std::collections::HashMap<String, String>,
    overlay_only_prefixes: Vec<String>,
    overlay_enabled: bool,
    overlay_chat_file: Option<PathBuf>,
    overlay_events_file: Option<PathBuf>,
    overlay_max: usize,
    overlay_events_max: usize,
    replies_in: PathBuf,
    overlay_in: PathBuf,
    offsets_path: PathBuf,
    offsets: EmitterOffsets,
    http: reqwest::Client,
}

impl Emitter {
    pub fn new(root: &Path) -> Result<Emitter, String> {
        let layout = Layout::new(root);
        let cfg = Config::load(&layout.config_path())?;
        Emitter::with_config(&layout, &cfg)
    }

    pub fn with_config(layout: &Layout, cfg: &Config) -> Result<Emitter, String> {
        let overlay = &cfg.overlay_fallback;
        let overlay_chat_file = non_empty(&overlay.chat_file)
            .map(|raw| normalize_overlay_chat_path(layout.resolve_from_root(raw)));
        let overlay_events_file = non_empty(&overlay.overlay_events_file)
            .map(|raw| normalize_overlay_chat_path(layout.resolve_from_root(raw)));
        for p in [&overlay_chat_file, &overlay_events_file].into_iter().flatten() {
            storage::ensure_file(p).map_err(|e| e.to_string())?;
        }

        let replies_in = layout.replies_outbox();
        let overlay_in = layout.overlay_outbox();
        storage::ensure_file(&replies_in).map_err(|e| e.to_string())?;
        storage::ensure_file(&overlay_in).map_err(|e| e.to_string())?;

        let offsets_path = layout.state_dir.join("offsets.emitter.json");
        let offsets: EmitterOffsets =
            storage::load_json_or(&offsets_path, EmitterOffsets::default());

        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| format!("http client: {}", e))?;

        log::info!("[emitter] replies_in={}", replies_in.display());
        log::info!("[emitter] overlay_in={}", overlay_in.display());
        if let Some(p) = &overlay_chat_file {
            log::info!("[emitter] overlay_chat_file={}", p.display());
        }

        Ok(Emitter {
            poll: cfg.poll_interval(),
            music_prefix: cfg.reply.prefix.trim().to_string(),
            max_len: cfg.reply.max_len,
            ssn_enabled: cfg.ssn.enabled,
            ssn_host: cfg.ssn.host.clone(),
            ssn_session: cfg.ssn.session.trim().to_string(),
            platform_map: cfg.ssn.platform_map.clone(),
            overlay_only_prefixes: cfg.reply_policy.overlay_only_platform_prefixes.clone(),
            overlay_enabled: overlay.enabled,
            overlay_chat_file,
            overlay_events_file,
            overlay_max: overlay.max_messages,
            overlay_events_max: overlay.events_max(),
            replies_in,
            overlay_in,
            offsets_path,
            offsets,
            http,
        })
    }

    /// GET `https://<host>/<session>/sendEncodedChat/<target>/<msg>`.
    /// Success iff 2xx within the timeout.
    async fn ssn_send(&self, platform: &str, text: &str) -> bool {
        if self.ssn_session.is_empty() || self.ssn_session == "PUT_YOUR_SSN_SESSION_HERE" {
            return false;
        }
        let target = self
            .platform_map
            .get(platform)
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .unwrap_or("null");
        let url = format!(
            "https://{}/{}/sendEncodedChat/{}/{}",
            self.ssn_host,
            self.ssn_session,
            urlencoding::encode(target),
            urlencoding::encode(text)
        );
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("[emitter] injector send failed: {}", e);
                false
            }
        }
    }

    fn append_overlay_chat(&self, platform: &str, msg: &str) {
        let Some(path) = &self.overlay_chat_file else { return };
        if !self.overlay_enabled {
            return;
        }
        let record = serde_json::json!({
            "type": "chat",
            "ts": now_ts(),
            "platform": platform,
            "message": msg,
            "user": {"isBot": true, "name": "ChatManager", "key": "bot:chatmanager"},
            "source": "chatmanager",
        });
        if let Err(e) = bus::append_jsonl(path, &record) {
            log::error!("[emitter] overlay chat append failed: {}", e);
        }
        bus::trim_jsonl(path, self.overlay_max);
    }

    fn forward_overlay_events(&mut self, records: &[Value]) {
        let Some(path) = self.overlay_events_file.clone() else { return };
        if !self.overlay_enabled || records.is_empty() {
            return;
        }
        for ev in records {
            if !ev.is_object() {
                continue;
            }
            let record = serde_json::json!({
                "type": "overlay_event",
                "ts": ev.get("ts").and_then(|v| v.as_u64()).unwrap_or_else(now_ts),
                "overlay": ev.get("overlay").and_then(|v| v.as_str()).unwrap_or(""),
                "event": ev.get("event").and_then(|v| v.as_str()).unwrap_or(""),
                "event_id": ev.get("event_id").and_then(|v| v.as_str()).unwrap_or(""),
                "payload": ev.get("payload").cloned().unwrap_or_else(|| serde_json::json!({})),
                "user": {"isBot": true, "name": "SYSTEM", "key": "bot:system"},
            });
            if let Err(e) = bus::append_jsonl(&path, &record) {
                log::error!("[emitter] overlay event append failed: {}", e);
            }
        }
        bus::trim_jsonl(&path, self.overlay_events_max);
    }

    /// Format the outgoing chat line: `{prefix} @{reply_name} {text}`,
    /// clamped to the configured length.
    fn format_msg(&self, intent: &ReplyIntent) -> String {
        let prefix = bot_prefix(&intent.bot, &self.music_prefix);
        let base = format!("@{} {}", intent.reply_name, intent.text);
        let msg = if prefix.is_empty() { base } else { format!("{} {}", prefix, base) };
        clamp_msg(msg.trim(), self.max_len)
    }

    async fn deliver_reply(&self, intent: &ReplyIntent) {
        let platform = intent.platform.to_ascii_lowercase();
        let msg = self.format_msg(intent);

        if is_overlay_only(&platform, &self.overlay_only_prefixes) {
            self.append_overlay_chat(&platform, &msg);
            return;
        }

        let sent = if self.ssn_enabled { self.ssn_send(&platform, &msg).await } else { false };
        if !sent {
            self.append_overlay_chat(&platform, &msg);
        }
    }

    /// One poll over both outboxes: overlay events first, then replies.
    pub async fn poll_once(&mut self) -> Result<(), String> {
        let (events, ooff) = bus::read_new_jsonl(&self.overlay_in, self.offsets.overlay_offset_bytes);
        if ooff != self.offsets.overlay_offset_bytes {
            self.offsets.overlay_offset_bytes = ooff;
            storage::atomic_write_json(&self.offsets_path, &self.offsets)?;
        }
        self.forward_overlay_events(&events);

        let (intents, roff) = bus::read_new_jsonl(&self.replies_in, self.offsets.replies_offset_bytes);
        if roff != self.offsets.replies_offset_bytes {
            self.offsets.replies_offset_bytes = roff;
            storage::atomic_write_json(&self.offsets_path, &self.offsets)?;
        }
        for raw in intents {
            if raw.get("type").and_then(|v| v.as_str()) != Some("reply_intent") {
                continue;
            }
            let Ok(intent) = serde_json::from_value::<ReplyIntent>(raw) else { continue };
            self.deliver_reply(&intent).await;
        }
        Ok(())
    }

    pub async fn run(&mut self) {
        log::info!("[emitter] started");
        loop {
            if let Err(e) = self.poll_once().await {
                log::error!("[emitter] loop error: {}", e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(root: &Path) -> (Layout, Config) {
        let layout = Layout::new(root);
        let cfg = json!({
            "poll_ms": 50,
            "chat_file": "feed.json",
            "reply": {"prefix": "[DJ]", "max_len": 60},
            "ssn": {"enabled": false},
            "reply_policy": {"overlay_only_platform_prefixes": ["tiktok"]},
            "overlay_fallback": {
                "enabled": true,
                "chat_file": "Overlays/overlay_additions.jsonl",
                "overlay_events_file": "Overlays/overlay_events.jsonl",
                "max_messages": 100,
                "max_events": 50
            }
        });
        let config_path = layout.config_path();
        storage::atomic_write_json(&config_path, &cfg).unwrap();
        let config = Config::load(&config_path).unwrap();
        (layout, config)
    }

    fn intent(platform: &str, bot: &str, text: &str) -> ReplyIntent {
        ReplyIntent {
            ts: 1,
            platform: platform.to_string(),
            reply_name: "Alice".to_string(),
            text: text.to_string(),
            bot: bot.to_string(),
            ..ReplyIntent::default()
        }
    }

    #[test]
    fn prefixes_per_bot() {
        assert_eq!(bot_prefix("gamble", ""), "[Slots]");
        assert_eq!(bot_prefix("manager", ""), "[Manager]");
        assert_eq!(bot_prefix("music", "[DJ]"), "[DJ]");
        assert_eq!(bot_prefix("music", ""), "[MusicBot]");
        assert_eq!(bot_prefix("trivia", ""), "[TriviaBot]");
        assert_eq!(bot_prefix("", ""), "");
    }

    #[test]
    fn clamp_replaces_last_char_with_ellipsis() {
        assert_eq!(clamp_msg("short", 10), "short");
        let clamped = clamp_msg("abcdefghij", 5);
        assert_eq!(clamped.chars().count(), 5);
        assert!(clamped.ends_with('…'));
        assert!(clamped.starts_with("abcd"));
        // Multi-byte safety.
        let emoji = clamp_msg("🎰🎰🎰🎰🎰", 3);
        assert_eq!(emoji.chars().count(), 3);
    }

    #[test]
    fn overlay_only_prefix_matching() {
        let prefixes = vec!["tiktok".to_string()];
        assert!(is_overlay_only("tiktok", &prefixes));
        assert!(is_overlay_only("TikTok-Live", &prefixes));
        assert!(!is_overlay_only("twitch", &prefixes));
        assert!(!is_overlay_only("twitch", &[]));
    }

    #[test]
    fn json_feed_paths_are_redirected() {
        let p = normalize_overlay_chat_path(PathBuf::from("/x/feed.json"));
        assert_eq!(p, PathBuf::from("/x/overlay_additions.jsonl"));
        let ok = normalize_overlay_chat_path(PathBuf::from("/x/additions.jsonl"));
        assert_eq!(ok, PathBuf::from("/x/additions.jsonl"));
    }

    #[tokio::test]
    async fn replies_fall_back_to_overlay_chat_file() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, cfg) = test_config(dir.path());
        let mut emitter = Emitter::with_config(&layout, &cfg).unwrap();

        bus::append_jsonl(&layout.replies_outbox(), &intent("twitch", "gamble", "you win"))
            .unwrap();
        emitter.poll_once().await.unwrap();

        let chat_file = dir.path().join("Overlays/overlay_additions.jsonl");
        let (records, _) = bus::read_new_jsonl(&chat_file, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "[Slots] @Alice you win");
        assert_eq!(records[0]["user"]["isBot"], true);
        assert_eq!(records[0]["source"], "chatmanager");
    }

    #[tokio::test]
    async fn overlay_only_platform_skips_network_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut cfg) = test_config(dir.path());
        // Even with sending enabled, tiktok goes straight to the overlay.
        cfg.ssn.enabled = true;
        cfg.ssn.session = "sess".to_string();
        let mut emitter = Emitter::with_config(&layout, &cfg).unwrap();

        bus::append_jsonl(&layout.replies_outbox(), &intent("tiktok", "manager", "hi"))
            .unwrap();
        emitter.poll_once().await.unwrap();

        let chat_file = dir.path().join("Overlays/overlay_additions.jsonl");
        let (records, _) = bus::read_new_jsonl(&chat_file, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "[Manager] @Alice hi");
    }

    #[tokio::test]
    async fn overlay_events_are_wrapped_as_bot_records() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, cfg) = test_config(dir.path());
        let mut emitter = Emitter::with_config(&layout, &cfg).unwrap();

        bus::append_jsonl(
            &layout.overlay_outbox(),
            &json!({"type": "overlay_event", "ts": 9, "overlay": "casino",
                    "event": "slots_spin", "event_id": "evt_g_1", "payload": {"bet": 5}}),
        )
        .unwrap();
        emitter.poll_once().await.unwrap();

        let events_file = dir.path().join("Overlays/overlay_events.jsonl");
        let (records, _) = bus::read_new_jsonl(&events_file, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["event_id"], "evt_g_1");
        assert_eq!(records[0]["user"]["name"], "SYSTEM");
        assert_eq!(records[0]["payload"]["bet"], 5);
    }

    #[tokio::test]
    async fn offsets_persist_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, cfg) = test_config(dir.path());
        let mut emitter = Emitter::with_config(&layout, &cfg).unwrap();

        bus::append_jsonl(&layout.replies_outbox(), &intent("twitch", "manager", "once"))
            .unwrap();
        emitter.poll_once().await.unwrap();

        // A fresh emitter resumes after the consumed record.
        let mut emitter2 = Emitter::with_config(&layout, &cfg).unwrap();
        emitter2.poll_once().await.unwrap();
        let chat_file = dir.path().join("Overlays/overlay_additions.jsonl");
        let (records, _) = bus::read_new_jsonl(&chat_file, 0);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn long_replies_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, cfg) = test_config(dir.path());
        let mut emitter = Emitter::with_config(&layout, &cfg).unwrap();

        let long = "x".repeat(200);
        bus::append_jsonl(&layout.replies_outbox(), &intent("twitch", "manager", &long))
            .unwrap();
        emitter.poll_once().await.unwrap();

        let chat_file = dir.path().join("Overlays/overlay_additions.jsonl");
        let (records, _) = bus::read_new_jsonl(&chat_file, 0);
        let msg = records[0]["message"].as_str().unwrap();
        assert_eq!(msg.chars().count(), 60);
        assert!(msg.ends_with('…'));
    }
}
