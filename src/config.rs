//! Service configuration, loaded once at startup from
//! `ChatManager/commands.json`.
//!
//! Decoding is permissive (every field defaulted) except for the file itself:
//! a missing or unparseable config makes `Config::load` fail, and the router
//! refuses to start without one. `${VAR}` references inside any string value
//! are expanded from the environment before deserialization; unset variables
//! expand to the empty string.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::models::Tier;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EarningConfig {
    pub active_window_seconds: u64,
    pub points_per_minute_active: i64,
    pub points_per_message: i64,
    pub points_per_like: i64,
    pub points_per_share: i64,
}

impl Default for EarningConfig {
    fn default() -> Self {
        EarningConfig {
            active_window_seconds: 300,
            points_per_minute_active: 1,
            points_per_message: 2,
            points_per_like: 1,
            points_per_share: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub id: String,
    pub enabled: bool,
    pub inbox: String,
    pub outbox: String,
    pub ack: String,
    pub deadletter: String,
    /// `"active_standby"` allows multiple instances with leader election.
    pub ha: String,
    pub instances: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            id: String::new(),
            enabled: true,
            inbox: String::new(),
            outbox: String::new(),
            ack: String::new(),
            deadletter: String::new(),
            ha: String::new(),
            instances: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandDef {
    pub command: String,
    pub aliases: Vec<String>,
    pub bot: String,
    pub action: String,
    pub min_tier: Tier,
    pub cooldown_seconds: u64,
    /// Users at or above this tier skip the cooldown. Empty = no bypass.
    pub cooldown_bypass_tier: String,
    pub cost_points: i64,
    pub help_lines: Vec<String>,
    pub show_in_help: bool,
}

impl Default for CommandDef {
    fn default() -> Self {
        CommandDef {
            command: String::new(),
            aliases: Vec::new(),
            bot: String::new(),
            action: String::new(),
            min_tier: Tier::Everyone,
            cooldown_seconds: 0,
            cooldown_bypass_tier: String::new(),
            cost_points: 0,
            help_lines: Vec::new(),
            show_in_help: false,
        }
    }
}

impl CommandDef {
    pub fn bypass_tier(&self) -> Option<Tier> {
        let raw = self.cooldown_bypass_tier.trim();
        if raw.is_empty() {
            None
        } else {
            Some(Tier::parse(raw))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Prefix for the music bot's replies (other bots have fixed prefixes).
    pub prefix: String,
    pub max_len: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        ReplyConfig { prefix: String::new(), max_len: 240 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SsnConfig {
    pub enabled: bool,
    pub host: String,
    pub session: String,
    /// platform → injector target segment.
    pub platform_map: HashMap<String, String>,
}

impl Default for SsnConfig {
    fn default() -> Self {
        SsnConfig {
            enabled: false,
            host: "io.socialstream.ninja".to_string(),
            session: String::new(),
            platform_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyPolicy {
    pub overlay_only_platform_prefixes: Vec<String>,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        ReplyPolicy { overlay_only_platform_prefixes: vec!["tiktok".to_string()] }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayFallback {
    pub enabled: bool,
    pub chat_file: String,
    pub overlay_events_file: String,
    pub max_messages: usize,
    pub max_events: usize,
    pub user_state_mirror_file: String,
}

impl Default for OverlayFallback {
    fn default() -> Self {
        OverlayFallback {
            enabled: true,
            chat_file: String::new(),
            overlay_events_file: String::new(),
            max_messages: 400,
            max_events: 0,
            user_state_mirror_file: String::new(),
        }
    }
}

impl OverlayFallback {
    pub fn events_max(&self) -> usize {
        if self.max_events > 0 {
            self.max_events
        } else {
            self.max_messages
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HelpConfig {
    pub header_lines: Vec<String>,
    pub chunk_len: usize,
}

impl Default for HelpConfig {
    fn default() -> Self {
        HelpConfig {
            header_lines: vec![
                "Every command starts with \"!\" and must be at the beginning of your message."
                    .to_string(),
                "Commands are case-insensitive.".to_string(),
            ],
            // Platform message-length constraint; tunable, not load-bearing.
            chunk_len: 220,
        }
    }
}

/// Auxiliary process launched by the supervisor but implemented elsewhere:
/// overlay static-file servers and the upstream chat-feed writer. Only the
/// lifecycle is ours; `cmd` is the external argv, with `{port}` substituted.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub port: u16,
    pub cmd: Vec<String>,
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub level: String,
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            dir: String::new(),
            level: "INFO".to_string(),
            max_bytes: 5 * 1024 * 1024,
            backup_count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll_ms: u64,
    pub chat_file: String,
    pub process_existing_on_start: bool,
    pub earning: EarningConfig,
    pub bots: Vec<BotConfig>,
    pub manager_commands: Vec<CommandDef>,
    pub commands: Vec<CommandDef>,
    pub reply: ReplyConfig,
    pub ssn: SsnConfig,
    pub reply_policy: ReplyPolicy,
    pub overlay_fallback: OverlayFallback,
    pub help: HelpConfig,
    pub servers: Vec<ServerConfig>,
    pub writer: ServerConfig,
    pub logging: LoggingConfig,
    pub state: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_ms: 350,
            chat_file: String::new(),
            process_existing_on_start: false,
            earning: EarningConfig::default(),
            bots: Vec::new(),
            manager_commands: Vec::new(),
            commands: Vec::new(),
            reply: ReplyConfig::default(),
            ssn: SsnConfig::default(),
            reply_policy: ReplyPolicy::default(),
            overlay_fallback: OverlayFallback::default(),
            help: HelpConfig::default(),
            servers: Vec::new(),
            writer: ServerConfig::default(),
            logging: LoggingConfig::default(),
            state: HashMap::new(),
        }
    }
}

impl Config {
    /// Load and env-expand the config. Errors when the file is missing or
    /// unparseable; callers that require config refuse to start.
    pub fn load(path: &Path) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("config {} unreadable: {}", path.display(), e))?;
        let mut value: Value = serde_json::from_str(&text)
            .map_err(|e| format!("config {} is not valid JSON: {}", path.display(), e))?;
        expand_env_tree(&mut value);
        serde_json::from_value(value)
            .map_err(|e| format!("config {} has invalid shape: {}", path.display(), e))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_ms.max(50))
    }

    /// Enabled bots with blank fields resolved to bus-dir defaults.
    pub fn enabled_bots(&self) -> Vec<BotConfig> {
        self.bots
            .iter()
            .filter(|b| b.enabled && !b.id.trim().is_empty())
            .map(|b| {
                let mut bot = b.clone();
                bot.id = bot.id.trim().to_ascii_lowercase();
                if bot.inbox.is_empty() {
                    bot.inbox = format!("bus/{}.inbox.jsonl", bot.id);
                }
                if bot.outbox.is_empty() {
                    bot.outbox = format!("bus/{}.outbox.jsonl", bot.id);
                }
                if bot.ack.is_empty() {
                    bot.ack = format!("bus/{}.ack.jsonl", bot.id);
                }
                if bot.deadletter.is_empty() {
                    bot.deadletter = format!("bus/deadletter.{}.jsonl", bot.id);
                }
                bot
            })
            .collect()
    }
}

/// Index commands (and their aliases) by lowercased name.
pub fn index_commands(list: &[CommandDef]) -> HashMap<String, CommandDef> {
    let mut index = HashMap::new();
    for raw in list {
        let name = raw.command.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let mut def = raw.clone();
        def.command = name.clone();
        def.bot = def.bot.trim().to_ascii_lowercase();
        def.action = def.action.trim().to_ascii_lowercase();
        def.aliases = def
            .aliases
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        for alias in &def.aliases {
            index.insert(alias.clone(), def.clone());
        }
        index.insert(name, def);
    }
    index
}

/// Expand `${VAR}` occurrences in a string from the environment.
/// Unset variables expand to "".
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                let valid = !name.is_empty()
                    && name.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if valid {
                    out.push_str(&std::env::var(name).unwrap_or_default());
                    i += 2 + end + 1;
                    continue;
                }
            }
        }
        let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn expand_env_tree(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand_env(s);
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env_tree(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_tree(v);
            }
        }
        _ => {}
    }
}
