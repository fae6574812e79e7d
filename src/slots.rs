//! Slots payout configuration and outcome evaluation.
//!
//! The router is the bank: the worker spins the reels, but the payout the
//! user receives is resolved here against `config/slots_config.json`. Rules
//! are evaluated in declared order, first match wins, and `*` in a pattern
//! matches any symbol. The config file is auto-created with defaults and
//! hot-reloaded on mtime change.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutRule {
    pub name: String,
    pub pattern: Vec<String>,
    pub mult: i64,
    pub result_code: String,
}

impl Default for PayoutRule {
    fn default() -> Self {
        PayoutRule {
            name: "PAYOUT".to_string(),
            pattern: Vec::new(),
            mult: 0,
            result_code: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    pub reels: Vec<String>,
    pub payouts: Vec<PayoutRule>,
    pub default_loss_mult: i64,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        default_slots_config()
    }
}

fn rule(name: &str, pattern: [&str; 3], mult: i64, result_code: &str) -> PayoutRule {
    PayoutRule {
        name: name.to_string(),
        pattern: pattern.iter().map(|s| s.to_string()).collect(),
        mult,
        result_code: result_code.to_string(),
    }
}

pub fn default_slots_config() -> SlotsConfig {
    SlotsConfig {
        reels: ["🍒", "🍋", "🍇", "🔔", "⭐", "BAR", "7"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        payouts: vec![
            rule("777", ["7", "7", "7"], 25, "SLOTS_777"),
            rule("TRIPLE_BAR", ["BAR", "BAR", "BAR"], 15, "SLOTS_TRIPLE_BAR"),
            rule("TRIPLE_CHERRY", ["🍒", "🍒", "🍒"], 8, "SLOTS_TRIPLE_CHERRY"),
            rule("DOUBLE_7", ["7", "7", "*"], 3, "SLOTS_DOUBLE_7"),
            rule("DOUBLE_CHERRY", ["🍒", "🍒", "*"], 2, "SLOTS_DOUBLE_CHERRY"),
            rule("SINGLE_CHERRY", ["🍒", "*", "*"], 1, "SLOTS_SINGLE_CHERRY"),
        ],
        default_loss_mult: 0,
    }
}

/// Back-compat mapping for workers that report only a result code.
pub static RESULTCODE_MULT: Lazy<HashMap<&'static str, i64>> = Lazy::new(|| {
    HashMap::from([
        ("SLOTS_777", 25),
        ("SLOTS_TRIPLE_BAR", 15),
        ("SLOTS_TRIPLE_CHERRY", 8),
        ("SLOTS_DOUBLE_7", 3),
        ("SLOTS_DOUBLE_CHERRY", 2),
        ("SLOTS_SINGLE_CHERRY", 1),
        ("SLOTS_LOSS", 0),
    ])
});

pub static RESULTCODE_SYMBOLS: Lazy<HashMap<&'static str, [&'static str; 3]>> = Lazy::new(|| {
    HashMap::from([
        ("SLOTS_777", ["7", "7", "7"]),
        ("SLOTS_TRIPLE_BAR", ["BAR", "BAR", "BAR"]),
        ("SLOTS_TRIPLE_CHERRY", ["🍒", "🍒", "🍒"]),
        ("SLOTS_DOUBLE_7", ["7", "7", "*"]),
        ("SLOTS_DOUBLE_CHERRY", ["🍒", "🍒", "*"]),
        ("SLOTS_SINGLE_CHERRY", ["🍒", "*", "*"]),
        ("SLOTS_LOSS", ["?", "?", "?"]),
    ])
});

fn mapped_symbols(result_code: &str) -> Vec<String> {
    RESULTCODE_SYMBOLS
        .get(result_code)
        .map(|s| s.iter().map(|x| x.to_string()).collect())
        .unwrap_or_else(|| vec!["?".to_string(), "?".to_string(), "?".to_string()])
}

fn pattern_matches(pattern: &[String], symbols: &[String]) -> bool {
    if pattern.len() != symbols.len() {
        return false;
    }
    pattern.iter().zip(symbols).all(|(p, s)| {
        matches!(p.as_str(), "*" | "ANY" | "any" | "") || p == s
    })
}

/// Merge a raw config value onto the defaults and normalize types. Bad or
/// missing sections fall back to the defaults wholesale.
pub fn normalize_slots_config(raw: &Value) -> SlotsConfig {
    let defaults = default_slots_config();
    let obj = match raw.as_object() {
        Some(o) => o,
        None => return defaults,
    };

    let reels: Vec<String> = obj
        .get("reels")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .map(|x| match x.as_str() {
                    Some(s) => s.to_string(),
                    None => x.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| defaults.reels.clone());

    let mut payouts: Vec<PayoutRule> = Vec::new();
    if let Some(raw_rules) = obj.get("payouts").and_then(|v| v.as_array()) {
        for r in raw_rules {
            let Some(ro) = r.as_object() else { continue };
            // `symbols` accepted as a legacy alias of `pattern`.
            let pat = ro.get("pattern").or_else(|| ro.get("symbols"));
            let Some(pat) = pat.and_then(|v| v.as_array()) else { continue };
            if pat.len() != 3 {
                continue;
            }
            let pattern: Vec<String> = pat
                .iter()
                .map(|x| match x.as_str() {
                    Some(s) => s.to_string(),
                    None => x.to_string(),
                })
                .collect();
            let mult = ro
                .get("mult")
                .or_else(|| ro.get("multiplier"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let name = ro
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or("PAYOUT")
                .to_string();
            let result_code = ro
                .get("result_code")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            payouts.push(PayoutRule { name, pattern, mult, result_code });
        }
    }
    if payouts.is_empty() {
        payouts = defaults.payouts.clone();
    }

    let default_loss_mult = obj
        .get("default_loss_mult")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    SlotsConfig { reels, payouts, default_loss_mult }
}

/// Load the slots config, writing the default file first if it is missing.
pub fn load_slots_config(path: &Path) -> SlotsConfig {
    if !path.exists() {
        let defaults = default_slots_config();
        if let Err(e) = storage::atomic_write_json(path, &defaults) {
            log::warn!("[slots] could not create default config at {}: {}", path.display(), e);
        }
        return defaults;
    }
    match storage::load_json_value(path) {
        Some(raw) => normalize_slots_config(&raw),
        None => default_slots_config(),
    }
}

/// Outcome of resolving a spin against the payout rules.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotsOutcome {
    pub mult: i64,
    pub rule_name: String,
    pub result_code: String,
    pub symbols: Vec<String>,
}

/// Resolve `(symbols, result_code)` to a multiplier. First matching rule
/// wins; a known result code is used when symbols are missing; otherwise the
/// configured fall-through loss multiplier applies.
pub fn eval_slots(symbols: &[String], result_code: &str, cfg: &SlotsConfig) -> SlotsOutcome {
    let mut syms: Vec<String> = symbols.iter().take(3).cloned().collect();

    if syms.len() != 3 && !result_code.is_empty() {
        return SlotsOutcome {
            mult: RESULTCODE_MULT.get(result_code).copied().unwrap_or(0),
            rule_name: result_code.to_string(),
            result_code: result_code.to_string(),
            symbols: mapped_symbols(result_code),
        };
    }
    while syms.len() < 3 {
        syms.push("?".to_string());
    }

    for r in &cfg.payouts {
        if pattern_matches(&r.pattern, &syms) {
            let rc = if r.result_code.is_empty() {
                result_code.to_string()
            } else {
                r.result_code.clone()
            };
            return SlotsOutcome {
                mult: r.mult,
                rule_name: if r.name.is_empty() { "WIN".to_string() } else { r.name.clone() },
                result_code: rc,
                symbols: syms,
            };
        }
    }

    if let Some(mult) = RESULTCODE_MULT.get(result_code) {
        return SlotsOutcome {
            mult: *mult,
            rule_name: result_code.to_string(),
            result_code: result_code.to_string(),
            symbols: mapped_symbols(result_code),
        };
    }

    SlotsOutcome {
        mult: cfg.default_loss_mult,
        rule_name: "LOSS".to_string(),
        result_code: if result_code.is_empty() { "SLOTS_LOSS".to_string() } else { result_code.to_string() },
        symbols: syms,
    }
}

/// Symbols arrive from workers as arrays or as `"a|b|c"` / `"a,b,c"` /
/// whitespace-separated strings.
pub fn coerce_symbols(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .take(3)
            .map(|x| match x.as_str() {
                Some(s) => s.to_string(),
                None => x.to_string(),
            })
            .collect(),
        Value::String(s) => {
            let s = s.trim();
            let parts: Vec<&str> = if s.contains('|') {
                s.split('|').collect()
            } else if s.contains(',') {
                s.split(',').collect()
            } else {
                s.split_whitespace().collect()
            };
            parts
                .into_iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .take(3)
                .map(|p| p.to_string())
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Mtime-watched slots config for the router's hot reload.
#[derive(Debug)]
pub struct SlotsConfigWatcher {
    path: PathBuf,
    mtime: f64,
    config: SlotsConfig,
}

impl SlotsConfigWatcher {
    pub fn new(path: PathBuf) -> SlotsConfigWatcher {
        let config = load_slots_config(&path);
        let mtime = storage::mtime_secs(&path);
        SlotsConfigWatcher { path, mtime, config }
    }

    pub fn current(&self) -> &SlotsConfig {
        &self.config
    }

    /// Reload when the file's mtime changed since the last look.
    pub fn refresh(&mut self) {
        let m = storage::mtime_secs(&self.path);
        if m != self.mtime {
            self.config = load_slots_config(&self.path);
            self.mtime = m;
            log::info!("[slots] config reloaded from {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn syms(v: [&str; 3]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_matching_rule_wins_in_declared_order() {
        let cfg = default_slots_config();
        // ["7","7","7"] matches both 777 and DOUBLE_7's wildcard; 777 is first.
        let out = eval_slots(&syms(["7", "7", "7"]), "", &cfg);
        assert_eq!(out.mult, 25);
        assert_eq!(out.rule_name, "777");

        let out = eval_slots(&syms(["7", "7", "🍋"]), "", &cfg);
        assert_eq!(out.mult, 3);
        assert_eq!(out.result_code, "SLOTS_DOUBLE_7");
    }

    #[test]
    fn wildcard_matches_any_symbol() {
        let cfg = default_slots_config();
        let out = eval_slots(&syms(["🍒", "⭐", "BAR"]), "", &cfg);
        assert_eq!(out.mult, 1);
        assert_eq!(out.rule_name, "SINGLE_CHERRY");
    }

    #[test]
    fn no_match_falls_through_to_loss() {
        let cfg = default_slots_config();
        let out = eval_slots(&syms(["🍋", "🍇", "⭐"]), "", &cfg);
        assert_eq!(out.mult, 0);
        assert_eq!(out.result_code, "SLOTS_LOSS");
    }

    #[test]
    fn missing_symbols_use_result_code_mapping() {
        let cfg = default_slots_config();
        let out = eval_slots(&[], "SLOTS_TRIPLE_BAR", &cfg);
        assert_eq!(out.mult, 15);
        assert_eq!(out.symbols, syms(["BAR", "BAR", "BAR"]));
    }

    #[test]
    fn normalize_merges_onto_defaults() {
        let raw = json!({
            "payouts": [
                {"name": "LEMONS", "pattern": ["🍋", "🍋", "🍋"], "mult": 4, "result_code": "SLOTS_LEMONS"},
                {"name": "BAD", "pattern": ["only", "two"]},
            ],
            "default_loss_mult": 1
        });
        let cfg = normalize_slots_config(&raw);
        assert_eq!(cfg.payouts.len(), 1);
        assert_eq!(cfg.payouts[0].name, "LEMONS");
        assert_eq!(cfg.default_loss_mult, 1);
        // reels absent: defaults kept
        assert!(!cfg.reels.is_empty());
    }

    #[test]
    fn load_creates_default_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("slots_config.json");
        let cfg = load_slots_config(&path);
        assert!(path.exists());
        assert_eq!(cfg.payouts.len(), 6);
    }

    #[test]
    fn coerce_symbols_accepts_common_shapes() {
        assert_eq!(coerce_symbols(&json!(["7", "7", "7"])), syms(["7", "7", "7"]));
        assert_eq!(coerce_symbols(&json!("7 | BAR | 🍒")), syms(["7", "BAR", "🍒"]));
        assert_eq!(coerce_symbols(&json!("a,b,c")), syms(["a", "b", "c"]));
        assert_eq!(coerce_symbols(&json!(42)), Vec::<String>::new());
    }

    #[test]
    fn watcher_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots_config.json");
        let mut watcher = SlotsConfigWatcher::new(path.clone());
        assert_eq!(watcher.current().default_loss_mult, 0);

        let mut updated = default_slots_config();
        updated.default_loss_mult = 2;
        std::fs::write(&path, serde_json::to_string(&updated).unwrap()).unwrap();
        // Force an mtime difference regardless of filesystem granularity.
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let _ = std::fs::File::options()
            .append(true)
            .open(&path)
            .and_then(|f| f.set_modified(later));

        watcher.refresh();
        assert_eq!(watcher.current().default_loss_mult, 2);
    }
}
