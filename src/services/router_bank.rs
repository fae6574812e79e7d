//! Router/Bank: the single writer of the points ledger.
//!
//! One cooperative loop, every tick in order: earning tick → poll events →
//! poll worker outboxes (acks offset-only) → gamble dispatch → flush dirty
//! state. All mutation of user points happens here; workers only ever
//! propose outcomes, the router validates and applies them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::bus;
use crate::config::{index_commands, CommandDef, Config};
use crate::gamble_queue::GambleQueue;
use crate::models::{
    new_gamble_task_id, new_task_id, now_ms, now_ts, Event, GambleTask, InflightEntry,
    LedgerEntry, OverlayEventRecord, ReplyIntent, Task, Tier, WorkerReply,
};
use crate::slots::{self, SlotsConfigWatcher};
use crate::storage::{self, Layout};

/// Sliding dedup windows. The exact window (key includes the event ts)
/// absorbs upstream republishes; the loose window (key ignores ts) absorbs
/// near-simultaneous doubles.
const DEDUP_EXACT_WINDOW_SEC: f64 = 15.0;
const DEDUP_LOOSE_WINDOW_SEC: f64 = 2.0;
/// Cadence of the periodic active-session earning scan.
const EARNING_TICK_SEC: u64 = 5;
/// A reply may carry at most this many user-facing messages.
const MAX_REPLY_MESSAGES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct BotOffsets {
    outbox_offset_bytes: u64,
    ack_offset_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct RouterOffsets {
    events_in_offset_bytes: u64,
    bot_offsets: HashMap<String, BotOffsets>,
}

#[derive(Debug, Clone)]
struct BotPaths {
    inbox: PathBuf,
    outbox: PathBuf,
    ack: PathBuf,
    deadletter: PathBuf,
}

pub struct RouterBank {
    cfg: Config,
    user_state_path: PathBuf,
    inflight_path: PathBuf,
    ledger_path: PathBuf,
    user_state_mirror_path: Option<PathBuf>,
    events_in: PathBuf,
    replies_out: PathBuf,
    overlay_out: PathBuf,
    offsets_path: PathBuf,

    user_state: HashMap<String, crate::models::UserRecord>,
    inflight: HashMap<String, InflightEntry>,
    offsets: RouterOffsets,
    // BTreeMap: deterministic outbox polling order across ticks.
    bots: BTreeMap<String, BotPaths>,
    manager_commands: HashMap<String, CommandDef>,
    commands: HashMap<String, CommandDef>,
    slots: SlotsConfigWatcher,
    gamble: GambleQueue,

    dirty_user_state: bool,
    dirty_inflight: bool,
    dirty_offsets: bool,

    recent_cmd_exact: HashMap<String, f64>,
    recent_cmd_loose: HashMap<String, f64>,
    last_active_award_ts: u64,
}

impl RouterBank {
    /// Refuses to start without a readable config file.
    pub fn new(root: &Path) -> Result<RouterBank, String> {
        let layout = Layout::new(root);
        let cfg = Config::load(&layout.config_path())?;
        RouterBank::with_config(&layout, cfg)
    }

    pub fn with_config(layout: &Layout, cfg: Config) -> Result<RouterBank, String> {
        let user_state_path = layout.resolve_relative(
            cfg.state
                .get("user_state_file")
                .map(|s| s.as_str())
                .unwrap_or("state/user_state.json"),
        );
        let inflight_path = layout.resolve_relative(
            cfg.state
                .get("inflight_file")
                .map(|s| s.as_str())
                .unwrap_or("state/inflight.json"),
        );

        let user_state = storage::load_json_or(&user_state_path, HashMap::new());
        let inflight = storage::load_json_or(&inflight_path, HashMap::new());

        let ledger_path = layout.ledger_path();
        storage::ensure_file(&ledger_path).map_err(|e| e.to_string())?;

        let events_in = layout.events_inbox();
        let replies_out = layout.replies_outbox();
        let overlay_out = layout.overlay_outbox();
        for p in [&events_in, &replies_out, &overlay_out] {
            storage::ensure_file(p).map_err(|e| e.to_string())?;
        }

        // Optional same-origin mirror so overlays can fetch the balances.
        let mirror_raw = cfg.overlay_fallback.user_state_mirror_file.trim();
        let user_state_mirror_path = if mirror_raw.is_empty() {
            None
        } else {
            let p = layout.resolve_from_root(mirror_raw);
            if let Err(e) = storage::atomic_write_json(&p, &user_state) {
                log::error!("[router] failed to initialize user_state mirror: {}", e);
            }
            Some(p)
        };

        let offsets_path = layout.state_dir.join("offsets.router.json");
        let mut offsets: RouterOffsets =
            storage::load_json_or(&offsets_path, RouterOffsets::default());

        let mut bots = BTreeMap::new();
        for b in cfg.enabled_bots() {
            let paths = BotPaths {
                inbox: layout.resolve_relative(&b.inbox),
                outbox: layout.resolve_relative(&b.outbox),
                ack: layout.resolve_relative(&b.ack),
                deadletter: layout.resolve_relative(&b.deadletter),
            };
            for p in [&paths.inbox, &paths.outbox, &paths.ack, &paths.deadletter] {
                storage::ensure_file(p).map_err(|e| e.to_string())?;
            }
            offsets.bot_offsets.entry(b.id.clone()).or_default();
            bots.insert(b.id, paths);
        }

        let manager_commands = index_commands(&cfg.manager_commands);
        let commands = index_commands(&cfg.commands);

        let slots = SlotsConfigWatcher::new(layout.slots_config_path());
        let gamble = GambleQueue::open(layout.state_dir.join("gamble_queue.json"));

        log::info!("[router] events_in={}", events_in.display());
        log::info!("[router] replies_out={}", replies_out.display());
        log::info!("[router] bots={:?}", bots.keys().collect::<Vec<_>>());

        Ok(RouterBank {
            cfg,
            user_state_path,
            inflight_path,
            ledger_path,
            user_state_mirror_path,
            events_in,
            replies_out,
            overlay_out,
            offsets_path,
            user_state,
            inflight,
            offsets,
            bots,
            manager_commands,
            commands,
            slots,
            gamble,
            dirty_user_state: false,
            dirty_inflight: false,
            dirty_offsets: false,
            recent_cmd_exact: HashMap::new(),
            recent_cmd_loose: HashMap::new(),
            last_active_award_ts: now_ts(),
        })
    }

    pub async fn run(&mut self) {
        log::info!("[router] started");
        let poll = self.cfg.poll_interval();
        loop {
            self.tick();
            tokio::time::sleep(poll).await;
        }
    }

    /// One full loop iteration. Public so tests can drive the router
    /// deterministically.
    pub fn tick(&mut self) {
        self.award_active_points_tick();
        self.poll_events();
        self.poll_bot_outboxes();
        self.maybe_dispatch_gamble();
        self.flush();
    }

    // ---------- bank ----------

    fn user_rec(&mut self, user_key: &str) -> &mut crate::models::UserRecord {
        if !self.user_state.contains_key(user_key) {
            let mut rec = crate::models::UserRecord::default();
            rec.last_award_ts = now_ts();
            self.user_state.insert(user_key.to_string(), rec);
            self.dirty_user_state = true;
        }
        self.user_state.get_mut(user_key).expect("just inserted")
    }

    pub fn get_points(&mut self, user_key: &str) -> i64 {
        self.user_rec(user_key).points
    }

    /// Clamps at zero: the bank never holds a negative balance.
    pub fn set_points(&mut self, user_key: &str, points: i64) {
        self.user_rec(user_key).points = points.max(0);
        self.dirty_user_state = true;
    }

    pub fn add_points(&mut self, user_key: &str, delta: i64) {
        let current = self.get_points(user_key);
        self.set_points(user_key, current + delta);
    }

    // ---------- cooldowns ----------

    fn cooldown_ok(&mut self, user_key: &str, cdef: &CommandDef, user_tier: Tier) -> bool {
        if cdef.cooldown_seconds == 0 {
            return true;
        }
        if let Some(bypass) = cdef.bypass_tier() {
            if user_tier >= bypass {
                return true;
            }
        }
        let last = self
            .user_rec(user_key)
            .cooldowns
            .get(&cdef.command)
            .copied()
            .unwrap_or(0);
        now_ts().saturating_sub(last) >= cdef.cooldown_seconds
    }

    fn cooldown_remaining(&mut self, user_key: &str, cdef: &CommandDef) -> u64 {
        if cdef.cooldown_seconds == 0 {
            return 0;
        }
        let last = self
            .user_rec(user_key)
            .cooldowns
            .get(&cdef.command)
            .copied()
            .unwrap_or(0);
        cdef.cooldown_seconds
            .saturating_sub(now_ts().saturating_sub(last))
    }

    fn set_cooldown(&mut self, user_key: &str, cmd_name: &str) {
        let now = now_ts();
        self.user_rec(user_key)
            .cooldowns
            .insert(cmd_name.to_string(), now);
        self.dirty_user_state = true;
    }

    // ---------- output ----------

    fn emit_reply(&self, platform: &str, reply_name: &str, text: String, bot_id: &str) {
        let intent = ReplyIntent {
            ts: now_ts(),
            platform: platform.to_string(),
            reply_name: reply_name.to_string(),
            text,
            bot: bot_id.to_string(),
            ..ReplyIntent::default()
        };
        if let Err(e) = bus::append_jsonl(&self.replies_out, &intent) {
            log::error!("[router] reply emit failed: {}", e);
        }
    }

    fn emit_overlay(&self, overlay: &str, event: &str, payload: Value, event_id: String) {
        let record = OverlayEventRecord {
            ts: now_ts(),
            overlay: overlay.to_string(),
            event: event.to_string(),
            event_id,
            payload,
            ..OverlayEventRecord::default()
        };
        if let Err(e) = bus::append_jsonl(&self.overlay_out, &record) {
            log::error!("[router] overlay emit failed: {}", e);
        }
    }

    fn record_ledger(
        &self,
        user_key: &str,
        platform: &str,
        cmd_name: &str,
        bot_id: &str,
        delta: i64,
        before: i64,
        after: i64,
        note: String,
    ) {
        let entry = LedgerEntry {
            ts: now_ts(),
            platform: platform.to_string(),
            user_key: user_key.to_string(),
            command: cmd_name.to_string(),
            bot: bot_id.to_string(),
            delta,
            before,
            after,
            note,
        };
        if let Err(e) = bus::append_jsonl(&self.ledger_path, &entry) {
            log::error!("[router] ledger write failed: {}", e);
        }
    }

    fn plural_pts(n: i64) -> &'static str {
        if n == 1 { "pt" } else { "pts" }
    }

    fn emit_command_receipt(
        &self,
        platform: &str,
        reply_name: &str,
        cmd_name: &str,
        cost: i64,
        new_total: i64,
        bot_id: &str,
    ) {
        let msg = format!(
            "Receipt: !{} cost {} {}. New total: {} {}.",
            cmd_name,
            cost,
            Self::plural_pts(cost),
            new_total,
            Self::plural_pts(new_total)
        );
        self.emit_reply(platform, reply_name, msg, bot_id);
    }

    // ---------- command parsing ----------

    /// A text is a command iff it starts with `!`. Name is lowercased; args
    /// keep their original form (untrimmed tail after the first whitespace).
    pub fn parse_command(text: &str) -> Option<(String, String)> {
        let raw = text.strip_prefix('!')?;
        if raw.is_empty() {
            return None;
        }
        let mut split = raw.splitn(2, char::is_whitespace);
        let cmd = split.next()?.trim().to_ascii_lowercase();
        if cmd.is_empty() {
            return None;
        }
        let args = split.next().unwrap_or("").to_string();
        Some((cmd, args))
    }

    fn parse_bet(args: &str, spendable: i64) -> i64 {
        let a = args.trim().to_ascii_lowercase();
        if a.is_empty() {
            return if spendable > 0 { spendable.min(50) } else { 0 };
        }
        if a == "max" || a == "all" {
            return spendable;
        }
        a.parse::<i64>().map(|n| n.max(0)).unwrap_or(0)
    }

    // ---------- dedup guard ----------

    /// True when the command should be dropped as a duplicate. Always
    /// records the sighting, so even unknown commands refresh the windows.
    fn is_duplicate_command(
        &mut self,
        platform: &str,
        user_key: &str,
        reply_name: &str,
        cmd: &str,
        args: &str,
        ev_ts: u64,
    ) -> bool {
        let nowf = now_ms() as f64 / 1000.0;
        let base = format!("{}|{}|{}|{}|{}", platform, user_key, reply_name, cmd, args);
        let k_exact = format!("{}|{}", base, ev_ts);

        let cut_exact = nowf - DEDUP_EXACT_WINDOW_SEC;
        self.recent_cmd_exact.retain(|_, t| *t >= cut_exact);
        let cut_loose = nowf - DEDUP_LOOSE_WINDOW_SEC;
        self.recent_cmd_loose.retain(|_, t| *t >= cut_loose);

        if self.recent_cmd_exact.contains_key(&k_exact) {
            return true;
        }
        if self.recent_cmd_loose.contains_key(&base) {
            return true;
        }
        self.recent_cmd_exact.insert(k_exact, nowf);
        self.recent_cmd_loose.insert(base, nowf);
        false
    }

    // ---------- manager commands ----------

    fn handle_manager_command(
        &mut self,
        cdef: CommandDef,
        platform: &str,
        reply_name: &str,
        user_key: &str,
        user_tier: Tier,
    ) {
        if user_tier < cdef.min_tier {
            return;
        }
        let cmd_name = cdef.command.clone();
        let cost = cdef.cost_points;

        if !self.cooldown_ok(user_key, &cdef, user_tier) {
            let rem = self.cooldown_remaining(user_key, &cdef);
            if rem > 0 {
                let pts_now = self.get_points(user_key);
                self.emit_reply(
                    platform,
                    reply_name,
                    format!("!{} is on cooldown for {}s.", cmd_name, rem),
                    "manager",
                );
                self.emit_reply(
                    platform,
                    reply_name,
                    format!(
                        "Receipt: !{} cost {} pts (not charged - cooldown). Total: {} pts.",
                        cmd_name, cost, pts_now
                    ),
                    "manager",
                );
            }
            return;
        }
        self.set_cooldown(user_key, &cmd_name);

        // Manager commands are free by default; the receipt is for
        // transparency.
        let pts_now = self.get_points(user_key);
        match cmd_name.as_str() {
            "points" => {
                // One line: balance + receipt, to reduce chat spam.
                self.emit_reply(
                    platform,
                    reply_name,
                    format!(
                        "You have {} points. Receipt: !{} cost {} pts. New total: {} pts.",
                        pts_now, cmd_name, cost, pts_now
                    ),
                    "manager",
                );
            }
            "spothelp" => {
                self.emit_command_receipt(platform, reply_name, &cmd_name, cost, pts_now, "manager");
                self.send_help(platform, reply_name, user_key, user_tier);
            }
            other => {
                log::debug!("[router] unhandled manager command: {}", other);
            }
        }
    }

    /// Help text filtered to what the user can run right now (tier and
    /// affordability), chunked to the configured per-message length.
    fn send_help(&mut self, platform: &str, reply_name: &str, user_key: &str, user_tier: Tier) {
        let pts = self.get_points(user_key);
        let mut lines: Vec<String> = self.cfg.help.header_lines.clone();
        lines.push(String::new());

        let collect = |index: &HashMap<String, CommandDef>| -> Vec<String> {
            let mut out = Vec::new();
            let mut names: Vec<&String> = index
                .iter()
                .filter(|(k, c)| **k == c.command)
                .map(|(k, _)| k)
                .collect();
            names.sort();
            for name in names {
                let c = &index[name];
                if !c.show_in_help {
                    continue;
                }
                if user_tier < c.min_tier {
                    continue;
                }
                if c.cost_points > pts {
                    continue;
                }
                out.extend(c.help_lines.iter().cloned());
            }
            out
        };

        let mgr_lines = collect(&self.manager_commands);
        let cmd_lines = collect(&self.commands);

        if !mgr_lines.is_empty() {
            lines.push("Manager commands:".to_string());
            lines.extend(mgr_lines);
            lines.push(String::new());
        }
        if !cmd_lines.is_empty() {
            lines.push("Bot commands:".to_string());
            lines.extend(cmd_lines);
            lines.push(String::new());
        }

        let chunk_len = self.cfg.help.chunk_len.max(1);
        let joined = lines.join("\n");
        let mut chunk = String::new();
        for ln in joined.trim().lines() {
            let add_len = ln.chars().count() + 1;
            if chunk.chars().count() + add_len > chunk_len && !chunk.trim().is_empty() {
                self.emit_reply(platform, reply_name, chunk.trim().to_string(), "manager");
                chunk.clear();
            }
            chunk.push_str(ln);
            chunk.push('\n');
        }
        if !chunk.trim().is_empty() {
            self.emit_reply(platform, reply_name, chunk.trim().to_string(), "manager");
        }
    }

    // ---------- bot commands ----------

    fn handle_bot_command(
        &mut self,
        cdef: CommandDef,
        platform: &str,
        reply_name: &str,
        user_key: &str,
        user_tier: Tier,
        args: &str,
    ) {
        if user_tier < cdef.min_tier {
            return;
        }
        let cmd_name = cdef.command.clone();
        let bot_id = if cdef.bot.is_empty() { "manager".to_string() } else { cdef.bot.clone() };

        if !self.cooldown_ok(user_key, &cdef, user_tier) {
            let rem = self.cooldown_remaining(user_key, &cdef);
            if rem > 0 {
                let pts_now = self.get_points(user_key);
                // Gamble sizes its wager dynamically; show cost 0 on cooldown.
                let cost_static = if bot_id == "gamble" { 0 } else { cdef.cost_points };
                self.emit_reply(
                    platform,
                    reply_name,
                    format!("!{} is on cooldown for {}s.", cmd_name, rem),
                    &bot_id,
                );
                self.emit_reply(
                    platform,
                    reply_name,
                    format!(
                        "Receipt: !{} cost {} pts (not charged - cooldown). Total: {} pts.",
                        cmd_name, cost_static, pts_now
                    ),
                    &bot_id,
                );
            }
            return;
        }
        self.set_cooldown(user_key, &cmd_name);

        if bot_id == "gamble" {
            self.enqueue_gamble(&cdef, platform, reply_name, user_key, args);
            return;
        }

        let cost = cdef.cost_points;
        let pts_before = self.get_points(user_key);

        if cost > 0 && pts_before < cost {
            // Not charged: insufficient funds, but still a clear receipt.
            self.emit_reply(
                platform,
                reply_name,
                format!(
                    "You need {} points for that command. You have {}. Receipt: !{} cost {} pts (not charged). Total: {} pts.",
                    cost, pts_before, cmd_name, cost, pts_before
                ),
                &bot_id,
            );
            return;
        }

        let mut pts_after = pts_before;
        if cost > 0 {
            pts_after = (pts_before - cost).max(0);
            self.set_points(user_key, pts_after);
            self.record_ledger(
                user_key,
                platform,
                &cmd_name,
                &bot_id,
                -cost,
                pts_before,
                pts_after,
                "command_cost".to_string(),
            );
        }

        self.emit_command_receipt(platform, reply_name, &cmd_name, cost, pts_after, &bot_id);

        if self.bots.contains_key(&bot_id) {
            self.dispatch_to_worker(&bot_id, &cdef, platform, reply_name, user_key, user_tier, args);
        }
    }

    fn dispatch_to_worker(
        &mut self,
        bot_id: &str,
        cdef: &CommandDef,
        platform: &str,
        reply_name: &str,
        user_key: &str,
        user_tier: Tier,
        args: &str,
    ) {
        let task = Task {
            task_id: new_task_id(),
            ts: now_ts(),
            bot: bot_id.to_string(),
            action: cdef.action.clone(),
            command: cdef.command.clone(),
            args: args.to_string(),
            platform: platform.to_string(),
            reply_name: reply_name.to_string(),
            user_key: user_key.to_string(),
            user_tier,
            ..Task::default()
        };
        if let Err(e) = bus::append_jsonl(&self.bots[bot_id].inbox, &task) {
            log::error!("[router] dispatch to {} failed: {}", bot_id, e);
            return;
        }
        self.inflight.insert(
            task.task_id.clone(),
            InflightEntry {
                bot: bot_id.to_string(),
                platform: platform.to_string(),
                reply_name: reply_name.to_string(),
                user_key: user_key.to_string(),
                created_ts: now_ts(),
            },
        );
        self.dirty_inflight = true;
    }

    // ---------- gamble ----------

    fn enqueue_gamble(
        &mut self,
        cdef: &CommandDef,
        platform: &str,
        reply_name: &str,
        user_key: &str,
        args: &str,
    ) {
        self.slots.refresh();
        let points = self.get_points(user_key);
        let reserved = self.gamble.reserved_points_for_user(user_key);
        let spendable = (points - reserved).max(0);

        let cmd_name = if cdef.command.is_empty() { "slots" } else { &cdef.command };
        let bet = Self::parse_bet(args, spendable);

        if bet <= 0 {
            // Not charged. Still a receipt plus the wagerable balance.
            self.emit_reply(
                platform,
                reply_name,
                format!("You have {} points available to wager.", spendable),
                "gamble",
            );
            self.emit_reply(
                platform,
                reply_name,
                format!(
                    "Receipt: !{} cost 0 pts. New total: {} pts. Available to wager: {} pts.",
                    cmd_name, points, spendable
                ),
                "gamble",
            );
            return;
        }
        if bet > spendable {
            self.emit_reply(platform, reply_name, format!("Max wager is {}.", spendable), "gamble");
            self.emit_reply(
                platform,
                reply_name,
                format!(
                    "Receipt: !{} cost 0 pts. New total: {} pts. Available to wager: {} pts.",
                    cmd_name, points, spendable
                ),
                "gamble",
            );
            return;
        }

        let task = GambleTask {
            task_id: new_gamble_task_id(),
            action: if cdef.action.is_empty() { "slots".to_string() } else { cdef.action.clone() },
            bet,
            platform: platform.to_string(),
            reply_name: reply_name.to_string(),
            user_key: user_key.to_string(),
            created_ts: now_ts(),
            available_points: spendable,
            slots_cfg: Some(self.slots.current().clone()),
            command: cmd_name.to_string(),
        };

        let pos = self.gamble.enqueue(task);
        let available_after = (points - (reserved + bet)).max(0);

        self.emit_reply(
            platform,
            reply_name,
            format!("You're queued (# {}). Wager: {}.", pos, bet),
            "gamble",
        );
        self.emit_reply(
            platform,
            reply_name,
            format!(
                "Receipt: !{} cost {} pts (reserved wager). New total: {} pts. Available to wager: {} pts.",
                cmd_name, bet, points, available_after
            ),
            "gamble",
        );
        self.record_ledger(
            user_key,
            platform,
            cmd_name,
            "gamble",
            0,
            points,
            points,
            format!("wager_reserved={}; available_after={}", bet, available_after),
        );
    }

    fn maybe_dispatch_gamble(&mut self) {
        let Some(paths) = self.bots.get("gamble") else { return };
        if !self.gamble.can_dispatch(now_ts()) {
            return;
        }
        let inbox = paths.inbox.clone();
        let Some(task) = self.gamble.pop_next_for_dispatch() else { return };
        log::debug!("[router] dispatching gamble task {}", task.task_id);
        if let Err(e) = bus::append_jsonl(&inbox, &task) {
            log::error!("[router] gamble dispatch failed: {}", e);
        }
    }

    fn handle_gamble_reply(&mut self, rec: &Value) {
        let task_id = rec.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
        let active = match self.gamble.data.active.clone() {
            Some(a) if a.task_id == task_id => a,
            _ => {
                log::debug!("[router] gamble reply {} does not match the active task", task_id);
                return;
            }
        };

        let user_key = active.user_key.clone();
        let platform = active.platform.clone();
        let reply_name = active.reply_name.clone();
        let mut cmd_name = if active.command.is_empty() { "slots".to_string() } else { active.command.clone() };
        if cmd_name.eq_ignore_ascii_case("gamble") {
            cmd_name = "slots".to_string();
        }

        // Settle against the snapshot the user saw at enqueue time; fall back
        // to the live (hot-reloadable) config.
        self.slots.refresh();
        let cfg = match &active.slots_cfg {
            Some(snapshot) => snapshot.clone(),
            None => self.slots.current().clone(),
        };

        let empty = Value::Object(serde_json::Map::new());
        let game = rec.get("game").unwrap_or(&empty);

        // The active task is the source of truth for the bet; the worker may
        // override (e.g. after clamping).
        let bet = game.get("bet").and_then(|v| v.as_i64()).unwrap_or(active.bet);
        let result_code = game
            .get("result_code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut symbols = ["symbols", "result", "spin", "reels"]
            .iter()
            .filter_map(|k| game.get(*k))
            .map(slots::coerce_symbols)
            .find(|s| !s.is_empty())
            .unwrap_or_default();
        if symbols.is_empty() {
            symbols = ["s1", "s2", "s3"]
                .iter()
                .filter_map(|k| game.get(*k))
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .take(3)
                .collect();
        }

        let mult_from_game = game
            .get("multiplier")
            .or_else(|| game.get("mult"))
            .and_then(|v| v.as_i64());

        let outcome = match mult_from_game {
            Some(mult) => {
                let rule_name = game
                    .get("rule_name")
                    .or_else(|| game.get("rule"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| {
                        if result_code.is_empty() { "WIN".to_string() } else { result_code.clone() }
                    });
                let symbols = if symbols.is_empty() {
                    slots::RESULTCODE_SYMBOLS
                        .get(result_code.as_str())
                        .map(|s| s.iter().map(|x| x.to_string()).collect())
                        .unwrap_or_else(|| vec!["?".into(), "?".into(), "?".into()])
                } else {
                    symbols
                };
                slots::SlotsOutcome {
                    mult,
                    rule_name,
                    result_code: if result_code.is_empty() {
                        "SLOTS_CUSTOM".to_string()
                    } else {
                        result_code.clone()
                    },
                    symbols,
                }
            }
            None => slots::eval_slots(&symbols, &result_code, &cfg),
        };

        // Gross payout (wager included); worker value validated, router
        // otherwise computes bet × mult.
        let payout = game
            .get("payout")
            .or_else(|| game.get("payout_points"))
            .or_else(|| game.get("win_points"))
            .and_then(|v| v.as_i64())
            .unwrap_or(bet * outcome.mult)
            .max(0);

        let pts_before = self.get_points(&user_key);
        let net = payout - bet;
        let pts_after = (pts_before + net).max(0);
        self.set_points(&user_key, pts_after);

        let sym_disp = if outcome.symbols.is_empty() {
            "? | ? | ?".to_string()
        } else {
            outcome.symbols.iter().take(3).cloned().collect::<Vec<_>>().join(" | ")
        };

        let mut result_line = if outcome.mult > 0 && payout > 0 {
            format!(
                "🎰 Slots: [{}] — WIN x{}! Won {} pts (net +{} pts). Total: {} pts.",
                sym_disp, outcome.mult, payout, net, pts_after
            )
        } else {
            format!(
                "🎰 Slots: [{}] — You lose. Lost {} pts. Total: {} pts.",
                sym_disp, bet, pts_after
            )
        };
        result_line.push_str(&format!(
            " Receipt: !{} cost {} pts. New total: {} pts.",
            cmd_name, bet, pts_after
        ));
        self.emit_reply(&platform, &reply_name, result_line, "gamble");

        self.record_ledger(
            &user_key,
            &platform,
            &cmd_name,
            "gamble",
            net,
            pts_before,
            pts_after,
            format!(
                "slots; rule={}; result_code={}; symbols={}; bet={}; mult={}; payout={}; net={}",
                outcome.rule_name, outcome.result_code, sym_disp, bet, outcome.mult, payout, net
            ),
        );

        if let Some(events) = rec.get("overlay_events").and_then(|v| v.as_array()) {
            for ev in events {
                let overlay = ev.get("overlay").and_then(|v| v.as_str()).unwrap_or("casino");
                let overlay = if overlay.is_empty() { "casino" } else { overlay };
                let event = ev.get("event").and_then(|v| v.as_str()).unwrap_or("");
                let payload = ev
                    .get("payload")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                self.emit_overlay(overlay, event, payload, format!("evt_{}", active.task_id));
            }
        }

        let blocking_ms = rec.get("blocking_ms").and_then(|v| v.as_i64()).unwrap_or(0);
        self.gamble.mark_done(blocking_ms);
    }

    // ---------- worker replies ----------

    fn handle_worker_reply(&mut self, bot_id: &str, rec: &Value) {
        if rec.get("type").and_then(|v| v.as_str()) != Some("reply") {
            return;
        }
        if bot_id == "gamble" {
            self.handle_gamble_reply(rec);
            return;
        }

        let task_id = rec.get("task_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let Some(meta) = self.inflight.get(&task_id).cloned() else {
            let deadletter = self.bots[bot_id].deadletter.clone();
            let orphan = serde_json::json!({
                "type": "orphan_reply",
                "ts": now_ts(),
                "at": crate::models::now_iso(),
                "record": rec,
            });
            if let Err(e) = bus::append_jsonl(&deadletter, &orphan) {
                log::error!("[router] deadletter write failed: {}", e);
            }
            return;
        };

        let reply: WorkerReply = serde_json::from_value(rec.clone()).unwrap_or_default();
        for m in reply.messages.iter().take(MAX_REPLY_MESSAGES) {
            self.emit_reply(&meta.platform, &meta.reply_name, m.clone(), bot_id);
        }

        self.inflight.remove(&task_id);
        self.dirty_inflight = true;
    }

    // ---------- events + earning ----------

    /// Every 5 s: users seen within the active window earn whole minutes of
    /// points. `last_award_ts` advances by the awarded minutes, not to `now`,
    /// so partial minutes are never lost to drift.
    fn award_active_points_tick(&mut self) {
        let now = now_ts();
        if now.saturating_sub(self.last_active_award_ts) < EARNING_TICK_SEC {
            return;
        }
        self.last_active_award_ts = now;

        let active_window = self.cfg.earning.active_window_seconds;
        let per_minute = self.cfg.earning.points_per_minute_active;
        for rec in self.user_state.values_mut() {
            if now.saturating_sub(rec.last_seen_ts) > active_window {
                continue;
            }
            let last_award = if rec.last_award_ts == 0 { now } else { rec.last_award_ts };
            let elapsed = now.saturating_sub(last_award);
            if elapsed < 60 {
                continue;
            }
            let minutes = elapsed / 60;
            let add = minutes as i64 * per_minute;
            if add > 0 {
                rec.points = (rec.points + add).max(0);
                rec.last_award_ts = last_award + minutes * 60;
                self.dirty_user_state = true;
            }
        }
    }

    pub fn process_event(&mut self, ev: &Event) {
        let platform = ev.platform.to_ascii_lowercase();
        let user_key = ev.user_key.clone();
        let reply_name = if ev.reply_name.is_empty() { "User".to_string() } else { ev.reply_name.clone() };

        self.user_rec(&user_key).last_seen_ts = now_ts();
        self.dirty_user_state = true;

        match ev.kind.as_str() {
            "chat" => {
                if self.cfg.earning.points_per_message != 0 {
                    self.add_points(&user_key, self.cfg.earning.points_per_message);
                }

                let Some((cmd, args)) = Self::parse_command(&ev.text) else { return };
                if self.is_duplicate_command(&platform, &user_key, &reply_name, &cmd, &args, ev.ts)
                {
                    log::debug!("[router] duplicate !{} from {} dropped", cmd, user_key);
                    return;
                }

                if let Some(cdef) = self.manager_commands.get(&cmd).cloned() {
                    self.handle_manager_command(cdef, &platform, &reply_name, &user_key, ev.tier);
                } else if let Some(cdef) = self.commands.get(&cmd).cloned() {
                    self.handle_bot_command(cdef, &platform, &reply_name, &user_key, ev.tier, &args);
                }
            }
            "like" => {
                if self.cfg.earning.points_per_like != 0 {
                    self.add_points(&user_key, self.cfg.earning.points_per_like);
                }
            }
            "share" => {
                if self.cfg.earning.points_per_share != 0 {
                    self.add_points(&user_key, self.cfg.earning.points_per_share);
                }
            }
            _ => {}
        }
    }

    // ---------- polling ----------

    fn poll_events(&mut self) {
        let off = self.offsets.events_in_offset_bytes;
        let (records, new_off) = bus::read_new_jsonl(&self.events_in, off);
        if new_off != off {
            self.offsets.events_in_offset_bytes = new_off;
            self.dirty_offsets = true;
        }
        for r in records {
            if let Ok(ev) = serde_json::from_value::<Event>(r) {
                self.process_event(&ev);
            }
        }
    }

    fn poll_bot_outboxes(&mut self) {
        let bot_ids: Vec<String> = self.bots.keys().cloned().collect();
        for bot_id in bot_ids {
            let paths = self.bots[&bot_id].clone();
            let bo = self.offsets.bot_offsets.entry(bot_id.clone()).or_default().clone();

            let (replies, out_off) = bus::read_new_jsonl(&paths.outbox, bo.outbox_offset_bytes);
            if out_off != bo.outbox_offset_bytes {
                self.offsets
                    .bot_offsets
                    .get_mut(&bot_id)
                    .expect("entry created above")
                    .outbox_offset_bytes = out_off;
                self.dirty_offsets = true;
            }
            for rec in &replies {
                self.handle_worker_reply(&bot_id, rec);
            }

            // Acks only advance the cursor; the supervisor reads their mtime.
            let (_acks, ack_off) = bus::read_new_jsonl(&paths.ack, bo.ack_offset_bytes);
            if ack_off != bo.ack_offset_bytes {
                self.offsets
                    .bot_offsets
                    .get_mut(&bot_id)
                    .expect("entry created above")
                    .ack_offset_bytes = ack_off;
                self.dirty_offsets = true;
            }
        }
    }

    // ---------- flush ----------

    fn flush(&mut self) {
        if self.dirty_user_state {
            if let Err(e) = storage::atomic_write_json(&self.user_state_path, &self.user_state) {
                log::error!("[router] user_state flush failed: {}", e);
            } else {
                if let Some(mirror) = &self.user_state_mirror_path {
                    if let Err(e) = storage::atomic_write_json(mirror, &self.user_state) {
                        log::error!("[router] user_state mirror failed: {}", e);
                    }
                }
                self.dirty_user_state = false;
            }
        }
        if self.dirty_inflight {
            if let Err(e) = storage::atomic_write_json(&self.inflight_path, &self.inflight) {
                log::error!("[router] inflight flush failed: {}", e);
            } else {
                self.dirty_inflight = false;
            }
        }
        if self.dirty_offsets {
            if let Err(e) = storage::atomic_write_json(&self.offsets_path, &self.offsets) {
                log::error!("[router] offsets flush failed: {}", e);
            } else {
                self.dirty_offsets = false;
            }
        }
    }
}
