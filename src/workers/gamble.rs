//! Gamble worker: spins the slot machine.
//!
//! Single-instance (a payout engine must never run twice against the same
//! inbox). The worker only *proposes* an outcome (reels, result code, gross
//! payout, animation length) and the router settles it against the payout
//! config. Every task gets exactly one reply and one ack, including on
//! error.

use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use crate::models::{now_ts, OverlayPayload, WorkerAck, WorkerReply};
use crate::storage::Layout;
use crate::workers::lock::WorkerLock;
use crate::workers::{env_secs, poll_sleep, WorkerBus};

/// Weighted reel symbols: (token, emoji, weight).
const SYMBOLS: &[(&str, &str, u32)] = &[
    ("CHERRY", "🍒", 22),
    ("LEMON", "🍋", 18),
    ("GRAPE", "🍇", 16),
    ("DIAMOND", "💎", 8),
    ("BAR", "🟥", 5),
    ("SEVEN", "7️⃣", 3),
];

#[derive(Debug, Clone, Copy)]
struct SpinRule {
    mult: i64,
    tier: &'static str,
    animation: &'static str,
    spin_ms: i64,
}

/// Deterministic result codes so the router can validate payouts.
static RULES: Lazy<HashMap<&'static str, SpinRule>> = Lazy::new(|| {
    HashMap::from([
        ("SLOTS_777", SpinRule { mult: 25, tier: "jackpot", animation: "slots_jackpot_v1", spin_ms: 3200 }),
        ("SLOTS_TRIPLE_BAR", SpinRule { mult: 15, tier: "big_win", animation: "slots_bigwin_v1", spin_ms: 2600 }),
        ("SLOTS_TRIPLE_CHERRY", SpinRule { mult: 8, tier: "big_win", animation: "slots_bigwin_v1", spin_ms: 2400 }),
        ("SLOTS_DOUBLE_7", SpinRule { mult: 3, tier: "win", animation: "slots_win_v1", spin_ms: 2200 }),
        ("SLOTS_DOUBLE_CHERRY", SpinRule { mult: 2, tier: "win", animation: "slots_win_v1", spin_ms: 2100 }),
        ("SLOTS_SINGLE_CHERRY", SpinRule { mult: 1, tier: "small_win", animation: "slots_small_v1", spin_ms: 1900 }),
        ("SLOTS_LOSS", SpinRule { mult: 0, tier: "loss", animation: "slots_loss_v1", spin_ms: 1700 }),
    ])
});

fn weighted_symbol<R: Rng>(rng: &mut R) -> &'static str {
    let total: u32 = SYMBOLS.iter().map(|(_, _, w)| w).sum();
    let mut roll = rng.gen_range(0..total);
    for (_, emoji, weight) in SYMBOLS {
        if roll < *weight {
            return emoji;
        }
        roll -= weight;
    }
    SYMBOLS[0].1
}

/// Pure classification of three reels to a result code.
pub fn classify(reels: &[&str]) -> &'static str {
    let seven = "7️⃣";
    let bar = "🟥";
    let cherry = "🍒";

    if reels == [seven, seven, seven] {
        return "SLOTS_777";
    }
    if reels == [bar, bar, bar] {
        return "SLOTS_TRIPLE_BAR";
    }
    if reels == [cherry, cherry, cherry] {
        return "SLOTS_TRIPLE_CHERRY";
    }
    let sevens = reels.iter().filter(|x| **x == seven).count();
    if sevens == 2 {
        return "SLOTS_DOUBLE_7";
    }
    let cherries = reels.iter().filter(|x| **x == cherry).count();
    if cherries == 2 {
        return "SLOTS_DOUBLE_CHERRY";
    }
    if cherries == 1 {
        return "SLOTS_SINGLE_CHERRY";
    }
    "SLOTS_LOSS"
}

#[derive(Debug, Clone)]
pub struct SpinResult {
    pub result_code: &'static str,
    pub payout: i64,
    pub reels: Vec<String>,
    pub tier: &'static str,
    pub animation: &'static str,
    pub spin_ms: i64,
}

pub fn play_slots<R: Rng>(bet: i64, rng: &mut R) -> SpinResult {
    let reels = [weighted_symbol(rng), weighted_symbol(rng), weighted_symbol(rng)];
    let code = classify(&reels);
    let rule = RULES[code];
    SpinResult {
        result_code: code,
        payout: bet * rule.mult,
        reels: reels.iter().map(|s| s.to_string()).collect(),
        tier: rule.tier,
        animation: rule.animation,
        spin_ms: rule.spin_ms,
    }
}

/// Domain payload merged into the outbox reply record.
#[derive(Debug, Clone)]
pub struct GameReply {
    pub game: Value,
    pub messages: Vec<String>,
    pub overlay_events: Vec<OverlayPayload>,
    pub blocking_ms: i64,
}

fn task_i64(task: &Value, key: &str) -> i64 {
    task.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn task_str<'a>(task: &'a Value, key: &str, default: &'a str) -> &'a str {
    task.get(key).and_then(|v| v.as_str()).unwrap_or(default)
}

/// Run one game task. Worker-side guardrails only; the router is the bank
/// and re-validates the payout.
pub fn run_game_task<R: Rng>(task: &Value, rng: &mut R) -> GameReply {
    let action = task_str(task, "action", "").trim().to_ascii_lowercase();
    let mut bet = task_i64(task, "bet");
    let available = task_i64(task, "available_points");
    let reply_name = task_str(task, "reply_name", "Player").to_string();

    if bet <= 0 {
        return GameReply {
            game: json!({"name": if action.is_empty() { "unknown" } else { action.as_str() },
                         "bet": bet, "result_code": "INVALID_BET", "payout": 0}),
            messages: vec!["🎰 Invalid bet. Use `!slots <amount>` (or `max`).".to_string()],
            overlay_events: Vec::new(),
            blocking_ms: 0,
        };
    }
    if available > 0 && bet > available {
        bet = available;
    }

    if action == "slots" {
        let result = play_slots(bet, rng);
        let reels_disp = result.reels.join(" ");
        let message = if result.payout <= 0 {
            format!("🎰 {} spun {} — no win. (-{})", reply_name, reels_disp, bet)
        } else {
            format!(
                "🎰 {} spun {} — {}! (+{} | bet {})",
                reply_name,
                reels_disp,
                result.tier.to_uppercase(),
                result.payout,
                bet
            )
        };

        let overlay_event = OverlayPayload {
            overlay: "casino".to_string(),
            event: "slots_spin".to_string(),
            payload: json!({
                "player_name": reply_name,
                "bet": bet,
                "reels": result.reels,
                "tier": result.tier,
                "payout": result.payout,
                "animation": result.animation,
                "spin_ms": result.spin_ms,
            }),
        };

        return GameReply {
            game: json!({
                "name": "slots",
                "bet": bet,
                "result_code": result.result_code,
                "payout": result.payout,
                "symbols": result.reels,
                "reels": result.reels,
            }),
            messages: vec![message],
            overlay_events: vec![overlay_event],
            blocking_ms: result.spin_ms,
        };
    }

    GameReply {
        game: json!({"name": if action.is_empty() { "unknown" } else { action.as_str() },
                     "bet": bet, "result_code": "UNKNOWN_GAME", "payout": 0}),
        messages: vec![format!("🎰 Unknown game action: {}", action)],
        overlay_events: Vec::new(),
        blocking_ms: 0,
    }
}

fn reply_record(task_id: &str, ts: u64, payload: GameReply) -> WorkerReply {
    WorkerReply {
        task_id: task_id.to_string(),
        ts,
        messages: payload.messages,
        overlay_events: payload.overlay_events,
        blocking_ms: payload.blocking_ms,
        game: Some(payload.game),
        ..WorkerReply::default()
    }
}

/// Reply + ack for a task that blew up mid-computation. The user still gets
/// an answer and the router still sees a terminating reply.
fn error_records(task: &Value, task_id: &str, ts: u64, err: &str) -> (WorkerReply, WorkerAck) {
    let reply = WorkerReply {
        task_id: task_id.to_string(),
        ts,
        messages: vec![format!(
            "🎰 Sorry {} — the casino glitched. Try again.",
            task_str(task, "reply_name", "there")
        )],
        overlay_events: Vec::new(),
        blocking_ms: 0,
        game: Some(json!({
            "name": task_str(task, "action", "unknown"),
            "bet": task_i64(task, "bet"),
            "result_code": "ERROR",
            "payout": 0,
        })),
        error: Some(err.to_string()),
        ..WorkerReply::default()
    };
    let ack = WorkerAck {
        task_id: task_id.to_string(),
        ts,
        status: "error".to_string(),
        error: Some(err.to_string()),
        trace: Some(err.chars().take(2000).collect()),
        ..WorkerAck::default()
    };
    (reply, ack)
}

/// Process one batch of inbox records. Returns how many tasks were handled.
pub fn process_batch<R: Rng>(bus: &WorkerBus, tasks: &[Value], rng: &mut R) -> usize {
    let mut handled = 0;
    for task in tasks {
        let task_id = task_str(task, "task_id", "").trim().to_string();
        if task_id.is_empty() {
            continue;
        }
        let ts = now_ts();
        handled += 1;

        match catch_unwind(AssertUnwindSafe(|| run_game_task(task, rng))) {
            Ok(payload) => {
                bus.send_reply(&reply_record(&task_id, ts, payload));
                bus.send_ack(&WorkerAck { task_id: task_id.clone(), ts, ..WorkerAck::default() });
            }
            Err(panic) => {
                let err = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                log::error!("[gamble] task {} panicked: {}", task_id, err);
                let (reply, ack) = error_records(task, &task_id, ts, &err);
                bus.send_reply(&reply);
                bus.send_ack(&ack);
            }
        }
    }
    handled
}

pub async fn run(root: &Path) -> Result<(), String> {
    let layout = Layout::new(root);
    let mut bus = WorkerBus::open(&layout, "gamble")?;

    let lock_path = layout.worker_state_dir("gamble").join("worker.lock");
    let _lock = match WorkerLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            // Another instance is serving this inbox.
            log::warn!("[gamble] not starting: {}", e);
            return Ok(());
        }
    };

    let idle = std::time::Duration::from_secs_f64(env_secs("WORKER_POLL_SEC", 0.08));
    let mut rng = rand::thread_rng();
    log::info!("[gamble] started, inbox={}", bus.inbox.display());

    loop {
        match bus.drain() {
            Ok(tasks) => {
                let handled = process_batch(&bus, &tasks, &mut rng);
                tokio::time::sleep(poll_sleep(handled > 0, idle)).await;
            }
            Err(e) => {
                log::error!("[gamble] loop error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn classify_matches_result_codes() {
        assert_eq!(classify(&["7️⃣", "7️⃣", "7️⃣"]), "SLOTS_777");
        assert_eq!(classify(&["🟥", "🟥", "🟥"]), "SLOTS_TRIPLE_BAR");
        assert_eq!(classify(&["🍒", "🍒", "🍒"]), "SLOTS_TRIPLE_CHERRY");
        assert_eq!(classify(&["7️⃣", "7️⃣", "🍋"]), "SLOTS_DOUBLE_7");
        assert_eq!(classify(&["🍒", "🍋", "🍒"]), "SLOTS_DOUBLE_CHERRY");
        assert_eq!(classify(&["🍒", "🍋", "🍇"]), "SLOTS_SINGLE_CHERRY");
        assert_eq!(classify(&["🍋", "🍇", "💎"]), "SLOTS_LOSS");
    }

    #[test]
    fn payout_is_bet_times_rule_multiplier() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let result = play_slots(40, &mut rng);
            let rule = RULES[result.result_code];
            assert_eq!(result.payout, 40 * rule.mult);
            assert_eq!(result.reels.len(), 3);
            assert!(result.spin_ms > 0);
        }
    }

    #[test]
    fn invalid_bet_is_rejected_without_spin() {
        let mut rng = StdRng::seed_from_u64(1);
        let reply = run_game_task(&json!({"action": "slots", "bet": 0}), &mut rng);
        assert_eq!(reply.game["result_code"], "INVALID_BET");
        assert_eq!(reply.blocking_ms, 0);
        assert!(reply.overlay_events.is_empty());
    }

    #[test]
    fn bet_is_clamped_to_available_points() {
        let mut rng = StdRng::seed_from_u64(2);
        let reply = run_game_task(
            &json!({"action": "slots", "bet": 500, "available_points": 80, "reply_name": "A"}),
            &mut rng,
        );
        assert_eq!(reply.game["bet"], 80);
    }

    #[test]
    fn unknown_action_still_replies() {
        let mut rng = StdRng::seed_from_u64(3);
        let reply = run_game_task(&json!({"action": "poker", "bet": 10}), &mut rng);
        assert_eq!(reply.game["result_code"], "UNKNOWN_GAME");
        assert_eq!(reply.messages.len(), 1);
    }

    #[test]
    fn slots_reply_carries_overlay_event_and_blocking() {
        let mut rng = StdRng::seed_from_u64(4);
        let reply = run_game_task(
            &json!({"action": "slots", "bet": 10, "reply_name": "Alice"}),
            &mut rng,
        );
        assert_eq!(reply.overlay_events.len(), 1);
        let ev = &reply.overlay_events[0];
        assert_eq!(ev.overlay, "casino");
        assert_eq!(ev.event, "slots_spin");
        assert_eq!(ev.payload["player_name"], "Alice");
        assert_eq!(reply.blocking_ms, ev.payload["spin_ms"].as_i64().unwrap());
    }

    #[test]
    fn batch_produces_one_reply_and_one_ack_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WorkerBus::open_with(
            dir.path().join("gamble.inbox.jsonl"),
            dir.path().join("gamble.outbox.jsonl"),
            dir.path().join("gamble.ack.jsonl"),
            dir.path().join("state"),
        )
        .unwrap();

        let tasks = vec![
            json!({"task_id": "g_1", "action": "slots", "bet": 10, "reply_name": "A"}),
            json!({"task_id": "", "action": "slots", "bet": 10}),
            json!({"task_id": "g_2", "action": "nope", "bet": 10}),
        ];
        let mut rng = StdRng::seed_from_u64(5);
        let handled = process_batch(&bus, &tasks, &mut rng);
        assert_eq!(handled, 2);

        let (outbox, _) = crate::bus::read_new_jsonl(&bus.outbox, 0);
        let (acks, _) = crate::bus::read_new_jsonl(&bus.ack, 0);
        assert_eq!(outbox.len(), 2);
        assert_eq!(acks.len(), 2);
        assert_eq!(outbox[0]["type"], "reply");
        assert_eq!(outbox[0]["task_id"], "g_1");
        assert_eq!(acks[0]["status"], "ok");
        assert_eq!(acks[1]["task_id"], "g_2");
    }
}
