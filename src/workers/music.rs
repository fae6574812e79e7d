//! Music worker: chat-controlled playback through an external music API.
//!
//! The API client library is an external collaborator; this module only
//! defines the seam ([`MusicApi`]) and the worker around it. Because the
//! worker talks to an outside service, it runs active/standby: any number of
//! instances may be launched, but only the elected leader initialises the
//! client and serves the inbox. Standbys poll the heartbeat and take over
//! within the lock TTL when the leader dies.

use serde_json::Value;
use std::path::Path;

use crate::models::{now_ms, now_ts, WorkerAck, WorkerReply};
use crate::storage::Layout;
use crate::workers::lock::{LeaderElection, LeaderInfo};
use crate::workers::{env_secs, poll_sleep, WorkerBus};

/// Currently-playing track.
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub title: String,
    pub url: Option<String>,
}

/// Seam to the external music service. Implementations live outside this
/// crate; [`UnconfiguredMusic`] stands in when no client is wired up.
pub trait MusicApi {
    fn ensure_active_device(&mut self) -> Result<(), String>;
    fn now_playing(&mut self) -> Result<Option<NowPlaying>, String>;
    /// (currently playing, up-next titles).
    fn upcoming(&mut self, limit: usize) -> Result<(Option<String>, Vec<String>), String>;
    /// `Ok(None)`: nothing matched the query.
    fn enqueue_track(&mut self, query: &str) -> Result<Option<String>, String>;
    fn skip(&mut self) -> Result<(), String>;
    fn play(&mut self) -> Result<(), String>;
    fn pause(&mut self) -> Result<(), String>;
    fn set_volume(&mut self, percent: u8) -> Result<(), String>;
}

/// Placeholder implementation: every call reports the service as missing.
/// The worker still replies and acks, so users get an answer instead of
/// silence.
#[derive(Debug, Default)]
pub struct UnconfiguredMusic;

impl MusicApi for UnconfiguredMusic {
    fn ensure_active_device(&mut self) -> Result<(), String> {
        Err("music service not configured".to_string())
    }
    fn now_playing(&mut self) -> Result<Option<NowPlaying>, String> {
        Err("music service not configured".to_string())
    }
    fn upcoming(&mut self, _limit: usize) -> Result<(Option<String>, Vec<String>), String> {
        Err("music service not configured".to_string())
    }
    fn enqueue_track(&mut self, _query: &str) -> Result<Option<String>, String> {
        Err("music service not configured".to_string())
    }
    fn skip(&mut self) -> Result<(), String> {
        Err("music service not configured".to_string())
    }
    fn play(&mut self) -> Result<(), String> {
        Err("music service not configured".to_string())
    }
    fn pause(&mut self) -> Result<(), String> {
        Err("music service not configured".to_string())
    }
    fn set_volume(&mut self, _percent: u8) -> Result<(), String> {
        Err("music service not configured".to_string())
    }
}

fn clamp_i64(n: i64, lo: i64, hi: i64) -> i64 {
    n.max(lo).min(hi)
}

/// Map one task to user-facing messages plus an ok/error status.
pub fn handle_task(api: &mut dyn MusicApi, action: &str, args: &str) -> (Vec<String>, bool) {
    let action = action.trim().to_ascii_lowercase();
    let args = args.trim();

    match action.as_str() {
        "np" => match api.now_playing() {
            Ok(None) => (vec!["🎵 Nothing is currently playing.".to_string()], true),
            Ok(Some(np)) => match np.url {
                Some(url) => (vec![format!("🎶 Now playing: {} — {}", np.title, url)], true),
                None => (vec![format!("🎶 Now playing: {}", np.title)], true),
            },
            Err(e) => (vec![format!("⚠️ {}", e)], false),
        },
        "queue" => {
            let limit = args
                .parse::<i64>()
                .map(|n| clamp_i64(n, 1, 20) as usize)
                .unwrap_or(5);
            match api.upcoming(limit) {
                Ok((None, up)) if up.is_empty() => (
                    vec!["🎵 Nothing is currently playing (or queue not available).".to_string()],
                    true,
                ),
                Ok((now, up)) if up.is_empty() => match now {
                    Some(n) => (
                        vec![format!("🎶 Now playing: {} (queue list not available)", n)],
                        true,
                    ),
                    None => (vec!["Queue list not available.".to_string()], true),
                },
                Ok((now, up)) => {
                    let mut parts =
                        vec![format!("🎶 Now: {}", now.unwrap_or_else(|| "(unknown)".to_string()))];
                    for (i, title) in up.iter().enumerate() {
                        parts.push(format!("{}) {}", i + 1, title));
                    }
                    (vec![parts.join(" | ")], true)
                }
                Err(e) => (vec![format!("⚠️ {}", e)], false),
            }
        }
        "sr" => {
            if args.is_empty() {
                return (vec!["Usage: sr <song name or link>".to_string()], true);
            }
            if let Err(e) = api.ensure_active_device() {
                return (vec![format!("⚠️ {}", e)], false);
            }
            match api.enqueue_track(args) {
                Ok(None) => (vec!["❌ Couldn't find that track.".to_string()], true),
                Ok(Some(track)) => (vec![format!("✅ Queued: {}", track)], true),
                Err(e) => (vec![format!("❌ {}", e)], false),
            }
        }
        "skip" => match api.skip() {
            Ok(()) => (vec!["⏭️ Skipped.".to_string()], true),
            Err(e) => (vec![format!("❌ {}", e)], false),
        },
        "play" => match api.play() {
            Ok(()) => (vec!["▶️ Playback started.".to_string()], true),
            Err(e) => (vec![format!("❌ {}", e)], false),
        },
        "pause" => match api.pause() {
            Ok(()) => (vec!["⏸️ Paused.".to_string()], true),
            Err(e) => (vec![format!("❌ {}", e)], false),
        },
        "vol" => match args.parse::<i64>() {
            Ok(v) => {
                let v = clamp_i64(v, 0, 100) as u8;
                match api.set_volume(v) {
                    Ok(()) => (vec![format!("🔊 Volume set to {}%.", v)], true),
                    Err(e) => (vec![format!("❌ {}", e)], false),
                }
            }
            Err(_) => (vec!["Usage: vol <0-100>".to_string()], true),
        },
        other => (vec![format!("⚠️ Unknown action: {}", other)], false),
    }
}

/// Serve one batch of inbox tasks. Returns how many were handled.
pub fn process_batch(bus: &WorkerBus, tasks: &[Value], api: &mut dyn MusicApi) -> usize {
    let mut handled = 0;
    for task in tasks {
        if task.get("type").and_then(|v| v.as_str()).unwrap_or("").to_ascii_lowercase() != "task" {
            continue;
        }
        let task_id = task
            .get("task_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if task_id.is_empty() {
            continue;
        }
        handled += 1;

        let action = task.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let args = task.get("args").and_then(|v| v.as_str()).unwrap_or("");
        let (messages, ok) = handle_task(api, action, args);

        let ts = now_ts();
        bus.send_reply(&WorkerReply {
            task_id: task_id.clone(),
            ts,
            messages: messages.clone(),
            ..WorkerReply::default()
        });
        bus.send_ack(&WorkerAck {
            task_id,
            ts,
            status: if ok { "ok".to_string() } else { "error".to_string() },
            error: if ok { None } else { messages.first().cloned() },
            ..WorkerAck::default()
        });
    }
    handled
}

/// Active/standby worker loop. `make_api` is invoked once per term of
/// leadership so the external client is only initialised where it will be
/// used.
pub async fn run(
    root: &Path,
    mut make_api: Box<dyn FnMut() -> Box<dyn MusicApi> + Send>,
) -> Result<(), String> {
    let layout = Layout::new(root);
    let mut bus = WorkerBus::open(&layout, "music")?;
    let state_dir = layout.worker_state_dir("music");

    let instance = std::env::var("CHAT_SUPERVISOR_INSTANCE").unwrap_or_else(|_| "0".to_string());
    let role = match std::env::var("WORKER_ROLE").ok().as_deref() {
        Some("primary") => "primary".to_string(),
        Some("secondary") => "secondary".to_string(),
        _ => {
            if instance == "0" { "primary".to_string() } else { "secondary".to_string() }
        }
    };

    let lock_ttl = env_secs("WORKER_LOCK_TTL_SEC", 8.0);
    let hb_every = env_secs("WORKER_HEARTBEAT_SEC", 1.0);
    let idle = std::time::Duration::from_secs_f64(env_secs("WORKER_POLL_SEC", 0.08));

    let election = LeaderElection::new(
        &state_dir,
        LeaderInfo {
            pid: std::process::id(),
            role: role.clone(),
            instance: instance.clone(),
            started_ms: now_ms(),
        },
        lock_ttl,
    );

    log::info!("[music] role={} instance={} lock_ttl={}s", role, instance, lock_ttl);
    log::info!("[music] inbox={}", bus.inbox.display());

    // Let the primary win clean races on shared startup.
    if role == "secondary" {
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    }

    let mut is_leader = false;
    let mut last_hb = std::time::Instant::now();
    let mut api: Option<Box<dyn MusicApi>> = None;
    let mut logged_standby = false;

    loop {
        if !is_leader {
            if election.try_acquire() {
                is_leader = true;
                logged_standby = false;
                log::info!("[music] LEADER (active) — music API enabled");
                api = Some(make_api());
                election.heartbeat();
                last_hb = std::time::Instant::now();
            } else {
                if !logged_standby {
                    log::info!("[music] standby — waiting for leadership");
                    logged_standby = true;
                }
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                continue;
            }
        }

        if last_hb.elapsed().as_secs_f64() >= hb_every {
            election.heartbeat();
            last_hb = std::time::Instant::now();
        }

        // Someone stole the lock (split brain): demote.
        if !election.still_leader() {
            is_leader = false;
            api = None;
            log::warn!("[music] lost leadership — switching to standby");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            continue;
        }

        let Some(api_ref) = api.as_mut() else {
            is_leader = false;
            continue;
        };
        match bus.drain() {
            Ok(tasks) => {
                let handled = process_batch(&bus, &tasks, api_ref.as_mut());
                tokio::time::sleep(poll_sleep(handled > 0, idle)).await;
            }
            Err(e) => {
                log::error!("[music] loop error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Scripted fake standing in for the external client.
    #[derive(Default)]
    struct FakeMusic {
        queued: Vec<String>,
        volume: Option<u8>,
        device_ok: bool,
        playing: Option<NowPlaying>,
    }

    impl MusicApi for FakeMusic {
        fn ensure_active_device(&mut self) -> Result<(), String> {
            if self.device_ok { Ok(()) } else { Err("No device found.".to_string()) }
        }
        fn now_playing(&mut self) -> Result<Option<NowPlaying>, String> {
            Ok(self.playing.clone())
        }
        fn upcoming(&mut self, limit: usize) -> Result<(Option<String>, Vec<String>), String> {
            Ok((
                self.playing.as_ref().map(|p| p.title.clone()),
                self.queued.iter().take(limit).cloned().collect(),
            ))
        }
        fn enqueue_track(&mut self, query: &str) -> Result<Option<String>, String> {
            if query == "missing" {
                return Ok(None);
            }
            self.queued.push(query.to_string());
            Ok(Some(format!("{} — Artist", query)))
        }
        fn skip(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn play(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn set_volume(&mut self, percent: u8) -> Result<(), String> {
            self.volume = Some(percent);
            Ok(())
        }
    }

    #[test]
    fn np_formats_with_and_without_url() {
        let mut api = FakeMusic::default();
        let (msgs, ok) = handle_task(&mut api, "np", "");
        assert!(ok);
        assert_eq!(msgs[0], "🎵 Nothing is currently playing.");

        api.playing = Some(NowPlaying { title: "Song — Artist".to_string(), url: None });
        let (msgs, _) = handle_task(&mut api, "np", "");
        assert_eq!(msgs[0], "🎶 Now playing: Song — Artist");

        api.playing = Some(NowPlaying {
            title: "Song — Artist".to_string(),
            url: Some("https://example.com/t/1".to_string()),
        });
        let (msgs, _) = handle_task(&mut api, "np", "");
        assert!(msgs[0].contains("https://example.com/t/1"));
    }

    #[test]
    fn sr_requires_args_device_and_match() {
        let mut api = FakeMusic { device_ok: true, ..FakeMusic::default() };

        let (msgs, ok) = handle_task(&mut api, "sr", "");
        assert!(ok);
        assert!(msgs[0].starts_with("Usage:"));

        let (msgs, ok) = handle_task(&mut api, "sr", "missing");
        assert!(ok);
        assert!(msgs[0].contains("Couldn't find"));

        let (msgs, ok) = handle_task(&mut api, "sr", "good song");
        assert!(ok);
        assert!(msgs[0].contains("✅ Queued: good song — Artist"));

        api.device_ok = false;
        let (msgs, ok) = handle_task(&mut api, "sr", "another");
        assert!(!ok);
        assert!(msgs[0].contains("No device found."));
    }

    #[test]
    fn vol_clamps_and_validates() {
        let mut api = FakeMusic { device_ok: true, ..FakeMusic::default() };
        let (msgs, ok) = handle_task(&mut api, "vol", "150");
        assert!(ok);
        assert_eq!(api.volume, Some(100));
        assert!(msgs[0].contains("100%"));

        let (msgs, ok) = handle_task(&mut api, "vol", "loud");
        assert!(ok);
        assert!(msgs[0].starts_with("Usage:"));
    }

    #[test]
    fn queue_lists_up_next() {
        let mut api = FakeMusic {
            playing: Some(NowPlaying { title: "Now".to_string(), url: None }),
            queued: vec!["A".to_string(), "B".to_string()],
            ..FakeMusic::default()
        };
        let (msgs, ok) = handle_task(&mut api, "queue", "");
        assert!(ok);
        assert_eq!(msgs[0], "🎶 Now: Now | 1) A | 2) B");
    }

    #[test]
    fn unknown_action_is_an_error_status() {
        let mut api = FakeMusic::default();
        let (msgs, ok) = handle_task(&mut api, "dance", "");
        assert!(!ok);
        assert!(msgs[0].contains("Unknown action"));
    }

    #[test]
    fn unconfigured_api_still_answers() {
        let mut api = UnconfiguredMusic;
        let (msgs, ok) = handle_task(&mut api, "np", "");
        assert!(!ok);
        assert!(msgs[0].contains("not configured"));
    }

    #[test]
    fn batch_replies_and_acks_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WorkerBus::open_with(
            dir.path().join("music.inbox.jsonl"),
            dir.path().join("music.outbox.jsonl"),
            dir.path().join("music.ack.jsonl"),
            dir.path().join("state"),
        )
        .unwrap();

        let tasks = vec![
            json!({"type": "task", "task_id": "t_1", "action": "skip", "args": ""}),
            json!({"type": "reply", "task_id": "t_x"}),
            json!({"type": "task", "task_id": "t_2", "action": "bogus", "args": ""}),
        ];
        let mut api = FakeMusic { device_ok: true, ..FakeMusic::default() };
        assert_eq!(process_batch(&bus, &tasks, &mut api), 2);

        let (outbox, _) = crate::bus::read_new_jsonl(&bus.outbox, 0);
        let (acks, _) = crate::bus::read_new_jsonl(&bus.ack, 0);
        assert_eq!(outbox.len(), 2);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0]["status"], "ok");
        assert_eq!(acks[1]["status"], "error");
        assert!(acks[1]["error"].as_str().unwrap().contains("Unknown action"));
    }
}
