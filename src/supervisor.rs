//! Supervisor: launches, monitors, restarts, and tears down the process
//! tree.
//!
//! Children are sibling binaries of the supervisor executable. Liveness is
//! judged two ways: a child's exit status (crash), and *staleness*: the
//! newest mtime over a set of per-component witness files on the bus. A
//! worker whose inbox keeps moving while its ack file does not is treated as
//! stuck even though the process is alive.
//!
//! Teardown is platform-conditional: on posix every child is started in its
//! own process group and the whole group gets SIGTERM, then SIGKILL after a
//! grace period; on windows `taskkill /T /F` fells the tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{now_iso, now_ms};
use crate::storage::{self, Layout};

/// Parsed CLI surface (flag parsing itself lives in the binary).
#[derive(Debug, Clone)]
pub struct SupervisorArgs {
    pub same_console: bool,
    pub no_servers: bool,
    pub skip_writer: bool,
    pub no_workers: bool,
    pub overlay_port: u16,
    pub manager_port: u16,
    pub restart_stale: bool,
    pub stale_services: f64,
    pub stale_workers: f64,
    pub check_every: f64,
    pub status_every: f64,
    pub allow_duplicate_inbox: bool,
    pub os: OsMode,
}

impl Default for SupervisorArgs {
    fn default() -> Self {
        SupervisorArgs {
            same_console: false,
            no_servers: false,
            skip_writer: false,
            no_workers: false,
            overlay_port: 8080,
            manager_port: 8788,
            restart_stale: false,
            stale_services: 45.0,
            stale_workers: 60.0,
            check_every: 0.5,
            status_every: 2.0,
            allow_duplicate_inbox: false,
            os: OsMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsMode {
    Auto,
    Windows,
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl OsMode {
    pub fn resolve(self) -> Platform {
        match self {
            OsMode::Windows => Platform::Windows,
            OsMode::Mac => Platform::Posix,
            OsMode::Auto => {
                if cfg!(windows) { Platform::Windows } else { Platform::Posix }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcSpec {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub restart: bool,
    pub max_restarts: usize,
    pub restart_window_sec: f64,
    pub backoff: Duration,
}

impl ProcSpec {
    fn new(name: &str, cmd: Vec<String>, cwd: PathBuf) -> ProcSpec {
        ProcSpec {
            name: name.to_string(),
            cmd,
            cwd,
            env: Vec::new(),
            restart: true,
            max_restarts: 30,
            restart_window_sec: 300.0,
            backoff: Duration::from_secs(1),
        }
    }
}

struct ProcState {
    spec: ProcSpec,
    child: Option<tokio::process::Child>,
    pid: Option<u32>,
    start_ts: f64,
    restarts: Vec<f64>,
    last_restart_reason: String,
}

fn nowf() -> f64 {
    now_ms() as f64 / 1000.0
}

/// Sliding-window restart budget. Returns whether another restart is
/// allowed, pruning entries older than the window.
fn restart_allowed(restarts: &mut Vec<f64>, now: f64, max: usize, window_sec: f64) -> bool {
    restarts.retain(|t| now - *t <= window_sec);
    restarts.len() < max
}

fn port_in_use(port: u16) -> bool {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_ok()
}

/// Path to a sibling binary of the currently running executable.
fn sibling_binary(name: &str) -> String {
    let file = if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join(&file)))
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(file)
}

/// Bot id → worker binary shipped with this crate.
fn worker_binary(bot_id: &str) -> Option<&'static str> {
    match bot_id {
        "gamble" => Some("chathub-gamble-worker"),
        "music" => Some("chathub-music-worker"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct WorkerMeta {
    inbox: PathBuf,
    outbox: PathBuf,
    ack: PathBuf,
}

pub struct Supervisor {
    layout: Layout,
    cfg: Config,
    args: SupervisorArgs,
    platform: Platform,
    procs: Vec<ProcState>,
    worker_meta: HashMap<String, WorkerMeta>,
    status_path: PathBuf,
    last_seen_activity: HashMap<String, f64>,
}

impl Supervisor {
    pub fn new(root: &Path, args: SupervisorArgs) -> Result<Supervisor, String> {
        let layout = Layout::new(root);
        let cfg = Config::load(&layout.config_path())?;
        storage::ensure_file(&layout.events_inbox()).map_err(|e| e.to_string())?;
        storage::ensure_file(&layout.replies_outbox()).map_err(|e| e.to_string())?;
        let platform = args.os.resolve();
        Ok(Supervisor {
            status_path: layout.state_dir.join("supervisor_status.json"),
            layout,
            cfg,
            args,
            platform,
            procs: Vec::new(),
            worker_meta: HashMap::new(),
            last_seen_activity: HashMap::new(),
        })
    }

    fn add(&mut self, spec: ProcSpec) {
        self.procs.push(ProcState {
            spec,
            child: None,
            pid: None,
            start_ts: 0.0,
            restarts: Vec::new(),
            last_restart_reason: String::new(),
        });
    }

    /// Build the process list: aux servers, the chat-feed writer, the three
    /// services, then workers (with active/standby fan-out).
    pub fn build(&mut self) {
        let root = self.layout.root.clone();

        if !self.args.no_servers {
            for server in self.cfg.servers.clone() {
                if server.cmd.is_empty() {
                    continue;
                }
                // CLI port flags override the two well-known servers.
                let port = match server.name.as_str() {
                    "overlay" => self.args.overlay_port,
                    "manager" => self.args.manager_port,
                    _ => server.port,
                };
                if port != 0 && port_in_use(port) {
                    log::info!(
                        "[supervisor] port {} already in use; not starting {}",
                        port,
                        server.name
                    );
                    continue;
                }
                let cmd: Vec<String> = server
                    .cmd
                    .iter()
                    .map(|a| a.replace("{port}", &port.to_string()))
                    .collect();
                let cwd = if server.dir.is_empty() {
                    root.clone()
                } else {
                    self.layout.resolve_from_root(&server.dir)
                };
                self.add(ProcSpec::new(&format!("http.{}:{}", server.name, port), cmd, cwd));
            }
        }

        if !self.args.skip_writer && !self.cfg.writer.cmd.is_empty() {
            let writer = self.cfg.writer.clone();
            let cwd = if writer.dir.is_empty() {
                root.clone()
            } else {
                self.layout.resolve_from_root(&writer.dir)
            };
            self.add(ProcSpec::new("ChatWriter", writer.cmd, cwd));
        }

        let root_arg = root.to_string_lossy().into_owned();
        for (name, binary) in [
            ("CM.ingestor", "chathub-ingestor"),
            ("CM.router_bank", "chathub-router"),
            ("CM.emitter", "chathub-emitter"),
        ] {
            self.add(ProcSpec::new(
                name,
                vec![sibling_binary(binary), "--root".to_string(), root_arg.clone()],
                root.clone(),
            ));
        }

        if self.args.no_workers {
            return;
        }

        for bot in self.cfg.enabled_bots() {
            let Some(binary) = worker_binary(&bot.id) else {
                log::warn!("[supervisor] no worker binary for bot id '{}'", bot.id);
                continue;
            };

            let ha = bot.ha.trim().to_ascii_lowercase();
            let cfg_instances = bot.instances.clamp(1, 16) as usize;
            // Only one reader per inbox unless leader election (or an
            // explicit override) makes duplicates safe.
            let instances = if cfg_instances > 1 {
                if ha == "active_standby" || self.args.allow_duplicate_inbox {
                    cfg_instances
                } else {
                    log::warn!(
                        "[supervisor] '{}' wants {} instances without HA; starting 1 to prevent duplicate dispatch",
                        bot.id,
                        cfg_instances
                    );
                    1
                }
            } else {
                1
            };

            let meta = WorkerMeta {
                inbox: self.layout.resolve_relative(&bot.inbox),
                outbox: self.layout.resolve_relative(&bot.outbox),
                ack: self.layout.resolve_relative(&bot.ack),
            };
            for p in [&meta.inbox, &meta.outbox, &meta.ack] {
                let _ = storage::ensure_file(p);
            }
            self.worker_meta.insert(bot.id.clone(), meta.clone());

            let worker_dir = self.layout.worker_dir(&bot.id);
            let _ = storage::ensure_dir(&worker_dir);

            for i in 0..instances {
                let mut spec = ProcSpec::new(
                    &format!("W.{}#{}", bot.id, i),
                    vec![sibling_binary(binary), "--root".to_string(), root_arg.clone()],
                    worker_dir.clone(),
                );
                spec.env = vec![
                    ("CHAT_SUPERVISOR_BOT_ID".to_string(), bot.id.clone()),
                    ("CHAT_SUPERVISOR_INSTANCE".to_string(), i.to_string()),
                    ("BUS_INBOX".to_string(), meta.inbox.to_string_lossy().into_owned()),
                    ("BUS_OUTBOX".to_string(), meta.outbox.to_string_lossy().into_owned()),
                    ("BUS_ACK".to_string(), meta.ack.to_string_lossy().into_owned()),
                ];
                if ha == "active_standby" {
                    let role = if i == 0 { "primary" } else { "secondary" };
                    spec.env.push(("WORKER_ROLE".to_string(), role.to_string()));
                }
                self.add(spec);
            }
        }
    }

    pub fn proc_names(&self) -> Vec<String> {
        self.procs.iter().map(|p| p.spec.name.clone()).collect()
    }

    // ---------- process control ----------

    fn start(state: &mut ProcState, platform: Platform, same_console: bool) {
        let spec = &state.spec;
        let _ = storage::ensure_dir(&spec.cwd);

        log::info!("[supervisor] START {}", spec.name);
        log::debug!("[supervisor]   cwd: {}", spec.cwd.display());
        log::debug!("[supervisor]   cmd: {}", spec.cmd.join(" "));

        let mut cmd = tokio::process::Command::new(&spec.cmd[0]);
        cmd.args(&spec.cmd[1..]).current_dir(&spec.cwd);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        #[cfg(unix)]
        {
            // Own process group: group signals reach grandchildren too.
            if platform == Platform::Posix {
                cmd.process_group(0);
            }
        }
        #[cfg(windows)]
        {
            const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
            if platform == Platform::Windows && !same_console {
                cmd.creation_flags(CREATE_NEW_CONSOLE);
            }
        }
        #[cfg(not(windows))]
        let _ = same_console;

        match cmd.spawn() {
            Ok(child) => {
                state.pid = child.id();
                state.child = Some(child);
                state.start_ts = nowf();
            }
            Err(e) => {
                log::error!("[supervisor] spawn {} failed: {}", spec.name, e);
                state.child = None;
                state.pid = None;
            }
        }
    }

    fn signal_group(pid: u32, platform: Platform, force: bool) {
        match platform {
            Platform::Posix => {
                #[cfg(unix)]
                {
                    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
                    unsafe {
                        libc::kill(-(pid as i32), sig);
                    }
                }
                #[cfg(not(unix))]
                let _ = (pid, force);
            }
            Platform::Windows => {
                // taskkill /T fells the whole tree; /F because windows has no
                // graceful group signal worth waiting for.
                let _ = std::process::Command::new("taskkill")
                    .args(["/PID", &pid.to_string(), "/T", "/F"])
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status();
            }
        }
    }

    fn is_running(state: &mut ProcState) -> Option<i32> {
        // Returns Some(exit_code) when the child has exited.
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(_) => Some(-1),
        }
    }

    async fn stop_one(state: &mut ProcState, platform: Platform) {
        if state.child.is_none() {
            return;
        }
        let Some(pid) = state.pid else { return };
        if Self::is_running(state).is_some() {
            return;
        }
        Self::signal_group(pid, platform, false);
        // ≤2 s grace, then the hard kill.
        for _ in 0..20 {
            if Self::is_running(state).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Self::signal_group(pid, platform, true);
        if let Some(child) = state.child.as_mut() {
            let _ = child.kill().await;
        }
    }

    async fn restart_one(&mut self, idx: usize, reason: &str) {
        let platform = self.platform;
        let same_console = self.args.same_console;
        let state = &mut self.procs[idx];
        if !state.spec.restart {
            return;
        }
        let now = nowf();
        if !restart_allowed(
            &mut state.restarts,
            now,
            state.spec.max_restarts,
            state.spec.restart_window_sec,
        ) {
            log::error!(
                "[supervisor] RESTART-LIMIT {} (not restarting). reason={}",
                state.spec.name,
                reason
            );
            return;
        }
        state.restarts.push(now);
        state.last_restart_reason = reason.to_string();
        log::warn!("[supervisor] RESTART {} reason={}", state.spec.name, reason);

        Self::stop_one(state, platform).await;
        let backoff = state.spec.backoff;
        tokio::time::sleep(backoff).await;
        Self::start(state, platform, same_console);
    }

    // ---------- staleness ----------

    fn witness_files(&self) -> HashMap<String, Vec<PathBuf>> {
        let mut sources = HashMap::new();
        sources.insert("CM.ingestor".to_string(), vec![self.layout.events_inbox()]);

        let mut router: Vec<PathBuf> = vec![self.layout.replies_outbox()];
        router.extend(self.worker_meta.values().map(|m| m.inbox.clone()));
        sources.insert("CM.router_bank".to_string(), router);

        let overlay = &self.cfg.overlay_fallback;
        let mut emitter = Vec::new();
        if !overlay.chat_file.trim().is_empty() {
            emitter.push(self.layout.resolve_from_root(overlay.chat_file.trim()));
        }
        if !overlay.overlay_events_file.trim().is_empty() {
            emitter.push(self.layout.resolve_from_root(overlay.overlay_events_file.trim()));
        }
        sources.insert("CM.emitter".to_string(), emitter);

        for (bot_id, meta) in &self.worker_meta {
            sources.insert(
                format!("W.{}", bot_id),
                vec![meta.ack.clone(), meta.outbox.clone()],
            );
        }
        sources
    }

    fn newest_mtime(paths: &[PathBuf]) -> f64 {
        paths.iter().map(|p| storage::mtime_secs(p)).fold(0.0, f64::max)
    }

    /// Stale iff the newest witness file stopped moving for longer than the
    /// threshold. Components with no witness activity yet are never stale.
    fn is_stale(&mut self, key: &str, paths: &[PathBuf], stale_sec: f64) -> bool {
        let newest = Self::newest_mtime(paths);
        if newest <= 0.0 {
            return false;
        }
        self.last_seen_activity.insert(key.to_string(), newest);
        nowf() - newest > stale_sec
    }

    /// A worker whose inbox outpaces its ack for too long is stuck even if
    /// the process is alive.
    fn worker_backlog_stale(meta: &WorkerMeta, stale_sec: f64) -> bool {
        let inbox_m = storage::mtime_secs(&meta.inbox);
        let ack_m = storage::mtime_secs(&meta.ack);
        if inbox_m <= 0.0 || inbox_m <= ack_m {
            return false;
        }
        nowf() - inbox_m > stale_sec
    }

    fn write_status(&mut self) {
        let mut procs = serde_json::Map::new();
        for state in &mut self.procs {
            let alive = state.child.is_some() && Self::is_running(state).is_none();
            procs.insert(
                state.spec.name.clone(),
                serde_json::json!({
                    "alive": alive,
                    "pid": state.pid,
                    "start_ts": state.start_ts,
                    "restarts_in_window": state.restarts.len(),
                    "last_restart_reason": state.last_restart_reason,
                    "cmd": state.spec.cmd,
                    "cwd": state.spec.cwd.to_string_lossy(),
                }),
            );
        }
        let status = serde_json::json!({
            "ts": now_ms(),
            "at": now_iso(),
            "procs": procs,
            "activity": self.last_seen_activity,
        });
        if let Err(e) = storage::atomic_write_json(&self.status_path, &status) {
            log::error!("[supervisor] status write failed: {}", e);
        }
    }

    // ---------- lifecycle ----------

    pub async fn stop_all(&mut self) {
        log::info!("[supervisor] stopping all processes");
        let platform = self.platform;
        for state in &mut self.procs {
            if let Some(pid) = state.pid {
                if Self::is_running(state).is_none() {
                    Self::signal_group(pid, platform, false);
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for state in &mut self.procs {
            if let Some(pid) = state.pid {
                if Self::is_running(state).is_none() {
                    Self::signal_group(pid, platform, true);
                    if let Some(child) = state.child.as_mut() {
                        let _ = child.kill().await;
                    }
                }
            }
        }
        self.write_status();
        log::info!("[supervisor] stopped");
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> i32 {
        let platform = self.platform;
        let same_console = self.args.same_console;
        for state in &mut self.procs {
            Self::start(state, platform, same_console);
        }

        let mut last_status = 0.0f64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(self.args.check_every.max(0.1))) => {}
            }

            // Crash detection.
            for idx in 0..self.procs.len() {
                if let Some(code) = Self::is_running(&mut self.procs[idx]) {
                    if self.procs[idx].child.is_some() {
                        let reason = format!("exit_code={}", code);
                        self.procs[idx].child = None;
                        self.restart_one(idx, &reason).await;
                    }
                }
            }

            // Staleness restarts (opt-in).
            if self.args.restart_stale {
                let sources = self.witness_files();
                for svc in ["CM.ingestor", "CM.router_bank", "CM.emitter"] {
                    let Some(paths) = sources.get(svc).cloned() else { continue };
                    if self.is_stale(svc, &paths, self.args.stale_services) {
                        if let Some(idx) = self.procs.iter().position(|p| p.spec.name == svc) {
                            let reason = format!("stale>{}s", self.args.stale_services);
                            self.restart_one(idx, &reason).await;
                        }
                    }
                }
                let stale_workers = self.args.stale_workers;
                let stuck: Vec<String> = self
                    .worker_meta
                    .iter()
                    .filter(|(_, meta)| Self::worker_backlog_stale(meta, stale_workers))
                    .map(|(bot_id, _)| bot_id.clone())
                    .collect();
                for bot_id in stuck {
                    let prefix = format!("W.{}#", bot_id);
                    let idxs: Vec<usize> = self
                        .procs
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.spec.name.starts_with(&prefix))
                        .map(|(i, _)| i)
                        .collect();
                    for idx in idxs {
                        let reason = format!("backlog_stale>{}s", stale_workers);
                        self.restart_one(idx, &reason).await;
                    }
                }
            }

            let now = nowf();
            if now - last_status >= self.args.status_every {
                self.write_status();
                last_status = now;
            }
        }

        self.stop_all().await;
        0
    }
}
