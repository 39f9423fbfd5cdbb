// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-side session manager: one uniform Session API whether a
//! supervisor daemon is present (remote mode) or the registry is embedded
//! in-process (local mode), plus startup reconciliation of durable rows.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use roostd::config::{default_state_dir, DaemonPaths};
use roostd::error::{ErrorKind, SessionError};
use roostd::fingerprint;
use roostd::pidfile;
use roostd::registry::{Registry, SessionInfo};
use roostd::ring;
use roostd::session::{SessionSpec, Subscription};
use roostd::supervisor::daemon;
use roostd::wire::{IdArgs, OkBody, Op, ResizeArgs, StartArgs, TailArgs, WriteArgs};

use crate::client::{ControlClient, RemoteStream};
use crate::reconcile::{ArtifactHook, ReconcileReport, SUPERVISOR_LOST};
use crate::store::{RowStatus, SessionStore};

/// How long a freshly launched daemon gets to bind its socket.
const LAUNCH_DEADLINE: Duration = Duration::from_secs(5);

/// How long a stale daemon gets to close its socket after a quit request.
const QUIT_DEADLINE: Duration = Duration::from_secs(10);

/// Which implementation backs the facade. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Client of a supervisor daemon; sessions survive server restarts.
    Remote,
    /// Embedded registry; sessions die with this process.
    Local,
}

/// Options for [`SessionManager::connect`].
pub struct ManagerOptions {
    /// State directory shared with the daemon (socket, pid-file, log).
    pub state_dir: PathBuf,
    /// Executable to launch as the daemon; defaults to this binary, whose
    /// fingerprint then matches a daemon spawned from it.
    pub daemon_exe: Option<PathBuf>,
    /// Launch a daemon when none is reachable.
    pub allow_launch: bool,
    /// Fall back to an embedded registry when no daemon can be reached.
    pub allow_local: bool,
    /// Replay ring capacity for local mode.
    pub ring_capacity: usize,
    /// Durable rows, written through on observable transitions.
    pub store: Option<Arc<dyn SessionStore>>,
    /// Workspace artifact re-emitted for each re-adopted session.
    pub artifact: Option<ArtifactHook>,
}

impl ManagerOptions {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            daemon_exe: None,
            allow_launch: true,
            allow_local: true,
            ring_capacity: ring::DEFAULT_CAPACITY,
            store: None,
            artifact: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactHook) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new(default_state_dir())
    }
}

enum Backend {
    Remote(Arc<ControlClient>),
    Local(Arc<Registry>),
}

/// The facade the rest of the server talks to. Safe for concurrent use.
pub struct SessionManager {
    backend: Backend,
    store: Option<Arc<dyn SessionStore>>,
    artifact: Option<ArtifactHook>,
}

impl SessionManager {
    /// Choose a mode and connect, per the startup discipline: prefer a
    /// compatible daemon, replace an incompatible one, launch one when
    /// permitted, and only then fall back to local mode.
    pub async fn connect(opts: ManagerOptions) -> Result<Self, SessionError> {
        let paths = DaemonPaths::under(&opts.state_dir);
        match Self::connect_remote(&opts, &paths).await {
            Ok(client) => {
                info!(socket = %paths.socket.display(), "session manager in remote mode");
                Ok(Self {
                    backend: Backend::Remote(client),
                    store: opts.store,
                    artifact: opts.artifact,
                })
            }
            Err(e) if opts.allow_local => {
                warn!("no supervisor ({e}); entering local mode, sessions will not survive a restart");
                Ok(Self {
                    backend: Backend::Local(Registry::new(opts.ring_capacity)),
                    store: opts.store,
                    artifact: opts.artifact,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_remote(
        opts: &ManagerOptions,
        paths: &DaemonPaths,
    ) -> Result<Arc<ControlClient>, SessionError> {
        let exe = match opts.daemon_exe.clone() {
            Some(exe) => exe,
            None => std::env::current_exe().map_err(|e| {
                SessionError::supervisor_unavailable(format!("no daemon executable: {e}"))
            })?,
        };
        let build = fingerprint::of_file(&exe).map_err(|e| {
            SessionError::supervisor_unavailable(format!(
                "fingerprint {}: {e}",
                exe.display()
            ))
        })?;

        let mut launched = false;
        loop {
            match ControlClient::connect(&paths.socket, &build).await {
                Ok(client) => return Ok(client),
                Err(e) if e.kind == ErrorKind::IncompatibleBuild => {
                    if launched || !opts.allow_launch {
                        return Err(e);
                    }
                    warn!("running supervisor is a different build; asking it to quit");
                    quit_stale_daemon(paths).await?;
                }
                Err(e) => {
                    if launched || !opts.allow_launch {
                        return Err(e);
                    }
                }
            }

            daemon::spawn_detached(&exe, &paths.state_dir)
                .map_err(|e| SessionError::supervisor_unavailable(format!("launch: {e}")))?;
            wait_for_socket(&paths.socket, LAUNCH_DEADLINE).await?;
            launched = true;
        }
    }

    /// Which mode this process ended up in.
    pub fn mode(&self) -> Mode {
        match self.backend {
            Backend::Remote(_) => Mode::Remote,
            Backend::Local(_) => Mode::Local,
        }
    }

    /// Start a session and write the durable row through.
    pub async fn start(&self, spec: SessionSpec) -> Result<SessionInfo, SessionError> {
        let info = match &self.backend {
            Backend::Local(registry) => {
                let session = registry.start(spec)?;
                registry.info(session.id())?
            }
            Backend::Remote(client) => {
                let id = spec.id.clone();
                let args = StartArgs {
                    id: spec.id,
                    argv: spec.argv,
                    cwd: spec.cwd.to_string_lossy().into_owned(),
                    env: spec.env.into_iter().collect(),
                    rows: spec.rows,
                    cols: spec.cols,
                };
                match client.request(Op::Start(args)).await? {
                    OkBody::Started { .. } => {}
                    other => return Err(unexpected_reply("start", &other)),
                }
                self.fetch_info(&id).await?
            }
        };

        if let Some(store) = &self.store {
            log_store_err(store.set_pid(&info.id, info.pid));
            log_store_err(store.set_status(&info.id, RowStatus::Running, None));
        }
        self.spawn_exit_monitor(info.id.clone());
        Ok(info)
    }

    /// Forward bytes to the session's terminal.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<usize, SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.write(id, data).await,
            Backend::Remote(client) => {
                let args = WriteArgs { id: id.to_owned(), data: roostd::wire::encode_data(data) };
                match client.request(Op::Write(args)).await? {
                    OkBody::Written { n } => Ok(n),
                    other => Err(unexpected_reply("write", &other)),
                }
            }
        }
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.resize(id, rows, cols),
            Backend::Remote(client) => {
                let args = ResizeArgs { id: id.to_owned(), rows, cols };
                client.request(Op::Resize(args)).await.map(|_| ())
            }
        }
    }

    pub async fn stop(&self, id: &str) -> Result<(), SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.stop(id),
            Backend::Remote(client) => {
                client.request(Op::Stop(IdArgs { id: id.to_owned() })).await.map(|_| ())
            }
        }
    }

    /// The enriched view of every live session.
    pub async fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        match &self.backend {
            Backend::Local(registry) => Ok(registry.list()),
            Backend::Remote(client) => match client.request(Op::List).await? {
                OkBody::Sessions { sessions } => Ok(sessions),
                other => Err(unexpected_reply("list", &other)),
            },
        }
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo, SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.info(id),
            Backend::Remote(_) => self.fetch_info(id).await,
        }
    }

    /// The most recent output, bounded by `max` bytes.
    pub async fn tail(&self, id: &str, max: usize) -> Result<Vec<u8>, SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.tail(id, max),
            Backend::Remote(client) => {
                let args = TailArgs { id: id.to_owned(), max: Some(max) };
                match client.request(Op::Tail(args)).await? {
                    OkBody::Data { data } => roostd::wire::decode_data(&data),
                    other => Err(unexpected_reply("tail", &other)),
                }
            }
        }
    }

    /// Live output from now on. A session that is unknown or already ended
    /// yields an immediately-closed stream.
    pub async fn subscribe(&self, id: &str) -> Result<OutputStream, SessionError> {
        match &self.backend {
            Backend::Local(registry) => match registry.get(id) {
                Some(session) => Ok(OutputStream(StreamInner::Local(session.subscribe()))),
                None => Ok(OutputStream(StreamInner::Closed)),
            },
            Backend::Remote(client) => {
                Ok(OutputStream(StreamInner::Remote(client.subscribe(id).await?)))
            }
        }
    }

    /// Align durable rows with the live registry. Run once at startup.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SessionError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| SessionError::internal("reconcile requires a session store"))?;

        let rows = store
            .list_active()
            .map_err(|e| SessionError::internal(format!("list active rows: {e}")))?;
        let live: HashMap<String, SessionInfo> =
            self.list().await?.into_iter().map(|info| (info.id.clone(), info)).collect();
        let row_ids: HashSet<String> = rows.iter().map(|r| r.id.clone()).collect();

        let mut report = ReconcileReport::default();
        for row in rows {
            match live.get(&row.id) {
                Some(info) => {
                    log_store_err(store.set_pid(&row.id, info.pid));
                    log_store_err(store.set_status(&row.id, RowStatus::Running, None));
                    if let Some(hook) = &self.artifact {
                        match hook.write_for(&row) {
                            Ok(_) => {}
                            Err(e) => warn!(
                                session = %row.id,
                                "failed to re-emit workspace artifact: {e}"
                            ),
                        }
                    }
                    self.spawn_exit_monitor(row.id.clone());
                    info!(session = %row.id, pid = info.pid, "re-adopted session");
                    report.readopted.push(row.id);
                }
                None => {
                    log_store_err(store.set_status(
                        &row.id,
                        RowStatus::Stopped,
                        Some(SUPERVISOR_LOST),
                    ));
                    info!(session = %row.id, "marked stopped: {SUPERVISOR_LOST}");
                    report.lost.push(row.id);
                }
            }
        }

        for id in live.keys() {
            if !row_ids.contains(id) {
                // Never kill a session this server does not own.
                warn!(session = %id, "orphan session left running");
                report.orphans.push(id.clone());
            }
        }
        report.orphans.sort();
        Ok(report)
    }

    async fn fetch_info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        match &self.backend {
            Backend::Local(registry) => registry.info(id),
            Backend::Remote(client) => {
                match client.request(Op::Get(IdArgs { id: id.to_owned() })).await? {
                    OkBody::Info(info) => Ok(info),
                    other => Err(unexpected_reply("get", &other)),
                }
            }
        }
    }

    /// Keep the durable row honest: mark it stopped when the session ends.
    fn spawn_exit_monitor(&self, id: String) {
        let Some(store) = self.store.clone() else { return };
        match &self.backend {
            Backend::Local(registry) => {
                let Some(session) = registry.get(&id) else { return };
                tokio::spawn(async move {
                    session.done().await;
                    log_store_err(store.set_status(&id, RowStatus::Stopped, None));
                });
            }
            Backend::Remote(client) => {
                let client = Arc::clone(client);
                tokio::spawn(async move {
                    let Ok(mut stream) = client.subscribe(&id).await else { return };
                    while stream.recv().await.is_some() {}
                    log_store_err(store.set_status(&id, RowStatus::Stopped, None));
                });
            }
        }
    }
}

/// Live output for one session, mode-agnostic.
pub struct OutputStream(StreamInner);

enum StreamInner {
    Local(Subscription),
    Remote(RemoteStream),
    Closed,
}

impl OutputStream {
    /// Next payload; `None` once the session ended or the stream was
    /// cancelled.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match &mut self.0 {
            StreamInner::Local(sub) => sub.recv().await,
            StreamInner::Remote(stream) => stream.recv().await,
            StreamInner::Closed => None,
        }
    }

    /// Stop receiving; idempotent.
    pub fn cancel(&self) {
        match &self.0 {
            StreamInner::Local(sub) => sub.cancel(),
            StreamInner::Remote(stream) => stream.cancel(),
            StreamInner::Closed => {}
        }
    }
}

fn unexpected_reply(op: &str, body: &OkBody) -> SessionError {
    SessionError::internal(format!("unexpected {op} reply: {body:?}"))
}

fn log_store_err(result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!("session store update failed: {e}");
    }
}

/// SIGTERM the pid-file's daemon and wait for its socket to close.
async fn quit_stale_daemon(paths: &DaemonPaths) -> Result<(), SessionError> {
    let Some(stale) = pidfile::read(&paths.pid_file) else {
        return Err(SessionError::supervisor_unavailable(
            "incompatible supervisor has no readable pid-file",
        ));
    };
    let _ = nix_kill_term(stale.pid);

    let deadline = tokio::time::Instant::now() + QUIT_DEADLINE;
    while tokio::time::Instant::now() < deadline {
        if !paths.socket.exists() && !pidfile::process_alive(stale.pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(SessionError::supervisor_unavailable(format!(
        "stale supervisor (pid {}) did not exit within {QUIT_DEADLINE:?}",
        stale.pid
    )))
}

fn nix_kill_term(pid: i32) -> std::io::Result<()> {
    // Graceful by contract: SIGTERM never takes the daemon's sessions down.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

async fn wait_for_socket(socket: &Path, deadline: Duration) -> Result<(), SessionError> {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(SessionError::supervisor_unavailable(format!(
        "daemon socket {} did not appear within {deadline:?}",
        socket.display()
    )))
}
