// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Facade behavior in remote mode, against an in-process supervisor
//! serving the control socket. The supervisor announces this test
//! binary's own fingerprint, which is exactly what the facade computes
//! for its (never-launched) daemon executable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use roost::{ManagerOptions, MemoryStore, Mode, RowStatus, SessionManager, SessionRow};
use roostd::config::DaemonPaths;
use roostd::error::ErrorKind;
use roostd::fingerprint;
use roostd::registry::Registry;
use roostd::session::SessionSpec;
use roostd::supervisor::Supervisor;

struct TestDaemon {
    dir: tempfile::TempDir,
    shutdown: CancellationToken,
}

impl TestDaemon {
    /// Serve a supervisor in-process on a fresh state dir, announcing the
    /// given build fingerprint.
    fn start(build: String) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let paths = DaemonPaths::under(dir.path());
        let listener = UnixListener::bind(&paths.socket)?;
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(Registry::new(65536), build, shutdown.clone());
        tokio::spawn(supervisor.serve(listener));
        Ok(Self { dir, shutdown })
    }

    fn own_build() -> anyhow::Result<String> {
        Ok(fingerprint::of_current_exe()?)
    }

    fn options(&self) -> ManagerOptions {
        let mut opts = ManagerOptions::new(self.dir.path());
        opts.allow_launch = false;
        opts.allow_local = false;
        opts
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sh(id: &str, script: &str) -> SessionSpec {
    SessionSpec {
        id: id.to_owned(),
        argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
        cwd: PathBuf::from("/tmp"),
        env: vec![],
        rows: 40,
        cols: 80,
    }
}

#[tokio::test]
async fn matching_fingerprint_enters_remote_mode() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let manager = SessionManager::connect(daemon.options()).await?;
    assert_eq!(manager.mode(), Mode::Remote);
    assert!(manager.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn remote_session_lifecycle_works_end_to_end() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let manager = SessionManager::connect(daemon.options()).await?;

    let info = manager.start(sh("cat", "exec /bin/cat")).await?;
    assert!(info.pid > 0);
    assert_eq!(manager.list().await?.len(), 1);

    let mut stream = manager.subscribe("cat").await?;
    manager.write("cat", b"remote\n").await?;

    let mut seen = Vec::new();
    let got = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(payload) = stream.recv().await {
            seen.extend_from_slice(&payload);
            if String::from_utf8_lossy(&seen).contains("remote") {
                return true;
            }
        }
        false
    })
    .await?;
    assert!(got, "subscription never carried the echo: {seen:?}");

    let tail = manager.tail("cat", 100_000).await?;
    assert!(String::from_utf8_lossy(&tail).contains("remote"));

    manager.resize("cat", 30, 100).await?;
    assert_eq!(manager.get("cat").await.map(|i| (i.rows, i.cols))?, (30, 100));

    manager.stop("cat").await?;
    let gone = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            if manager.list().await.map(|l| l.is_empty()).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "stopped session never left the list");
    Ok(())
}

#[tokio::test]
async fn remote_rows_transition_to_stopped_on_exit() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let store = Arc::new(MemoryStore::new());
    let workspace = tempfile::tempdir()?;
    store.insert(SessionRow::new("short", workspace.path()));

    let opts = daemon
        .options()
        .with_store(Arc::clone(&store) as Arc<dyn roost::SessionStore>);
    let manager = SessionManager::connect(opts).await?;

    manager.start(sh("short", "sleep 0.3")).await?;
    assert_eq!(store.get("short").map(|r| r.status), Some(RowStatus::Running));

    let stopped = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            if store.get("short").map(|r| r.status) == Some(RowStatus::Stopped) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "durable row never reached stopped");
    Ok(())
}

#[tokio::test]
async fn incompatible_daemon_without_fallback_is_an_error() -> anyhow::Result<()> {
    let daemon = TestDaemon::start("0000000000000000".to_owned())?;
    let err = SessionManager::connect(daemon.options()).await.err();
    assert_eq!(err.map(|e| e.kind), Some(ErrorKind::IncompatibleBuild));
    Ok(())
}

#[tokio::test]
async fn incompatible_daemon_with_local_fallback_enters_local_mode() -> anyhow::Result<()> {
    let daemon = TestDaemon::start("0000000000000000".to_owned())?;
    let mut opts = daemon.options();
    opts.allow_local = true;

    let manager = SessionManager::connect(opts).await?;
    assert_eq!(manager.mode(), Mode::Local);
    Ok(())
}

#[tokio::test]
async fn unknown_ids_surface_not_found_remotely() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let manager = SessionManager::connect(daemon.options()).await?;

    assert_eq!(manager.write("ghost", b"x").await.err().map(|e| e.kind), Some(ErrorKind::NotFound));
    assert_eq!(manager.stop("ghost").await.err().map(|e| e.kind), Some(ErrorKind::NotFound));

    let mut stream = manager.subscribe("ghost").await?;
    assert!(stream.recv().await.is_none(), "unknown session must be a closed stream");
    Ok(())
}

#[tokio::test]
async fn server_restart_readopts_sessions_and_streams_fresh_bytes() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let store = Arc::new(MemoryStore::new());
    let workspace = tempfile::tempdir()?;
    store.insert(SessionRow {
        status: RowStatus::Running,
        ..SessionRow::new("s5", workspace.path())
    });

    // First server lifetime: start the session, then go away.
    let first = SessionManager::connect(daemon.options()).await?;
    let started = first.start(sh("s5", "while :; do printf tick; sleep 0.1; done")).await?;
    drop(first);

    // Second server lifetime: the supervisor kept the session alive.
    let writes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let writes_in_hook = Arc::clone(&writes);
    let hook = roost::ArtifactHook::new("companions.json", move |_: &SessionRow| {
        writes_in_hook.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Some(b"{}".to_vec())
    });
    let opts = daemon
        .options()
        .with_store(Arc::clone(&store) as Arc<dyn roost::SessionStore>)
        .with_artifact(hook);
    let second = SessionManager::connect(opts).await?;

    let report = second.reconcile().await?;
    assert_eq!(report.readopted, vec!["s5".to_owned()]);
    assert!(report.lost.is_empty());

    let info = second.get("s5").await?;
    assert_eq!(info.pid, started.pid, "re-adoption must keep the same child");
    assert_eq!(store.get("s5").and_then(|r| r.pid), Some(started.pid));
    assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(workspace.path().join("companions.json").exists());

    // A fresh subscribe keeps receiving freshly produced bytes.
    let mut stream = second.subscribe("s5").await?;
    let got = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await?;
    assert!(
        got.map(|b| String::from_utf8_lossy(&b).contains("tick")).unwrap_or(false),
        "expected live output after re-adoption"
    );

    second.stop("s5").await?;
    Ok(())
}

#[tokio::test]
async fn remote_reconcile_readopts_live_sessions() -> anyhow::Result<()> {
    let daemon = TestDaemon::start(TestDaemon::own_build()?)?;
    let store = Arc::new(MemoryStore::new());
    let live_ws = tempfile::tempdir()?;
    let lost_ws = tempfile::tempdir()?;
    store.insert(SessionRow {
        status: RowStatus::Running,
        ..SessionRow::new("kept", live_ws.path())
    });
    store.insert(SessionRow {
        status: RowStatus::Running,
        ..SessionRow::new("vanished", lost_ws.path())
    });

    let opts = daemon
        .options()
        .with_store(Arc::clone(&store) as Arc<dyn roost::SessionStore>);
    let manager = SessionManager::connect(opts).await?;
    manager.start(sh("kept", "sleep 30")).await?;

    let report = manager.reconcile().await?;
    assert_eq!(report.readopted, vec!["kept".to_owned()]);
    assert_eq!(report.lost, vec!["vanished".to_owned()]);
    assert_eq!(store.reason("vanished"), Some(roost::SUPERVISOR_LOST.to_owned()));

    manager.stop("kept").await?;
    Ok(())
}
