// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: detachment, pid-file, socket hygiene, and the
//! SIGTERM discipline that leaves sessions running across restarts.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, DaemonPaths};
use crate::fingerprint;
use crate::pidfile;
use crate::registry::Registry;
use crate::supervisor::Supervisor;

/// Environment marker set on a detached daemon process.
pub const DAEMON_ENV: &str = "ROOSTD_DAEMON";

/// Whether this process was launched as the detached daemon.
pub fn is_daemon_process() -> bool {
    std::env::var_os(DAEMON_ENV).is_some()
}

/// Run the supervisor until SIGTERM/SIGINT.
///
/// On shutdown the control socket and pid-file are removed but sessions
/// are deliberately left running; a restarted server reconnects to a new
/// daemon and reconciles. Only SIGKILL or a reboot takes sessions down.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let paths = config.paths();
    std::fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create state dir {}", paths.state_dir.display()))?;

    if let Some(existing) = pidfile::read_live(&paths.pid_file) {
        anyhow::bail!("supervisor already running (pid {})", existing.pid);
    }

    if !config.foreground {
        // Detach from the launcher's session. Fails with EPERM when we are
        // already a process-group leader (interactive shells); that only
        // happens in hand-launched runs where detachment does not matter.
        let _ = nix::unistd::setsid();
    }

    let build = fingerprint::of_current_exe().context("fingerprint own executable")?;
    pidfile::write(&paths.pid_file, std::process::id() as i32, &build)
        .with_context(|| format!("write pid-file {}", paths.pid_file.display()))?;

    // A stale socket from a SIGKILLed daemon would block the bind.
    let _ = std::fs::remove_file(&paths.socket);
    let listener = UnixListener::bind(&paths.socket)
        .with_context(|| format!("bind control socket {}", paths.socket.display()))?;
    std::fs::set_permissions(&paths.socket, std::fs::Permissions::from_mode(0o600))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let registry = Registry::new(config.ring_capacity);
    let supervisor = Supervisor::new(registry, build.clone(), shutdown);
    info!(
        socket = %paths.socket.display(),
        build = %build,
        ring_capacity = config.ring_capacity,
        "supervisor accepting control connections"
    );
    supervisor.serve(listener).await;

    let _ = std::fs::remove_file(&paths.socket);
    let _ = pidfile::remove(&paths.pid_file);
    info!("supervisor shutdown complete; sessions left running");
    Ok(())
}

/// Entry point for host binaries that embed the runtime: if this process
/// carries the daemon marker, run the supervisor configured from the
/// environment and return `true` once it exits.
pub async fn run_if_daemon() -> anyhow::Result<bool> {
    if !is_daemon_process() {
        return Ok(false);
    }
    let config = Config::try_parse_env()?;
    config.validate()?;
    crate::config::init_tracing(&config);
    run(&config).await?;
    Ok(true)
}

/// Launch a detached supervisor daemon from the given executable.
///
/// Plain process detachment: fresh session (the daemon calls `setsid`
/// itself), stdio redirected to the daemon log, environment marker set.
/// Returns the daemon PID without waiting for it to come up; callers poll
/// the socket.
pub fn spawn_detached(exe: &Path, state_dir: &Path) -> anyhow::Result<i32> {
    let paths = DaemonPaths::under(state_dir);
    std::fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create state dir {}", paths.state_dir.display()))?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)
        .with_context(|| format!("open daemon log {}", paths.log_file.display()))?;

    let child = std::process::Command::new(exe)
        .env(DAEMON_ENV, "1")
        .env("ROOSTD_STATE_DIR", state_dir)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .with_context(|| format!("spawn supervisor {}", exe.display()))?;
    let pid = child.id() as i32;
    info!(pid, exe = %exe.display(), "launched detached supervisor");

    // Reap the daemon if it ever exits while we are still alive, so it
    // never lingers as a zombie child of the server.
    std::thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });

    Ok(pid)
}

/// First SIGTERM/SIGINT triggers graceful shutdown; a second forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
