// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One supervised child attached to a pseudo-terminal: bytes in both
//! directions with defined ordering, replay for late subscribers, and a
//! one-shot exit signal.

mod fanout;

pub use fanout::{Fanout, Subscription, SUBSCRIBER_QUEUE};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::error::SessionError;
use crate::pty::{self, ChildSpec, ExitStatus, PtyMaster};

/// Unit of reads, ring insertion, and broadcast.
pub const READ_CHUNK: usize = 32 * 1024;

/// Grace between SIGTERM and SIGKILL on [`Session::stop`].
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// Arguments for starting a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Caller-chosen stable identifier, unique per supervisor.
    pub id: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

/// A running (or recently exited) supervised child.
///
/// Constructed by [`Session::spawn`]; all mutation happens on the internal
/// reader/reaper task and through the serialized write path.
pub struct Session {
    id: String,
    pid: Pid,
    argv: Vec<String>,
    cwd: PathBuf,
    started_at: SystemTime,
    master: PtyMaster,
    /// Serializes all writers so large writes fragment but never interleave.
    write_lock: tokio::sync::Mutex<()>,
    rows: AtomicU16,
    cols: AtomicU16,
    fanout: Arc<Fanout>,
    done: CancellationToken,
    exit: OnceLock<ExitStatus>,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
}

impl Session {
    /// Allocate a PTY, launch the child, and start the reader task.
    ///
    /// Returns once the child is confirmed live and the reader is running.
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: SessionSpec, ring_capacity: usize) -> Result<Arc<Self>, SessionError> {
        let child = ChildSpec {
            argv: spec.argv.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env,
            rows: spec.rows,
            cols: spec.cols,
        };
        let (master, pid) =
            pty::spawn(&child).map_err(|e| SessionError::start_failed(format!("{e:#}")))?;

        if kill(pid, None).is_err() {
            return Err(SessionError::start_failed(format!(
                "child {pid} died before start completed"
            )));
        }

        let session = Arc::new(Self {
            id: spec.id,
            pid,
            argv: spec.argv,
            cwd: spec.cwd,
            started_at: SystemTime::now(),
            master,
            write_lock: tokio::sync::Mutex::new(()),
            rows: AtomicU16::new(spec.rows),
            cols: AtomicU16::new(spec.cols),
            fanout: Fanout::new(ring_capacity),
            done: CancellationToken::new(),
            exit: OnceLock::new(),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(Arc::clone(&session)));
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    /// Start time as seconds since the epoch.
    pub fn started_at_epoch(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }

    /// Current window size as (rows, cols).
    pub fn window_size(&self) -> (u16, u16) {
        (self.rows.load(Ordering::Relaxed), self.cols.load(Ordering::Relaxed))
    }

    /// False once the child has been reaped.
    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Write bytes verbatim to the terminal, retrying partial writes.
    ///
    /// Returns the number of bytes written (always `data.len()` on
    /// success). Fails with `closed` once the session has ended or the
    /// write side is gone; a write failure never tears the session down.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.done.is_cancelled() {
            return Err(SessionError::closed());
        }
        let _guard = self.write_lock.lock().await;
        if self.done.is_cancelled() {
            return Err(SessionError::closed());
        }
        self.master
            .write_all(data)
            .await
            .map_err(|e| {
                debug!(session = %self.id, "pty write failed: {e}");
                SessionError::closed()
            })?;
        Ok(data.len())
    }

    /// Set the terminal window size. Idempotent; last write wins.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if self.done.is_cancelled() {
            return Err(SessionError::closed());
        }
        self.master.resize(rows, cols).map_err(|_| SessionError::closed())?;
        self.rows.store(rows, Ordering::Relaxed);
        self.cols.store(cols, Ordering::Relaxed);
        Ok(())
    }

    /// Subscribe to output published after this call returns.
    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    /// Ring snapshot and a subscription with no gap or overlap between them.
    pub fn subscribe_with_replay(&self) -> (Vec<u8>, Subscription) {
        self.fanout.subscribe_with_replay()
    }

    /// Point-in-time copy of the replay ring.
    pub fn replay(&self) -> Vec<u8> {
        self.fanout.replay()
    }

    /// Copy of at most `max` of the most recent output bytes.
    pub fn tail(&self, max: usize) -> Vec<u8> {
        self.fanout.tail(max)
    }

    /// Total output bytes ever read from the terminal.
    pub fn total_output(&self) -> u64 {
        self.fanout.total_published()
    }

    /// Request termination: SIGTERM to the process group now, SIGKILL
    /// after [`STOP_GRACE`] if the child has not been reaped by then.
    ///
    /// Idempotent; exactly one escalation runs no matter how many callers
    /// race. Returns without waiting for the exit signal.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let group = Pid::from_raw(-self.pid.as_raw());
        let _ = kill(group, Signal::SIGTERM);

        let done = self.done.clone();
        let pid = self.pid.as_raw();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(STOP_GRACE) => {
                    debug!(pid, "stop grace elapsed, sending SIGKILL");
                    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
                }
            }
        });
    }

    /// One-shot exit signal; resolves after the child has been reaped.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.done.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Exit status, available once [`Session::done`] has fired.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get().copied()
    }
}

/// Dedicated reader: the only reader of the primary side.
///
/// Every chunk goes into the ring before it is broadcast. On EOF or read
/// error the task closes all subscribers exactly once, reaps the child on
/// a blocking thread, and fires the exit signal.
async fn read_loop(session: Arc<Session>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match session.master.read_chunk(&mut buf).await {
            Ok(0) => break,
            Ok(n) => session.fanout.publish(&buf[..n]),
            Err(e) => {
                debug!(session = %session.id, "pty read error: {e}");
                break;
            }
        }
    }

    session.fanout.close();

    let pid = session.pid;
    let status = match tokio::task::spawn_blocking(move || pty::wait_child(pid)).await {
        Ok(status) => status,
        Err(e) => {
            debug!(session = %session.id, "reaper join error: {e}");
            ExitStatus { code: None, signal: None }
        }
    };

    let _ = session.exit.set(status);
    session.stopped.store(true, Ordering::Release);
    session.done.cancel();
    debug!(
        session = %session.id,
        code = ?status.code,
        signal = ?status.signal,
        "session exited"
    );
}
