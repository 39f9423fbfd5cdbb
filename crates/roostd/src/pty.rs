// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY allocation and nonblocking async I/O on the primary side.
//!
//! `spawn` forks the child onto a fresh pseudo-terminal in its own session
//! (and therefore its own process group) with the slave as stdin, stdout,
//! and stderr. The parent keeps the primary side wrapped in a tokio
//! [`AsyncFd`] so a single reader task and serialized writers can share it.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// What to launch on the new terminal.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Program and arguments; must be non-empty.
    pub argv: Vec<String>,
    /// Working directory for the child. Must exist.
    pub cwd: PathBuf,
    /// Environment entries applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

/// Owned primary side of a session's pseudo-terminal.
#[derive(Debug)]
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

/// Fork a child onto a new PTY and return the primary side plus the PID.
///
/// The child becomes a session leader with the slave as its controlling
/// terminal, changes into `spec.cwd`, applies `spec.env`, and execs
/// `spec.argv`. If the exec fails the child exits 127 without unwinding
/// into the parent's state.
// forkpty requires unsafe: the post-fork child is partially initialized
#[allow(unsafe_code)]
pub fn spawn(spec: &ChildSpec) -> anyhow::Result<(PtyMaster, Pid)> {
    use anyhow::Context;

    if spec.argv.is_empty() {
        anyhow::bail!("empty argv");
    }
    if !spec.cwd.is_dir() {
        anyhow::bail!("working directory {} does not exist", spec.cwd.display());
    }

    let winsize = Winsize {
        ws_row: spec.rows,
        ws_col: spec.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: forkpty is unsafe because the child is in a
    // partially-initialized state after fork. The child branch below only
    // calls async-signal-safe-adjacent setup and then execs or _exits.
    let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

    match result {
        ForkptyResult::Child => {
            for (key, value) in &spec.env {
                std::env::set_var(key, value);
            }
            if std::env::var_os("TERM").is_none() {
                std::env::set_var("TERM", "xterm-256color");
            }
            if nix::unistd::chdir(&spec.cwd).is_err() {
                // SAFETY: plain _exit in the forked child; no unwinding.
                unsafe { libc::_exit(126) }
            }
            let args: Vec<CString> = match spec
                .argv
                .iter()
                .map(|s| CString::new(s.as_bytes()))
                .collect::<Result<_, _>>()
            {
                Ok(args) => args,
                // SAFETY: as above.
                Err(_) => unsafe { libc::_exit(127) },
            };
            let _ = execvp(&args[0], &args);
            // SAFETY: exec failed; leave without running parent atexit state.
            unsafe { libc::_exit(127) }
        }
        ForkptyResult::Parent { child, master } => {
            set_nonblocking(&master)?;
            let fd = AsyncFd::new(master).context("AsyncFd::new failed")?;
            Ok((PtyMaster { fd }, child))
        }
    }
}

impl PtyMaster {
    /// Read one chunk from the primary side.
    ///
    /// Returns `Ok(0)` on end of terminal: plain EOF, or the EIO the kernel
    /// reports once the slave side is fully closed.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| nix::unistd::read(inner.get_ref(), buf).map_err(io_err)) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, retrying partial writes until drained.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.fd.writable().await?;
            match guard
                .try_io(|inner| nix::unistd::write(inner.get_ref(), &data[offset..]).map_err(io_err))
            {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the terminal window size; the kernel delivers SIGWINCH.
    // TIOCSWINSZ requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl on a PTY primary fd
        // and `ws` is fully initialized.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Block until the child exits; used via `spawn_blocking`.
pub fn wait_child(pid: Pid) -> ExitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return ExitStatus { code: Some(code), signal: None };
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return ExitStatus { code: None, signal: Some(sig as i32) };
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => {
                // ECHILD: reaped elsewhere; report an unknown exit.
                return ExitStatus { code: None, signal: None };
            }
        }
    }
}

// O_NONBLOCK via fcntl; required for AsyncFd readiness semantics
#[allow(unsafe_code)]
fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl F_GETFL/F_SETFL on an owned, open descriptor.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
