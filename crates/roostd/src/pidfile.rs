// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon pid-file: two lines of text, the decimal PID and the build
//! fingerprint. Replaced atomically (temp file + rename) so readers never
//! observe a partial write.

use std::io::{self, Write};
use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::fingerprint;

/// Parsed pid-file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    pub pid: i32,
    pub build: String,
}

/// Atomically write the pid-file.
pub fn write(path: &Path, pid: i32, build: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("pid-file path has no parent directory"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    writeln!(tmp, "{pid}")?;
    writeln!(tmp, "{build}")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read and parse the pid-file.
///
/// Returns `None` when the file is missing or does not parse as a PID line
/// followed by a fingerprint line; a stale or corrupt pid-file is treated
/// the same as no pid-file.
pub fn read(path: &Path) -> Option<PidFile> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut lines = text.lines();
    let pid: i32 = lines.next()?.trim().parse().ok()?;
    let build = lines.next()?.trim().to_owned();
    if pid <= 0 || !fingerprint::is_valid(&build) {
        return None;
    }
    Some(PidFile { pid, build })
}

/// Read the pid-file and keep it only if the referenced process is alive.
pub fn read_live(path: &Path) -> Option<PidFile> {
    let parsed = read(path)?;
    process_alive(parsed.pid).then_some(parsed)
}

/// Remove the pid-file, ignoring a missing file.
pub fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Probe a PID with the null signal.
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
#[path = "pidfile_tests.rs"]
mod tests;
