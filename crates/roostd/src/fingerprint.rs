// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build fingerprints: a truncated hash of an executable, used as the
//! compatibility token in the control-socket handshake.
//!
//! The hash of the running binary moves with every build, so protocol
//! drift between a server and a long-lived daemon is caught even when no
//! one remembered to bump the protocol number.

use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length of a rendered fingerprint: 8 bytes of SHA-256, lower hex.
pub const FINGERPRINT_LEN: usize = 16;

/// Fingerprint of an arbitrary file.
pub fn of_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in &digest[..FINGERPRINT_LEN / 2] {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

/// Fingerprint of the currently running executable.
pub fn of_current_exe() -> io::Result<String> {
    of_file(&std::env::current_exe()?)
}

/// Whether a string is a syntactically valid fingerprint.
pub fn is_valid(s: &str) -> bool {
    s.len() == FINGERPRINT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
#[path = "fingerprint_tests.rs"]
mod tests;
