// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced on the control protocol and at the facade API.
///
/// The serialized (snake_case) names are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not allocate a terminal or exec the program.
    StartFailed,
    /// Caller reused a live session identifier.
    IdInUse,
    /// No session with that identifier.
    NotFound,
    /// Session ended before or during the operation.
    Closed,
    /// Control-socket handshake fingerprint mismatch.
    IncompatibleBuild,
    /// No supervisor reachable and local mode not permitted.
    SupervisorUnavailable,
    /// Request verb not understood by this daemon.
    UnknownOp,
    /// Unexpected condition; the operation was abandoned and may be retried.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartFailed => "start_failed",
            Self::IdInUse => "id_in_use",
            Self::NotFound => "not_found",
            Self::Closed => "closed",
            Self::IncompatibleBuild => "incompatible_build",
            Self::SupervisorUnavailable => "supervisor_unavailable",
            Self::UnknownOp => "unknown_op",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type carried across the session runtime's library seams.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {msg}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, msg: msg.into() }
    }

    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StartFailed, msg)
    }

    pub fn id_in_use(id: &str) -> Self {
        Self::new(ErrorKind::IdInUse, format!("session id {id:?} is live"))
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("no session {id:?}"))
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "session ended")
    }

    pub fn incompatible_build(build: &str) -> Self {
        Self::new(ErrorKind::IncompatibleBuild, format!("daemon build {build}"))
    }

    pub fn supervisor_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SupervisorUnavailable, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
