// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup reconciliation of durable rows against the supervisor's live
//! registry, plus the per-session artifact re-emission hook.

use std::path::Path;

use crate::store::SessionRow;

/// Reason recorded on rows whose session did not survive a supervisor
/// restart.
pub const SUPERVISOR_LOST: &str = "supervisor-lost";

/// What reconciliation did, by session id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows whose session is still live; status kept running, PID refreshed.
    pub readopted: Vec<String>,
    /// Rows marked stopped because the supervisor no longer knows them.
    pub lost: Vec<String>,
    /// Live sessions with no row; logged and deliberately left running.
    pub orphans: Vec<String>,
}

/// Re-emits a workspace-side artifact for each re-adopted session: a
/// declarative file with a stable name at the workspace root, holding
/// caller-supplied bytes the runtime does not interpret.
pub struct ArtifactHook {
    file_name: String,
    contents: Box<dyn Fn(&SessionRow) -> Option<Vec<u8>> + Send + Sync>,
}

impl ArtifactHook {
    pub fn new(
        file_name: impl Into<String>,
        contents: impl Fn(&SessionRow) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self { file_name: file_name.into(), contents: Box::new(contents) }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Write the artifact into the row's workspace root.
    ///
    /// Returns false when the callback produced nothing for this session.
    pub fn write_for(&self, row: &SessionRow) -> std::io::Result<bool> {
        match (self.contents)(row) {
            Some(bytes) => {
                std::fs::write(self.path_for(&row.workspace), bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn path_for(&self, workspace: &Path) -> std::path::PathBuf {
        workspace.join(&self.file_name)
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
