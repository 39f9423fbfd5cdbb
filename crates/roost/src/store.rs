// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable session records.
//!
//! The rows themselves are owned by an external collaborator (the server's
//! database layer); the session manager only writes through this trait as
//! advisory state. On any disagreement the supervisor's in-memory registry
//! wins, which is what reconciliation enforces at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Durable status of a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether a row in this status claims a live session.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// One durable session record.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    /// Workspace directory the agent runs in; artifact re-emission targets
    /// its root.
    pub workspace: PathBuf,
    pub status: RowStatus,
    /// Last-known child PID.
    pub pid: Option<i32>,
    /// Source repository reference the workspace was seeded from.
    pub repo: Option<String>,
    pub created_at: SystemTime,
}

impl SessionRow {
    pub fn new(id: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            workspace: workspace.into(),
            status: RowStatus::Starting,
            pid: None,
            repo: None,
            created_at: SystemTime::now(),
        }
    }
}

/// Write-through access to the durable rows.
///
/// Calls happen outside any of the runtime's internal locks, so
/// implementations are free to block briefly on a database.
pub trait SessionStore: Send + Sync {
    /// Rows whose status claims a live session (starting or running).
    fn list_active(&self) -> anyhow::Result<Vec<SessionRow>>;

    /// Update a row's status; `reason` records why (e.g. "supervisor-lost").
    /// Unknown ids are ignored.
    fn set_status(&self, id: &str, status: RowStatus, reason: Option<&str>) -> anyhow::Result<()>;

    /// Refresh a row's last-known PID. Unknown ids are ignored.
    fn set_pid(&self, id: &str, pid: i32) -> anyhow::Result<()>;
}

/// In-memory store used by tests and local-mode development servers.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, StoredRow>>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: SessionRow,
    reason: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: SessionRow) {
        self.rows.lock().insert(row.id.clone(), StoredRow { row, reason: None });
    }

    pub fn get(&self, id: &str) -> Option<SessionRow> {
        self.rows.lock().get(id).map(|s| s.row.clone())
    }

    /// The reason recorded with the most recent status change.
    pub fn reason(&self, id: &str) -> Option<String> {
        self.rows.lock().get(id).and_then(|s| s.reason.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn list_active(&self) -> anyhow::Result<Vec<SessionRow>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|s| s.row.status.is_active())
            .map(|s| s.row.clone())
            .collect())
    }

    fn set_status(&self, id: &str, status: RowStatus, reason: Option<&str>) -> anyhow::Result<()> {
        if let Some(stored) = self.rows.lock().get_mut(id) {
            stored.row.status = status;
            stored.reason = reason.map(ToOwned::to_owned);
        }
        Ok(())
    }

    fn set_pid(&self, id: &str, pid: i32) -> anyhow::Result<()> {
        if let Some(stored) = self.rows.lock().get_mut(id) {
            stored.row.pid = Some(pid);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
