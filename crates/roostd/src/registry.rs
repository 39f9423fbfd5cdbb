// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authoritative id → session registry embedded in the supervisor (and,
//! in local mode, directly in the server).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SessionError;
use crate::ring::DEFAULT_CAPACITY;
use crate::session::{Session, SessionSpec, Subscription};

/// Maximum session identifier length in bytes.
pub const MAX_ID_LEN: usize = 64;

/// Summary of one live session, as returned by List/Get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub pid: i32,
    /// Seconds since the epoch.
    pub started_at: u64,
    pub alive: bool,
    pub rows: u16,
    pub cols: u16,
}

/// Validate a caller-chosen session identifier: 1 to 64 bytes of
/// `[A-Za-z0-9._-]`.
pub fn validate_id(id: &str) -> Result<(), SessionError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(SessionError::start_failed(format!(
            "session id must be 1 to {MAX_ID_LEN} bytes"
        )));
    }
    let ok = id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    if !ok {
        return Err(SessionError::start_failed(format!(
            "session id {id:?} contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// The only authoritative mapping of live children on this host.
///
/// Sessions insert on `start` and are removed by a per-session waiter once
/// the child is reaped; the server's database is a soft cache of this map.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ring_capacity: usize,
}

impl Registry {
    pub fn new(ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ring_capacity,
        })
    }

    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Start a new session. The id must not name a live session.
    pub fn start(self: &Arc<Self>, spec: SessionSpec) -> Result<Arc<Session>, SessionError> {
        validate_id(&spec.id)?;

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&spec.id) {
            return Err(SessionError::id_in_use(&spec.id));
        }
        let id = spec.id.clone();
        let session = Session::spawn(spec, self.ring_capacity)?;
        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        info!(session = %id, pid = session.pid(), "session started");
        spawn_reap_watcher(Arc::downgrade(self), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(id).ok_or_else(|| SessionError::not_found(id))
    }

    /// Summaries of all live sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> =
            self.sessions.read().values().map(|s| describe(s)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let session = self.require(id)?;
        Ok(describe(&session))
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> Result<usize, SessionError> {
        self.require(id)?.write(data).await
    }

    pub fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.require(id)?.resize(rows, cols)
    }

    pub fn stop(&self, id: &str) -> Result<(), SessionError> {
        self.require(id)?.stop();
        Ok(())
    }

    pub fn tail(&self, id: &str, max: usize) -> Result<Vec<u8>, SessionError> {
        Ok(self.require(id)?.tail(max))
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription, SessionError> {
        Ok(self.require(id)?.subscribe())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Remove the session from the registry once its child has been reaped.
fn spawn_reap_watcher(registry: Weak<Registry>, session: Arc<Session>) {
    tokio::spawn(async move {
        session.done().await;
        if let Some(registry) = registry.upgrade() {
            registry.sessions.write().remove(session.id());
        }
        info!(
            session = %session.id(),
            code = ?session.exit_status().and_then(|s| s.code),
            "session removed from registry"
        );
    });
}

fn describe(session: &Session) -> SessionInfo {
    let (rows, cols) = session.window_size();
    SessionInfo {
        id: session.id().to_owned(),
        pid: session.pid(),
        started_at: session.started_at_epoch(),
        alive: session.is_alive(),
        rows,
        cols,
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
