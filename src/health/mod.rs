use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::session::{SessionId, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub reconnect_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub sessions: BTreeMap<SessionId, SessionHealth>,
}

/// Health of every session a registry has brought up.
pub struct HealthBoard {
    started_at: Instant,
    sessions: Mutex<BTreeMap<SessionId, SessionHealth>>,
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert<F>(&self, id: SessionId, update: F)
    where
        F: FnOnce(&mut SessionHealth),
    {
        let now = now_rfc3339();
        let mut map = self.sessions.lock();
        let entry = map.entry(id).or_insert_with(|| SessionHealth {
            status: "starting".into(),
            updated_at: now.clone(),
            last_ok: None,
            last_error: None,
            reconnect_count: 0,
        });
        update(entry);
        entry.updated_at = now;
    }

    /// Record a state transition. Reaching `Connected` counts as ok.
    pub fn mark_state(&self, id: SessionId, state: SessionState) {
        self.upsert(id, |entry| {
            entry.status = state.to_string();
            if state == SessionState::Connected {
                entry.last_ok = Some(now_rfc3339());
                entry.last_error = None;
            }
        });
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn mark_error(&self, id: SessionId, error: impl ToString) {
        let err = error.to_string();
        self.upsert(id, move |entry| {
            entry.status = "error".into();
            entry.last_error = Some(err);
        });
    }

    pub fn bump_reconnect(&self, id: SessionId) {
        self.upsert(id, |entry| {
            entry.reconnect_count = entry.reconnect_count.saturating_add(1);
        });
    }

    pub fn forget(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHealth> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sessions: self.sessions.lock().clone(),
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "message": "failed to serialize health snapshot"
            })
        })
    }
}
