use anyhow::Context;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{ReconnectPolicy, Session, SessionContext, SessionId};
use crate::config::Config;
use crate::engine::ProtocolEngine;
use crate::error::{Result, SessionError};
use crate::health::{HealthBoard, HealthSnapshot};
use crate::store::{CredentialStore, KvBackend, SqliteBackend};

/// Result of one creation, shared by every caller that waited on it.
type Outcome = std::result::Result<Session, Arc<SessionError>>;

/// An initialized cell holds the outcome of the creation; an empty one marks
/// a creation in progress.
type Slot = Arc<OnceCell<Outcome>>;

/// Outcome of [`SessionRegistry::restore`].
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<SessionId>,
    pub failed: Vec<(SessionId, SessionError)>,
}

/// Live sessions by account id, at most one per id.
pub struct SessionRegistry {
    engine: Arc<dyn ProtocolEngine>,
    backend: Arc<dyn KvBackend>,
    key_prefix: String,
    policy: ReconnectPolicy,
    health: Arc<HealthBoard>,
    slots: Mutex<HashMap<SessionId, Slot>>,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        backend: Arc<dyn KvBackend>,
        key_prefix: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            engine,
            backend,
            key_prefix: key_prefix.into(),
            policy,
            health: Arc::new(HealthBoard::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registry persisting to the SQLite database named in `config`.
    pub fn from_config(config: &Config, engine: Arc<dyn ProtocolEngine>) -> anyhow::Result<Self> {
        let db_path = config.store.database_path();
        let backend = SqliteBackend::open(&db_path).with_context(|| {
            format!(
                "Failed to open credential database: {}",
                db_path.display()
            )
        })?;
        Ok(Self::new(
            engine,
            Arc::new(backend),
            config.store.key_prefix.clone(),
            ReconnectPolicy::from(&config.reconnect),
        ))
    }

    /// Credential store of `id`, whether or not a session is live.
    pub fn credential_store(&self, id: SessionId) -> CredentialStore {
        CredentialStore::new(self.backend.clone(), &self.key_prefix, id)
    }

    fn context(&self, id: SessionId) -> SessionContext {
        SessionContext {
            engine: self.engine.clone(),
            store: self.credential_store(id),
            policy: self.policy,
            health: self.health.clone(),
        }
    }

    fn is_current(&self, id: SessionId, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `slot` from the map unless it has already been replaced.
    fn release(&self, id: SessionId, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(&id);
        }
    }

    /// The live session for `id`, created on first use.
    ///
    /// Concurrent calls for one id share a single creation and all receive
    /// its outcome, failure included. A failed creation leaves nothing
    /// registered; the next call tries again. So does a session whose event
    /// task has stopped, e.g. after its reconnect attempts ran out.
    pub async fn get_or_create(&self, id: SessionId) -> Result<Session> {
        loop {
            let slot = self.slots.lock().entry(id).or_default().clone();

            let outcome = slot
                .get_or_init(|| async {
                    Session::create(id, self.context(id)).await.map_err(|e| {
                        tracing::warn!(session = %id, "session creation failed: {e}");
                        Arc::new(e)
                    })
                })
                .await
                .clone();

            let session = match outcome {
                Ok(session) => session,
                Err(source) => {
                    self.release(id, &slot);
                    return Err(SessionError::CreationFailed { id, source });
                }
            };

            // removed while the connection was being opened
            if !self.is_current(id, &slot) {
                session.shutdown().await;
                if !self.slots.lock().contains_key(&id) {
                    self.health.forget(id);
                }
                return Err(SessionError::SessionRemoved(id));
            }

            if !session.is_stopped() {
                return Ok(session);
            }
            tracing::info!(session = %id, "replacing stopped session");
            self.release(id, &slot);
            session.shutdown().await;
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.slots.lock().get(&id).and_then(live)
    }

    /// Live sessions, ordered by id.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .slots
            .lock()
            .values()
            .filter_map(live)
            .collect();
        sessions.sort_by_key(Session::id);
        sessions
    }

    /// Forget `id`, logging out first when `disconnect` is set. The session
    /// is stopped either way so no pending reconnect can bring it back.
    /// Removing an unknown id succeeds.
    pub async fn remove(&self, id: SessionId, disconnect: bool) -> Result<()> {
        let slot = self.slots.lock().remove(&id);
        let Some(slot) = slot else {
            return Ok(());
        };

        let Some(session) = live(&slot) else {
            self.health.forget(id);
            tracing::info!(session = %id, "removed before a session was established");
            return Ok(());
        };

        let logout = if disconnect {
            session.disconnect().await
        } else {
            Ok(())
        };
        session.shutdown().await;
        // stopping publishes a final state; forget it afterwards
        self.health.forget(id);
        tracing::info!(session = %id, disconnect, "session removed");
        logout
    }

    /// Remove with logout and delete every stored credential of `id`.
    /// Returns the number of deleted keys.
    pub async fn purge(&self, id: SessionId) -> Result<usize> {
        if let Err(e) = self.remove(id, true).await {
            tracing::warn!(session = %id, "logout before purge failed: {e}");
        }
        Ok(self.credential_store(id).purge().await?)
    }

    /// Bring up every id concurrently, e.g. all known accounts at startup.
    /// One failure does not stop the others.
    pub async fn restore(&self, ids: &[SessionId]) -> RestoreReport {
        let outcomes = join_all(ids.iter().map(|&id| async move {
            (id, self.get_or_create(id).await)
        }))
        .await;

        let mut report = RestoreReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => report.restored.push(id),
                Err(e) => {
                    tracing::error!(session = %id, "failed to restore session: {e}");
                    report.failed.push((id, e));
                }
            }
        }
        tracing::info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "session restore finished"
        );
        report
    }

    /// Stop every session without logging out. Credentials stay valid for
    /// the next start.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for session in slots.iter().filter_map(live) {
            session.shutdown().await;
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}

fn live(slot: &Slot) -> Option<Session> {
    slot.get().and_then(|outcome| outcome.as_ref().ok()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DisconnectReason, EngineCall, EngineEvent, ScriptedEngine};
    use crate::session::SessionState;
    use crate::store::{DEFAULT_KEY_PREFIX, KeyCategory, KeyWrite, MemoryBackend};
    use std::time::Duration;

    fn registry(engine: &ScriptedEngine) -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(engine.clone()),
            Arc::new(MemoryBackend::new()),
            DEFAULT_KEY_PREFIX,
            ReconnectPolicy::immediate().with_max_attempts(2),
        )
    }

    #[tokio::test]
    async fn concurrent_creation_opens_one_connection() {
        let engine = ScriptedEngine::new();
        engine.set_connect_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(&engine));
        let id = SessionId::new(1);

        let calls = (0..8).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(id).await })
        });
        let sessions: Vec<Session> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(engine.connect_count(), 1);
        assert!(sessions.iter().all(|s| s.id() == id));
        assert_eq!(registry.list().len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn failed_creation_leaves_nothing_registered() {
        let engine = ScriptedEngine::new();
        engine.fail_next_connects(1);
        let registry = registry(&engine);
        let id = SessionId::new(2);

        let err = registry.get_or_create(id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::CreationFailed { source, .. } if matches!(*source, SessionError::Engine(_))
        ));
        assert!(registry.get(id).is_none());
        assert!(registry.list().is_empty());

        let session = registry.get_or_create(id).await.unwrap();
        assert_eq!(session.status(), SessionState::Disconnected);
        assert_eq!(engine.connect_count(), 2);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn waiters_share_a_failed_creation() {
        let engine = ScriptedEngine::new();
        engine.set_connect_delay(Duration::from_millis(30));
        engine.fail_next_connects(1);
        let registry = Arc::new(registry(&engine));
        let id = SessionId::new(6);

        let spawn_create = || {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(id).await })
        };
        let first = spawn_create();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = spawn_create();

        for joined in [first.await.unwrap(), second.await.unwrap()] {
            assert!(matches!(joined, Err(SessionError::CreationFailed { .. })));
        }
        assert_eq!(engine.connect_count(), 1);
        assert!(registry.get(id).is_none());

        // the next access after the failure tries again
        let session = registry.get_or_create(id).await.unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(engine.connect_count(), 2);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn stopped_session_is_replaced_on_next_access() {
        let engine = ScriptedEngine::new();
        let registry = registry(&engine);
        let id = SessionId::new(7);
        let first = registry.get_or_create(id).await.unwrap();

        engine.fail_next_connects(5);
        engine
            .emit(id, EngineEvent::closed(DisconnectReason::ConnectionLost))
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !first.is_stopped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.connect_count(), 3);
        assert!(first.last_error().unwrap().contains("could not reconnect"));

        engine.fail_next_connects(0);
        let second = registry.get_or_create(id).await.unwrap();
        assert!(!second.is_stopped());
        assert_eq!(engine.connect_count(), 4);
        assert_eq!(registry.list().len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn removed_session_leaves_the_health_board() {
        let engine = ScriptedEngine::new();
        let registry = registry(&engine);
        let id = SessionId::new(8);
        registry.get_or_create(id).await.unwrap();
        assert!(registry.health_snapshot().sessions.contains_key(&id));

        registry.remove(id, true).await.unwrap();
        assert!(registry.health_snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_stops_session() {
        let engine = ScriptedEngine::new();
        let registry = registry(&engine);
        let id = SessionId::new(3);
        let session = registry.get_or_create(id).await.unwrap();

        registry.remove(id, false).await.unwrap();
        registry.remove(id, false).await.unwrap();
        assert!(registry.get(id).is_none());
        assert!(session.is_stopped());
        assert!(
            !engine
                .calls()
                .iter()
                .any(|c| matches!(c, EngineCall::Logout { .. }))
        );

        // a close arriving after removal must not reconnect
        engine
            .emit(id, EngineEvent::closed(DisconnectReason::ConnectionLost))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.connect_count(), 1);
        assert_eq!(session.status(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn removal_during_creation_discards_the_new_session() {
        let engine = ScriptedEngine::new();
        engine.set_connect_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(&engine));
        let id = SessionId::new(4);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.remove(id, true).await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SessionRemoved(_)));
        assert!(registry.get(id).is_none());
        assert!(registry.health_snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn purge_wipes_stored_keys() {
        let engine = ScriptedEngine::new();
        let registry = registry(&engine);
        let id = SessionId::new(5);
        registry.get_or_create(id).await.unwrap();

        let store = registry.credential_store(id);
        store
            .set(vec![KeyWrite::put(KeyCategory::PreKey, "1", vec![1, 2, 3])])
            .await
            .unwrap();
        store
            .save_primary_credentials(&store.load_primary_credentials().await.unwrap())
            .await
            .unwrap();

        assert_eq!(registry.purge(id).await.unwrap(), 2);
        assert!(registry.get(id).is_none());
        assert!(store.inventory().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn from_config_persists_to_sqlite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        let db_path = tmp.path().join("data").join("credentials.db");
        config.store.db_path = Some(db_path.clone());
        config.store.key_prefix = "acme-".into();

        let engine = ScriptedEngine::new();
        let registry = SessionRegistry::from_config(&config, Arc::new(engine.clone())).unwrap();
        assert!(db_path.exists());

        let store = registry.credential_store(SessionId::new(1));
        assert_eq!(store.prefix(), "acme-1:");
        store
            .save_primary_credentials(&store.load_primary_credentials().await.unwrap())
            .await
            .unwrap();

        let reopened = SqliteBackend::open(&db_path).unwrap();
        assert!(reopened.get("acme-1:creds").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restore_reports_each_id() {
        let engine = ScriptedEngine::new();
        let registry = registry(&engine);
        engine.fail_next_connects(1);

        let ids = [SessionId::new(10), SessionId::new(11), SessionId::new(12)];
        let report = registry.restore(&ids).await;
        assert_eq!(report.restored.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(registry.list().len(), 2);

        let health = registry.health_snapshot();
        assert_eq!(health.sessions.len(), 3);
        registry.shutdown_all().await;
        assert!(registry.list().is_empty());
    }
}
