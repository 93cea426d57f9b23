//! Session lifecycle through the registry, driven by the scripted engine.

use std::sync::Arc;
use std::time::Duration;
use zeroclaw_sessions::engine::{
    DisconnectReason, EngineCall, EngineEvent, ScriptedEngine,
};
use zeroclaw_sessions::session::{
    ReconnectPolicy, Session, SessionId, SessionRegistry, SessionSnapshot, SessionState,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use zeroclaw_sessions::store::{
    Contact, Credentials, DEFAULT_KEY_PREFIX, KvBackend, MemoryBackend, StoreError,
};
use zeroclaw_sessions::SessionError;

fn registry(engine: &ScriptedEngine) -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(engine.clone()),
        Arc::new(MemoryBackend::new()),
        DEFAULT_KEY_PREFIX,
        ReconnectPolicy::immediate().with_max_attempts(5),
    )
}

async fn wait_until<F>(session: &Session, predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for session update")
        .expect("session updates closed")
        .clone()
}

// ─────────────────────────────────────────────────────────────────────────────
// Pairing scenario
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn account_seven_pairs_and_is_removed() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let id = SessionId::new(7);

    let session = registry.get_or_create(id).await.unwrap();
    assert_eq!(session.status(), SessionState::Disconnected);
    assert!(matches!(
        engine.calls().as_slice(),
        [EngineCall::Connect { paired: false, .. }]
    ));

    engine.emit(id, EngineEvent::QrIssued("Q1".into())).await;
    let snap = wait_until(&session, |s| s.state == SessionState::AwaitingScan).await;
    assert_eq!(snap.qr_challenge.as_deref(), Some("Q1"));
    assert_eq!(session.qr_challenge().unwrap(), "Q1");

    engine.emit(id, EngineEvent::ConnectionOpened).await;
    wait_until(&session, |s| s.state == SessionState::Connected).await;
    assert!(matches!(
        session.qr_challenge(),
        Err(SessionError::NoChallengeAvailable(_))
    ));

    registry.remove(id, true).await.unwrap();
    assert!(engine.calls().contains(&EngineCall::Logout { session: id }));
    assert!(registry.get(id).is_none());
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn every_challenge_replaces_the_previous_one() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let id = SessionId::new(8);
    let session = registry.get_or_create(id).await.unwrap();

    engine.emit(id, EngineEvent::QrIssued("Q1".into())).await;
    engine.emit(id, EngineEvent::QrIssued("Q2".into())).await;
    wait_until(&session, |s| s.qr_challenge.as_deref() == Some("Q2")).await;
    assert_eq!(session.qr_challenge().unwrap(), "Q2");
    registry.shutdown_all().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Closes and reconnects
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_close_starts_exactly_one_reconnect() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let id = SessionId::new(20);
    let session = registry.get_or_create(id).await.unwrap();

    engine.on_connect(vec![EngineEvent::ConnectionOpened]);
    engine
        .emit(id, EngineEvent::closed(DisconnectReason::RestartRequired))
        .await;
    wait_until(&session, |s| {
        s.state == SessionState::Connected && s.reconnect_attempts == 1
    })
    .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.connect_count(), 2);
    assert_eq!(registry.health_snapshot().sessions[&id].reconnect_count, 1);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn reconnect_uses_credentials_saved_by_the_engine() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let id = SessionId::new(21);
    let session = registry.get_or_create(id).await.unwrap();

    let mut creds = registry
        .credential_store(id)
        .load_primary_credentials()
        .await
        .unwrap();
    creds.me = Some(Contact {
        id: "5511999999999:4@s.whatsapp.net".into(),
        name: None,
    });
    engine
        .emit(id, EngineEvent::CredentialsUpdated(Box::new(creds)))
        .await;
    engine
        .emit(id, EngineEvent::closed(DisconnectReason::ConnectionClosed))
        .await;
    wait_until(&session, |s| s.reconnect_attempts == 1).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.connect_count() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        engine.calls().last(),
        Some(&EngineCall::Connect {
            session: id,
            paired: true
        })
    );
    registry.shutdown_all().await;
}

#[tokio::test]
async fn logged_out_session_stays_disconnected() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let id = SessionId::new(22);
    let session = registry.get_or_create(id).await.unwrap();
    engine.emit(id, EngineEvent::ConnectionOpened).await;
    wait_until(&session, |s| s.state == SessionState::Connected).await;

    engine
        .emit(id, EngineEvent::closed(DisconnectReason::from_status(401)))
        .await;
    let snap = wait_until(&session, |s| s.logged_out).await;
    assert_eq!(snap.state, SessionState::Disconnected);
    assert!(snap.last_error.unwrap().contains("logged out"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.connect_count(), 1);
    assert_eq!(session.status(), SessionState::Disconnected);

    // the registry still holds it until the orchestrator decides otherwise
    assert!(registry.get(id).is_some());
    registry.remove(id, false).await.unwrap();
}

#[tokio::test]
async fn removal_interrupts_a_pending_reconnect() {
    let engine = ScriptedEngine::new();
    let registry = SessionRegistry::new(
        Arc::new(engine.clone()),
        Arc::new(MemoryBackend::new()),
        DEFAULT_KEY_PREFIX,
        ReconnectPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        },
    );
    let id = SessionId::new(23);
    let session = registry.get_or_create(id).await.unwrap();

    // the immediate first attempt fails, the second waits out the backoff
    engine.fail_next_connects(1);
    engine
        .emit(id, EngineEvent::closed(DisconnectReason::ConnectionLost))
        .await;
    wait_until(&session, |s| s.reconnect_attempts == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(2), registry.remove(id, false))
        .await
        .expect("removal waited for the backoff")
        .unwrap();
    assert!(session.is_stopped());
    assert_eq!(engine.connect_count(), 2);
    assert!(registry.get(id).is_none());
}

#[tokio::test]
async fn sessions_are_independent() {
    let engine = ScriptedEngine::new();
    let registry = registry(&engine);
    let a = registry.get_or_create(SessionId::new(30)).await.unwrap();
    let b = registry.get_or_create(SessionId::new(31)).await.unwrap();

    engine.emit(a.id(), EngineEvent::ConnectionOpened).await;
    engine
        .emit(b.id(), EngineEvent::QrIssued("QB".into()))
        .await;
    wait_until(&a, |s| s.state == SessionState::Connected).await;
    wait_until(&b, |s| s.state == SessionState::AwaitingScan).await;

    let ids: Vec<SessionId> = registry.list().iter().map(Session::id).collect();
    assert_eq!(ids, vec![SessionId::new(30), SessionId::new(31)]);
    registry.shutdown_all().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential persistence failures
// ─────────────────────────────────────────────────────────────────────────────

/// Memory backend whose writes can be switched off.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    reject_writes: AtomicBool,
}

#[async_trait]
impl KvBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys_with_prefix(prefix).await
    }
}

#[tokio::test]
async fn failed_credential_save_is_recorded_without_changing_state() {
    let engine = ScriptedEngine::new();
    let backend = Arc::new(FlakyBackend::default());
    let registry = SessionRegistry::new(
        Arc::new(engine.clone()),
        backend.clone(),
        DEFAULT_KEY_PREFIX,
        ReconnectPolicy::immediate(),
    );
    let id = SessionId::new(40);
    let session = registry.get_or_create(id).await.unwrap();
    engine.emit(id, EngineEvent::ConnectionOpened).await;
    wait_until(&session, |s| s.state == SessionState::Connected).await;

    backend.reject_writes.store(true, Ordering::SeqCst);
    let mut creds = Credentials::init();
    creds.registered = true;
    engine
        .emit(id, EngineEvent::CredentialsUpdated(Box::new(creds)))
        .await;

    let snap = wait_until(&session, |s| s.last_error.is_some()).await;
    assert_eq!(snap.state, SessionState::Connected);
    assert!(snap.last_error.unwrap().contains("disk I/O error"));
    assert!(!session.is_stopped());

    // the health board is updated right after the snapshot
    let recorded = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(err) = registry.health_snapshot().sessions[&id].last_error.clone() {
                break err;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(recorded.contains("disk I/O error"));
    assert!(backend.inner.is_empty());
    registry.shutdown_all().await;
}
