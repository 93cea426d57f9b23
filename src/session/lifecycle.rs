//! A single account's connection and its state machine.
//!
//! ```text
//!                 QrIssued
//!  Disconnected ───────────► AwaitingScan
//!       │  ▲                      │
//!       │  │ ConnectionClosed     │ ConnectionOpened
//!       │  │                      ▼
//!       └──┼──────────────────► Connected
//!          └──────────────────────┘
//! ```
//!
//! Engine events are consumed in order by one task per session. A transient
//! close re-establishes the connection from that task with the stored
//! credentials; a fatal close (logout) ends the session's connection for
//! good.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{ReconnectPolicy, SessionId, SessionSnapshot, SessionState};
use crate::dispatch::{DeliveryReport, MessageDispatcher, OutboundMessage};
use crate::engine::{
    ConnectOptions, DisconnectReason, EngineConnection, EngineEvent, EngineLink, ProtocolEngine,
};
use crate::error::{Result, SessionError};
use crate::health::HealthBoard;
use crate::store::{CredentialStore, Credentials};

/// Everything a session needs from its host.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<dyn ProtocolEngine>,
    pub store: CredentialStore,
    pub policy: ReconnectPolicy,
    pub health: Arc<HealthBoard>,
}

struct SessionData {
    state: SessionState,
    qr_challenge: Option<String>,
    connection: Option<Arc<dyn EngineConnection>>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    logged_out: bool,
}

impl SessionData {
    fn snapshot(&self, id: SessionId) -> SessionSnapshot {
        SessionSnapshot {
            id,
            state: self.state,
            qr_challenge: self.qr_challenge.clone(),
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            logged_out: self.logged_out,
        }
    }

    fn enter_disconnected(&mut self) -> Option<Arc<dyn EngineConnection>> {
        self.state = SessionState::Disconnected;
        self.qr_challenge = None;
        self.connection.take()
    }
}

struct SessionInner {
    id: SessionId,
    ctx: SessionContext,
    data: Mutex<SessionData>,
    updates: watch::Sender<SessionSnapshot>,
    /// Fired once the session is disconnected, removed or out of reconnect
    /// attempts; stops the event task.
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Load credentials, open a connection and start consuming its events.
    /// Store and engine failures are returned as is; nothing is retried.
    pub async fn create(id: SessionId, ctx: SessionContext) -> Result<Self> {
        let link = connect_once(id, &ctx).await.map_err(|e| {
            ctx.health.mark_error(id, &e);
            e
        })?;

        let data = SessionData {
            state: SessionState::Disconnected,
            qr_challenge: None,
            connection: Some(link.connection),
            reconnect_attempts: 0,
            last_error: None,
            logged_out: false,
        };
        let (updates, _) = watch::channel(SessionSnapshot::initial(id));
        ctx.health.mark_state(id, SessionState::Disconnected);

        let inner = Arc::new(SessionInner {
            id,
            ctx,
            data: Mutex::new(data),
            updates,
            stopped: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let span = tracing::info_span!("session", id = %id);
        let handle = tokio::spawn(inner.clone().run(link.events).instrument(span));
        *inner.task.lock() = Some(handle);

        tracing::info!(session = %id, "session created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn status(&self) -> SessionState {
        self.inner.data.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.data.lock().snapshot(self.inner.id)
    }

    /// Receiver notified on every state or challenge change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    /// The current pairing challenge while awaiting a scan.
    pub fn qr_challenge(&self) -> Result<String> {
        let data = self.inner.data.lock();
        match (&data.state, &data.qr_challenge) {
            (SessionState::AwaitingScan, Some(challenge)) => Ok(challenge.clone()),
            _ => Err(SessionError::NoChallengeAvailable(self.inner.id)),
        }
    }

    /// The current pairing challenge rendered as a PNG image.
    pub fn qr_image_png(&self) -> anyhow::Result<Vec<u8>> {
        let challenge = self.qr_challenge()?;
        crate::pairing::render_png(&challenge)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.data.lock().last_error.clone()
    }

    pub fn credential_store(&self) -> &CredentialStore {
        &self.inner.ctx.store
    }

    /// Whether the event task has stopped: disconnect, shutdown, or every
    /// reconnect attempt failed. A stopped session never reconnects.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<DeliveryReport> {
        MessageDispatcher.send(self, message).await
    }

    /// Connection handle, only while connected.
    pub(crate) fn ready_connection(&self) -> Option<Arc<dyn EngineConnection>> {
        let data = self.inner.data.lock();
        match data.state {
            SessionState::Connected => data.connection.clone(),
            _ => None,
        }
    }

    /// Log out and stop. No reconnect follows.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self.inner.stop();
        match connection {
            Some(connection) => {
                tracing::info!(session = %self.inner.id, "logging out");
                connection.logout().await.map_err(SessionError::Engine)
            }
            None => Ok(()),
        }
    }

    /// Stop the event task and drop the connection without logging out.
    /// Stored credentials stay valid.
    pub async fn shutdown(&self) {
        drop(self.inner.stop());
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(session = %self.inner.id, "event task ended abnormally: {e}");
            }
        }
    }
}

async fn connect_once(id: SessionId, ctx: &SessionContext) -> Result<EngineLink> {
    let credentials = ctx.store.load_primary_credentials().await?;
    ctx.engine
        .connect(ConnectOptions {
            session_id: id,
            credentials,
            keys: Arc::new(ctx.store.clone()),
        })
        .await
        .map_err(SessionError::Engine)
}

impl SessionInner {
    /// Cancel the event task and move to `Disconnected`, returning the
    /// connection that was live.
    fn stop(&self) -> Option<Arc<dyn EngineConnection>> {
        // cancel before taking the handle so a concurrent reconnect either
        // sees the token or has already stored the connection taken here
        self.stopped.cancel();
        let mut data = self.data.lock();
        let connection = data.enter_disconnected();
        self.publish(&data);
        connection
    }

    fn publish(&self, data: &SessionData) {
        self.updates.send_replace(data.snapshot(self.id));
        self.ctx.health.mark_state(self.id, data.state);
    }

    /// Apply `f` unless the session has been stopped. Returns false when
    /// the update was skipped.
    fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionData),
    {
        let mut data = self.data.lock();
        if self.stopped.is_cancelled() {
            return false;
        }
        f(&mut *data);
        self.publish(&data);
        true
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<EngineEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.stopped.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(EngineEvent::QrIssued(challenge)) => {
                    tracing::info!("pairing challenge issued, waiting for scan");
                    self.update(|data| {
                        data.state = SessionState::AwaitingScan;
                        data.qr_challenge = Some(challenge);
                    });
                }
                Some(EngineEvent::ConnectionOpened) => {
                    tracing::info!("connection open");
                    self.update(|data| {
                        data.state = SessionState::Connected;
                        data.qr_challenge = None;
                        data.last_error = None;
                    });
                }
                Some(EngineEvent::CredentialsUpdated(creds)) => {
                    self.persist_credentials(&creds).await;
                }
                Some(EngineEvent::ConnectionClosed { reason, fatal }) => {
                    drop(events);
                    match self.handle_close(reason, fatal).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
                None => {
                    tracing::warn!("engine event stream ended without a close event");
                    drop(events);
                    match self
                        .handle_close(DisconnectReason::ConnectionLost, false)
                        .await
                    {
                        Some(next) => events = next,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("event task stopped");
    }

    async fn persist_credentials(&self, creds: &Credentials) {
        match self.ctx.store.save_primary_credentials(creds).await {
            Ok(()) => tracing::debug!("credentials saved"),
            Err(e) => {
                tracing::error!("failed to save credentials: {e}");
                self.update(|data| data.last_error = Some(e.to_string()));
                self.ctx.health.mark_error(self.id, &e);
            }
        }
    }

    /// Returns the event stream of the replacement connection, or `None`
    /// when the session stays disconnected.
    async fn handle_close(
        &self,
        reason: DisconnectReason,
        fatal: bool,
    ) -> Option<mpsc::Receiver<EngineEvent>> {
        let still_live = self.update(|data| drop(data.enter_disconnected()));
        if !still_live {
            return None;
        }

        if fatal {
            let err = SessionError::ConnectionFatal(self.id);
            tracing::warn!("connection closed ({reason}), not reconnecting: {err}");
            self.update(|data| {
                data.logged_out = true;
                data.last_error = Some(err.to_string());
            });
            self.ctx.health.mark_error(self.id, &err);
            return None;
        }

        tracing::info!("connection closed ({reason}), reconnecting");
        self.reconnect(reason).await
    }

    async fn reconnect(&self, reason: DisconnectReason) -> Option<mpsc::Receiver<EngineEvent>> {
        let policy = self.ctx.policy;
        let mut last_failure = anyhow::anyhow!("connection closed: {reason}");
        let mut attempt = 0u32;

        while policy.allows(attempt) {
            // never start an attempt without giving other tasks a turn
            tokio::task::yield_now().await;
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    () = self.stopped.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if self.stopped.is_cancelled() {
                return None;
            }

            attempt += 1;
            self.ctx.health.bump_reconnect(self.id);
            self.update(|data| data.reconnect_attempts += 1);

            let outcome = tokio::select! {
                () = self.stopped.cancelled() => return None,
                outcome = connect_once(self.id, &self.ctx) => outcome,
            };

            match outcome {
                Ok(link) => {
                    let installed = self.update(|data| {
                        data.connection = Some(link.connection);
                    });
                    if !installed {
                        tracing::debug!("session stopped during reconnect, dropping new connection");
                        return None;
                    }
                    tracing::info!(attempt, "reconnected");
                    return Some(link.events);
                }
                Err(e) => {
                    tracing::warn!(attempt, "reconnect attempt failed: {e}");
                    last_failure = anyhow::Error::new(e);
                }
            }
        }

        let err = SessionError::ConnectionTransientFailure {
            id: self.id,
            attempts: attempt,
            source: last_failure,
        };
        tracing::error!("{err}");
        self.update(|data| data.last_error = Some(err.to_string()));
        self.ctx.health.mark_error(self.id, &err);
        self.stopped.cancel();
        None
    }
}
