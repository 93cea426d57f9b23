//! In-memory protocol engine driven by the caller.
//!
//! Nothing touches the network. Tests and embedders push events into a
//! session with [`ScriptedEngine::emit`], shape failures up front, and read
//! back every command the sessions issued through [`ScriptedEngine::calls`].

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    Address, ConnectOptions, EngineConnection, EngineEvent, EngineLink, MediaContent,
    ProtocolEngine,
};
use crate::session::SessionId;
use crate::store::SignalKeyStore;

const EVENT_BUFFER: usize = 64;

/// A command a session sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Connect {
        session: SessionId,
        paired: bool,
    },
    Logout {
        session: SessionId,
    },
    Lookup {
        session: SessionId,
        address: Address,
    },
    SendText {
        session: SessionId,
        to: Address,
        text: String,
    },
    SendMedia {
        session: SessionId,
        to: Address,
        media: MediaContent,
    },
}

#[derive(Default)]
struct ScriptState {
    links: HashMap<SessionId, mpsc::Sender<EngineEvent>>,
    key_stores: HashMap<SessionId, Arc<dyn SignalKeyStore>>,
    calls: Vec<EngineCall>,
    connects: usize,
    failing_connects: u32,
    connect_delay: Duration,
    on_connect: Vec<EngineEvent>,
    unregistered: HashSet<String>,
    send_budget: Option<usize>,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` on the newest connection of `session`. Returns false
    /// when the session has no connection or stopped listening.
    pub async fn emit(&self, session: SessionId, event: EngineEvent) -> bool {
        let sender = self.state.lock().links.get(&session).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Events queued on every new connection, before the caller sees it.
    pub fn on_connect(&self, events: Vec<EngineEvent>) {
        self.state.lock().on_connect = events;
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Directory lookups for this phone number report no account.
    pub fn set_unregistered(&self, digits: &str) {
        self.state.lock().unregistered.insert(digits.to_string());
    }

    /// Allow `sends` more successful sends, then fail every send.
    pub fn fail_sends_after(&self, sends: usize) {
        self.state.lock().send_budget = Some(sends);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// The key store handed over by the latest connect of `session`.
    pub fn key_store(&self, session: SessionId) -> Option<Arc<dyn SignalKeyStore>> {
        self.state.lock().key_stores.get(&session).cloned()
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl ProtocolEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<EngineLink> {
        let session = options.session_id;
        let (delay, fail) = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.calls.push(EngineCall::Connect {
                session,
                paired: options.credentials.is_paired(),
            });
            let fail = state.failing_connects > 0;
            if fail {
                state.failing_connects -= 1;
            }
            (state.connect_delay, fail)
        };

        // failures take as long as successes
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            bail!("scripted connect failure for session {session}");
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut state = self.state.lock();
        for event in &state.on_connect {
            // fresh channel, cannot be full
            let _ = tx.try_send(event.clone());
        }
        state.links.insert(session, tx);
        state.key_stores.insert(session, options.keys);
        drop(state);

        Ok(EngineLink {
            connection: Arc::new(ScriptedConnection {
                session,
                engine: self.clone(),
            }),
            events: rx,
        })
    }
}

struct ScriptedConnection {
    session: SessionId,
    engine: ScriptedEngine,
}

impl ScriptedConnection {
    fn spend_send(&self) -> anyhow::Result<()> {
        let mut state = self.engine.state.lock();
        if let Some(budget) = state.send_budget.as_mut() {
            if *budget == 0 {
                bail!("scripted send failure");
            }
            *budget -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    async fn logout(&self) -> anyhow::Result<()> {
        self.engine.record(EngineCall::Logout {
            session: self.session,
        });
        Ok(())
    }

    async fn send_text(&self, to: &Address, text: &str) -> anyhow::Result<()> {
        self.spend_send()?;
        self.engine.record(EngineCall::SendText {
            session: self.session,
            to: to.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_media(&self, to: &Address, media: MediaContent) -> anyhow::Result<()> {
        self.spend_send()?;
        self.engine.record(EngineCall::SendMedia {
            session: self.session,
            to: to.clone(),
            media,
        });
        Ok(())
    }

    async fn lookup_registered(&self, candidate: &Address) -> anyhow::Result<Option<Address>> {
        self.engine.record(EngineCall::Lookup {
            session: self.session,
            address: candidate.clone(),
        });
        let unregistered = self
            .engine
            .state
            .lock()
            .unregistered
            .contains(candidate.user());
        Ok((!unregistered).then(|| candidate.clone()))
    }
}
