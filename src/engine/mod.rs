//! Seam to the external messaging-protocol engine.
//!
//! The engine owns the wire protocol. A session hands it stored credentials
//! and a key store, gets back a connection handle plus an ordered stream of
//! [`EngineEvent`]s, and drives its state machine from that stream.

pub mod scripted;

pub use scripted::{EngineCall, ScriptedEngine};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::session::SessionId;
use crate::store::{Credentials, SignalKeyStore};

/// Server suffix for individual user accounts.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// A network address (`user@server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Address of a personal account given its digits-only phone number.
    pub fn for_phone(digits: &str) -> Self {
        Self(format!("{digits}@{USER_SERVER}"))
    }

    /// Wrap an address that is already fully qualified.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`.
    pub fn user(&self) -> &str {
        self.0.split_once('@').map_or(self.0.as_str(), |(user, _)| user)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One media part of an outbound message, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaContent {
    Image {
        data: Bytes,
    },
    Video {
        data: Bytes,
        file_name: String,
    },
    Document {
        data: Bytes,
        file_name: String,
        mime_type: String,
    },
}

impl MediaContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Document { .. } => "document",
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Self::Image { data } | Self::Video { data, .. } | Self::Document { data, .. } => data,
        }
    }
}

/// Why the engine closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    Unavailable,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status(code: u16) -> Self {
        match code {
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            401 => Self::LoggedOut,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            411 => Self::MultideviceMismatch,
            403 => Self::Forbidden,
            503 => Self::Unavailable,
            other => Self::Other(other),
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::ConnectionClosed => 428,
            Self::ConnectionLost => 408,
            Self::ConnectionReplaced => 440,
            Self::LoggedOut => 401,
            Self::BadSession => 500,
            Self::RestartRequired => 515,
            Self::MultideviceMismatch => 411,
            Self::Forbidden => 403,
            Self::Unavailable => 503,
            Self::Other(code) => code,
        }
    }

    /// Only an explicit logout invalidates the stored credentials.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "status {code}"),
            known => write!(f, "{known:?} ({})", known.status_code()),
        }
    }
}

/// Events an engine connection reports, in the order they happened.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionOpened,
    ConnectionClosed {
        reason: DisconnectReason,
        fatal: bool,
    },
    /// A new pairing challenge to present as a QR code.
    QrIssued(String),
    /// The primary credential bundle changed and must be persisted.
    CredentialsUpdated(Box<Credentials>),
}

impl EngineEvent {
    /// Close event whose fatality follows the reason.
    pub fn closed(reason: DisconnectReason) -> Self {
        Self::ConnectionClosed {
            reason,
            fatal: reason.is_fatal(),
        }
    }
}

pub struct ConnectOptions {
    pub session_id: SessionId,
    pub credentials: Credentials,
    pub keys: Arc<dyn SignalKeyStore>,
}

/// A live connection plus the stream of its events.
pub struct EngineLink {
    pub connection: Arc<dyn EngineConnection>,
    pub events: mpsc::Receiver<EngineEvent>,
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection with the given credentials. The engine keeps
    /// reading and writing indexed keys through `options.keys`.
    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<EngineLink>;
}

#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Unlink the device. Stored credentials are useless afterwards.
    async fn logout(&self) -> anyhow::Result<()>;

    async fn send_text(&self, to: &Address, text: &str) -> anyhow::Result<()>;

    async fn send_media(&self, to: &Address, media: MediaContent) -> anyhow::Result<()>;

    /// The registered address behind `candidate`, if the account exists.
    async fn lookup_registered(&self, candidate: &Address) -> anyhow::Result<Option<Address>>;
}
