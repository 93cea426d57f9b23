use std::sync::Arc;

use crate::session::SessionId;
use crate::store::StoreError;

/// Errors surfaced to callers of the registry, sessions and dispatcher.
///
/// Precondition and validation failures are returned synchronously to the
/// caller. Connection failures that happen inside a session's event task are
/// logged and recorded on the session instead of being returned here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation needs a `Connected` session.
    #[error("session {0} is not connected")]
    SessionNotReady(SessionId),

    /// A QR challenge was requested while the session is not awaiting a scan.
    #[error("no QR challenge available for session {0}")]
    NoChallengeAvailable(SessionId),

    /// Directory lookup found no account for the address.
    #[error("recipient {0} is not registered on WhatsApp")]
    RecipientNotRegistered(String),

    /// The recipient string cannot be turned into a network address.
    #[error("recipient `{0}` does not contain a valid phone number")]
    InvalidRecipient(String),

    /// Neither text nor attachments were supplied.
    #[error("message must carry text or at least one attachment")]
    InvalidMessagePayload,

    /// The backing credential store failed.
    #[error("credential store failure: {0}")]
    CredentialStore(#[from] StoreError),

    /// The engine closed the connection for good (logged out).
    #[error("session {0} was logged out")]
    ConnectionFatal(SessionId),

    /// A recoverable close whose reconnect attempts were exhausted.
    #[error("session {id} could not reconnect after {attempts} attempt(s): {source}")]
    ConnectionTransientFailure {
        id: SessionId,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Opening the session failed. Every caller that was waiting on the same
    /// creation receives the same cause.
    #[error("session {id} could not be created: {source}")]
    CreationFailed {
        id: SessionId,
        #[source]
        source: Arc<SessionError>,
    },

    /// The session was removed from the registry while the call was in flight.
    #[error("session {0} was removed")]
    SessionRemoved(SessionId),

    /// A multi-part send failed part-way. `delivered` parts already reached
    /// the recipient and are not rolled back.
    #[error("delivery failed after {delivered} of {total} part(s): {source}")]
    DeliveryFailed {
        delivered: usize,
        total: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Any other protocol engine failure.
    #[error("protocol engine error: {0:#}")]
    Engine(#[source] anyhow::Error),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
