//! Session identity and observable state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account identifier a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    AwaitingScan,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingScan => "awaiting_scan",
            Self::Connected => "connected",
        })
    }
}

/// Point-in-time view of a session, pushed to observers on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    /// Present only while `state` is `AwaitingScan`.
    pub qr_challenge: Option<String>,
    /// Reconnect attempts made since the session was created.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// The engine reported a logout; the session will not reconnect.
    pub logged_out: bool,
}

impl SessionSnapshot {
    pub(crate) fn initial(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Disconnected,
            qr_challenge: None,
            reconnect_attempts: 0,
            last_error: None,
            logged_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_parses_and_displays() {
        let id: SessionId = " 42 ".parse().unwrap();
        assert_eq!(id, SessionId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<SessionId>().is_err());
    }

    #[test]
    fn snapshot_serializes_snake_case_state() {
        let mut snap = SessionSnapshot::initial(SessionId::new(7));
        snap.state = SessionState::AwaitingScan;
        snap.qr_challenge = Some("2@abc".into());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["state"], "awaiting_scan");
        assert_eq!(json["qr_challenge"], "2@abc");
    }
}
