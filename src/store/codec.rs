//! Binary-safe text encoding for credential payloads.
//!
//! Backends store text. Binary payloads are wrapped in a tagged JSON object
//! so they survive the round trip byte for byte:
//!
//! ```json
//! {"type":"Buffer","data":"<standard base64>"}
//! ```
//!
//! The same marker is used for binary fields inside the primary credential
//! bundle (see [`buffer`]).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Value of the `type` field that marks an encoded buffer.
pub const BUFFER_MARKER: &str = "Buffer";

#[derive(Debug, Serialize, Deserialize)]
struct TaggedBuffer {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

impl TaggedBuffer {
    fn wrap(payload: &[u8]) -> Self {
        Self {
            kind: BUFFER_MARKER.to_string(),
            data: STANDARD.encode(payload),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>, StoreError> {
        if self.kind != BUFFER_MARKER {
            return Err(StoreError::Encoding(format!(
                "unexpected value marker `{}`",
                self.kind
            )));
        }
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

/// Encode a payload for storage.
pub fn encode(payload: &[u8]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&TaggedBuffer::wrap(payload))?)
}

/// Decode a stored payload produced by [`encode`].
pub fn decode(raw: &str) -> Result<Vec<u8>, StoreError> {
    let tagged: TaggedBuffer = serde_json::from_str(raw)?;
    tagged.into_bytes()
}

/// `#[serde(with = "codec::buffer")]` adapter for `Vec<u8>` fields.
pub mod buffer {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::TaggedBuffer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        TaggedBuffer::wrap(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        TaggedBuffer::deserialize(deserializer)?
            .into_bytes()
            .map_err(serde::de::Error::custom)
    }
}
