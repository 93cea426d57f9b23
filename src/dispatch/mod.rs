//! Outbound delivery over a connected session.
//!
//! A message is sent as an ordered sequence of parts: the text first (when
//! present), then each attachment in the order given. Every part is awaited
//! before the next one starts. Parts already sent are not recalled when a
//! later one fails; [`SessionError::DeliveryFailed`] reports how far the
//! delivery got.

use bytes::Bytes;
use serde::Serialize;

use crate::engine::{Address, MediaContent};
use crate::error::{Result, SessionError};
use crate::session::{Session, SessionId};

/// A file to deliver alongside (or instead of) text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_name: String,
}

impl Attachment {
    pub fn new(
        bytes: impl Into<Bytes>,
        mime_type: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            file_name: file_name.into(),
        }
    }

    /// Pick the media shape from the top-level MIME type.
    pub fn to_media(&self) -> MediaContent {
        let top_level = self
            .mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(kind, _)| kind)
            .trim()
            .to_ascii_lowercase();

        match top_level.as_str() {
            "image" => MediaContent::Image {
                data: self.bytes.clone(),
            },
            "video" => MediaContent::Video {
                data: self.bytes.clone(),
                file_name: self.file_name.clone(),
            },
            _ => MediaContent::Document {
                data: self.bytes.clone(),
                file_name: self.file_name.clone(),
                mime_type: self.mime_type.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Phone number in any formatting, or a full `user@server` address.
    pub recipient: String,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Text worth sending; whitespace-only text counts as none.
    fn body(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.trim().is_empty())
    }

    fn part_count(&self) -> usize {
        usize::from(self.body().is_some()) + self.attachments.len()
    }
}

/// What a successful delivery sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub session: SessionId,
    pub recipient: String,
    pub text_sent: bool,
    pub attachments_sent: usize,
}

/// Turn a recipient into the address to look up.
///
/// Supports:
/// - full addresses (e.g. "5511999999999@s.whatsapp.net")
/// - phone numbers in any formatting (e.g. "+55 (11) 99999-9999")
pub fn resolve_recipient(recipient: &str) -> Result<Address> {
    let trimmed = recipient.trim();
    if trimmed.contains('@') {
        return Ok(Address::from_raw(trimmed));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(SessionError::InvalidRecipient(trimmed.to_string()));
    }
    Ok(Address::for_phone(&digits))
}

/// Stateless send algorithm shared by every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageDispatcher;

impl MessageDispatcher {
    pub async fn send(&self, session: &Session, message: &OutboundMessage) -> Result<DeliveryReport> {
        let id = session.id();
        let connection = session
            .ready_connection()
            .ok_or(SessionError::SessionNotReady(id))?;

        let total = message.part_count();
        if total == 0 {
            return Err(SessionError::InvalidMessagePayload);
        }

        let candidate = resolve_recipient(&message.recipient)?;
        let address = connection
            .lookup_registered(&candidate)
            .await
            .map_err(SessionError::Engine)?
            .ok_or_else(|| SessionError::RecipientNotRegistered(candidate.to_string()))?;

        let mut delivered = 0;
        let failed = |delivered: usize, source: anyhow::Error| {
            tracing::warn!(
                session = %id,
                recipient = %address,
                delivered,
                total,
                "delivery stopped part-way: {source:#}"
            );
            SessionError::DeliveryFailed {
                delivered,
                total,
                source,
            }
        };

        let text_sent = if let Some(text) = message.body() {
            connection
                .send_text(&address, text)
                .await
                .map_err(|e| failed(delivered, e))?;
            delivered += 1;
            true
        } else {
            false
        };

        for attachment in &message.attachments {
            let media = attachment.to_media();
            tracing::debug!(
                session = %id,
                kind = media.kind(),
                bytes = media.data().len(),
                "sending attachment"
            );
            connection
                .send_media(&address, media)
                .await
                .map_err(|e| failed(delivered, e))?;
            delivered += 1;
        }

        tracing::info!(session = %id, recipient = %address, parts = delivered, "message delivered");
        Ok(DeliveryReport {
            session: id,
            recipient: address.to_string(),
            text_sent,
            attachments_sent: message.attachments.len(),
        })
    }
}
