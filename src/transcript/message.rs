use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identifier of an acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated token carried by every message this client sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nonce(String);

impl Nonce {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(nonce: impl Into<String>) -> Self {
        Self(nonce.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    SentByMe,
    ReceivedFromOther,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

/// One transcript entry.
///
/// Payload fields are set at construction. The display annotations are
/// recomputed by the transcript builder from the entry's neighbours and are
/// only reachable through the setters below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<MessageId>,
    pub client_nonce: Option<Nonce>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub translated_text: Option<String>,
    pub language: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    is_first_of_day: bool,
    show_avatar: bool,
    show_timestamp: bool,
    delivery_state: DeliveryState,
}

impl Message {
    /// Optimistic local entry, shown to the sender before any acknowledgment.
    pub fn outgoing(
        nonce: Nonce,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            client_nonce: Some(nonce),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            text: text.into(),
            translated_text: None,
            language: None,
            timestamp: now,
            kind: MessageKind::SentByMe,
            is_first_of_day: true,
            show_avatar: true,
            show_timestamp: true,
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Entry that already carries a server id, e.g. one received from the room.
    pub fn confirmed(
        id: MessageId,
        kind: MessageKind,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Some(id),
            client_nonce: None,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            text: text.into(),
            translated_text: None,
            language: None,
            timestamp,
            kind,
            is_first_of_day: true,
            show_avatar: kind != MessageKind::System,
            show_timestamp: true,
            delivery_state: DeliveryState::Sent,
        }
    }

    pub fn with_nonce(mut self, nonce: Option<Nonce>) -> Self {
        self.client_nonce = nonce;
        self
    }

    pub fn with_translation(mut self, translated_text: Option<String>) -> Self {
        self.translated_text = translated_text;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn is_first_of_day(&self) -> bool {
        self.is_first_of_day
    }

    pub fn show_avatar(&self) -> bool {
        self.show_avatar
    }

    pub fn show_timestamp(&self) -> bool {
        self.show_timestamp
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.delivery_state
    }

    pub fn set_is_first_of_day(&mut self, value: bool) {
        self.is_first_of_day = value;
    }

    pub fn set_show_avatar(&mut self, value: bool) {
        self.show_avatar = value;
    }

    pub fn set_show_timestamp(&mut self, value: bool) {
        self.show_timestamp = value;
    }

    pub fn set_delivery_state(&mut self, state: DeliveryState) {
        self.delivery_state = state;
    }

    /// Adopt the server's identity for an optimistic entry.
    pub(crate) fn confirm(&mut self, id: MessageId, timestamp: DateTime<Utc>) {
        self.id = Some(id);
        self.timestamp = timestamp;
        self.delivery_state = DeliveryState::Sent;
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_none()
    }

    /// Two entries are the same logical message when their confirmed ids
    /// match, or when at least one is still optimistic and their nonces match.
    pub fn is_same_logical(&self, other: &Message) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.client_nonce, &other.client_nonce) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Sort key of the transcript: authoritative time, then id or nonce.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        let tie = self
            .id
            .as_ref()
            .map(MessageId::as_str)
            .or_else(|| self.client_nonce.as_ref().map(Nonce::as_str))
            .unwrap_or("");
        (self.timestamp, tie)
    }

    /// Text the transcript shows: translations replace the original only for
    /// messages written by someone else.
    pub fn display_text(&self) -> &str {
        match self.kind {
            MessageKind::ReceivedFromOther => {
                self.translated_text.as_deref().unwrap_or(&self.text)
            }
            MessageKind::SentByMe | MessageKind::System => &self.text,
        }
    }
}
