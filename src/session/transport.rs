use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;

use crate::error::{ConnectError, DesyncError, SendError};
use crate::transcript::{Message, MessageId, MessageKind, Nonce};

/// Who is talking in which room. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    pub room_code: String,
    pub user_id: String,
    pub nickname: String,
    pub language: String,
}

/// A message as delivered by the room, live or from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub id: MessageId,
    pub nonce: Option<Nonce>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub translated_text: Option<String>,
    pub language: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub system: bool,
}

impl Inbound {
    /// Classify against the local user and build the transcript entry.
    pub fn into_message(self, me: &str) -> Message {
        let kind = if self.system {
            MessageKind::System
        } else if self.sender_id == me {
            MessageKind::SentByMe
        } else {
            MessageKind::ReceivedFromOther
        };
        Message::confirmed(
            self.id,
            kind,
            self.sender_id,
            self.sender_name,
            self.text,
            self.timestamp,
        )
        .with_nonce(self.nonce)
        .with_translation(self.translated_text)
        .with_language(self.language)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemNotice {
    Joined,
    Left,
}

impl SystemNotice {
    pub fn describe(&self, nickname: &str) -> String {
        match self {
            SystemNotice::Joined => format!("{} joined the room", nickname),
            SystemNotice::Left => format!("{} left the room", nickname),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Chat { nonce: Nonce, text: String },
    Notice(SystemNotice),
}

/// Server acknowledgment of an emitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Inbound),
    /// Any sign of life from the link.
    Heartbeat,
    Closed(String),
}

/// An open link. The session owns the receiving half; dropping it tells the
/// transport to stop forwarding.
pub struct Connection {
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Where a post-reconnect fetch should start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncCursor {
    pub after_id: Option<MessageId>,
    pub after: Option<DateTime<Utc>>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        context: &RoomContext,
    ) -> impl Future<Output = Result<Connection, ConnectError>> + Send;

    fn emit(&self, payload: Outbound) -> impl Future<Output = Result<Ack, SendError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait History: Send + Sync + 'static {
    fn fetch_missed(
        &self,
        cursor: &ResyncCursor,
    ) -> impl Future<Output = Result<Vec<Inbound>, DesyncError>> + Send;
}
