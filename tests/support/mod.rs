#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use babelroom::config::SessionConfig;
use babelroom::error::{ConnectError, DesyncError, SendError};
use babelroom::session::{
    Ack, Connection, History, Inbound, Outbound, ResyncCursor, RoomContext, SessionChannel,
    SessionHandle, SessionNotice, Transport, TransportEvent,
};
use babelroom::transcript::{Message, MessageId, Nonce, TranscriptBuilder};

pub const ME: &str = "me";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Immediate,
    /// The relay swallows the message and never answers.
    Never,
    Reject,
}

struct State {
    fail_opens: u32,
    opens: u32,
    live: Option<mpsc::Sender<TransportEvent>>,
    emitted: Vec<Outbound>,
    ack: AckMode,
    next_id: u64,
    history: Vec<Inbound>,
    history_fails: u32,
    cursors: Vec<ResyncCursor>,
    closed: bool,
}

/// In-memory room link driven step by step from a test.
pub struct ScriptedTransport {
    state: Mutex<State>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                fail_opens: 0,
                opens: 0,
                live: None,
                emitted: Vec::new(),
                ack: AckMode::Immediate,
                next_id: 0,
                history: Vec::new(),
                history_fails: 0,
                cursors: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().unwrap().fail_opens = n;
    }

    pub fn set_ack(&self, mode: AckMode) {
        self.state.lock().unwrap().ack = mode;
    }

    pub fn set_history(&self, history: Vec<Inbound>) {
        self.state.lock().unwrap().history = history;
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().unwrap().history_fails = n;
    }

    /// Deliver an event on the current link. Returns false when offline.
    pub fn push(&self, inbound: Inbound) -> bool {
        self.push_event(TransportEvent::Message(inbound))
    }

    pub fn push_event(&self, event: TransportEvent) -> bool {
        let state = self.state.lock().unwrap();
        match &state.live {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Cut the current link as if the network went away.
    pub fn drop_link(&self) {
        self.state.lock().unwrap().live = None;
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn emitted(&self) -> Vec<Outbound> {
        self.state.lock().unwrap().emitted.clone()
    }

    pub fn chat_texts(&self) -> Vec<String> {
        self.emitted()
            .into_iter()
            .filter_map(|payload| match payload {
                Outbound::Chat { text, .. } => Some(text),
                Outbound::Notice(_) => None,
            })
            .collect()
    }

    pub fn cursors(&self) -> Vec<ResyncCursor> {
        self.state.lock().unwrap().cursors.clone()
    }
}

impl Transport for ScriptedTransport {
    async fn open(&self, _context: &RoomContext) -> Result<Connection, ConnectError> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(ConnectError::Refused("scripted failure".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.live = Some(tx);
        Ok(Connection { events: rx })
    }

    async fn emit(&self, payload: Outbound) -> Result<Ack, SendError> {
        let (mode, id) = {
            let mut state = self.state.lock().unwrap();
            // Only chat payloads take a number, so join/leave notices never
            // shift the ids tests expect.
            let id = match &payload {
                Outbound::Chat { .. } => {
                    state.next_id += 1;
                    format!("srv-{}", state.next_id)
                }
                Outbound::Notice(notice) => format!("notice-{:?}", notice),
            };
            state.emitted.push(payload);
            (state.ack, id)
        };
        match mode {
            AckMode::Immediate => Ok(Ack {
                id: MessageId::new(id),
                timestamp: Utc::now(),
            }),
            AckMode::Reject => Err(SendError::Rejected("scripted rejection".to_string())),
            AckMode::Never => std::future::pending::<Result<Ack, SendError>>().await,
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.live = None;
        state.closed = true;
    }
}

impl History for ScriptedTransport {
    async fn fetch_missed(&self, cursor: &ResyncCursor) -> Result<Vec<Inbound>, DesyncError> {
        let mut state = self.state.lock().unwrap();
        state.cursors.push(cursor.clone());
        if state.history_fails > 0 {
            state.history_fails -= 1;
            return Err(DesyncError("history unavailable".to_string()));
        }
        let after = cursor.after;
        Ok(state
            .history
            .iter()
            .filter(|m| after.map_or(true, |after| m.timestamp >= after))
            .cloned()
            .collect())
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        ack_timeout_ms: 1_000,
        backoff_initial_ms: 100,
        backoff_max_ms: 1_000,
        connect_failure_notice_after: 3,
        dedup_window: 64,
        heartbeat_timeout_ms: 3_600_000,
        queue_capacity: 64,
    }
}

pub fn context() -> RoomContext {
    RoomContext {
        room_code: "554305".to_string(),
        user_id: ME.to_string(),
        nickname: "mina".to_string(),
        language: "ko".to_string(),
    }
}

pub fn open_session(transport: &Arc<ScriptedTransport>, config: SessionConfig) -> SessionHandle {
    SessionChannel::open(
        context(),
        transport.clone(),
        transport.clone(),
        config,
        TranscriptBuilder::utc(),
    )
}

/// Let the session worker and its tasks drain everything runnable.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn base_time() -> DateTime<Utc> {
    Utc::now() - ChronoDuration::minutes(10)
}

pub fn from_other(id: &str, text: &str, at: DateTime<Utc>) -> Inbound {
    Inbound {
        id: MessageId::new(id),
        nonce: None,
        sender_id: "other".to_string(),
        sender_name: "jun".to_string(),
        text: text.to_string(),
        translated_text: None,
        language: Some("en".to_string()),
        timestamp: at,
        system: false,
    }
}

pub fn echo_of(id: &str, nonce: &Nonce, text: &str, at: DateTime<Utc>) -> Inbound {
    Inbound {
        id: MessageId::new(id),
        nonce: Some(nonce.clone()),
        sender_id: ME.to_string(),
        sender_name: "mina".to_string(),
        text: text.to_string(),
        translated_text: None,
        language: Some("ko".to_string()),
        timestamp: at,
        system: false,
    }
}

pub fn texts(log: &[Arc<Message>]) -> Vec<&str> {
    log.iter().map(|m| m.text.as_str()).collect()
}

pub fn ids(log: &[Arc<Message>]) -> Vec<Option<&str>> {
    log.iter().map(|m| m.id.as_ref().map(MessageId::as_str)).collect()
}

pub fn drain(rx: &mut broadcast::Receiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        out.push(notice);
    }
    out
}
