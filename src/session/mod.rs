use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::SessionConfig;
use crate::error::{ChannelError, ConnectError, DesyncError, SendError};
use crate::transcript::{Nonce, TranscriptBuilder, TranscriptReader, TranscriptStore};

pub use backoff::Backoff;
pub use dedup::RecentWindow;
pub use transport::{
    Ack, Connection, History, Inbound, Outbound, ResyncCursor, RoomContext, SystemNotice,
    Transport, TransportEvent,
};

mod backoff;
mod dedup;
mod transport;
mod worker;

use worker::{Command, Worker};

const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Left by the user. Terminal.
    Closed,
}

/// Session-level events for the status line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    ConnectFailing { attempts: u32, error: ConnectError },
    Connected,
    Reconnected,
    MessagesMayBeMissing(DesyncError),
    SendFailed { nonce: Nonce, error: SendError },
}

/// Entry point: one logical connection per room session.
pub struct SessionChannel;

impl SessionChannel {
    /// Spawn the session writer and start connecting. Must be called inside
    /// a tokio runtime.
    pub fn open<T, H>(
        context: RoomContext,
        transport: Arc<T>,
        history: Arc<H>,
        config: SessionConfig,
        builder: TranscriptBuilder,
    ) -> SessionHandle
    where
        T: Transport,
        H: History,
    {
        let capacity = config.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (notice_tx, _) = broadcast::channel(NOTICE_BUFFER);

        let store = TranscriptStore::new(builder);
        let reader = store.reader();

        let worker = Worker::new(
            context,
            transport,
            history,
            config,
            store,
            state_tx,
            notice_tx.clone(),
            event_tx,
        );
        tokio::spawn(worker.run(command_rx, event_rx));

        SessionHandle {
            commands: command_tx,
            state: state_rx,
            notices: notice_tx,
            reader,
        }
    }
}

/// Cloneable front of a running session. Every mutation is queued to the
/// session writer; nothing here touches the transcript directly.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
    reader: TranscriptReader,
}

impl SessionHandle {
    /// Queue `text` for delivery. Resolves once the optimistic entry is in
    /// the transcript; delivery continues in the background.
    pub async fn send(&self, text: impl Into<String>) -> Result<Nonce, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send {
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Retry a message whose delivery failed.
    pub async fn resend(&self, nonce: Nonce) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Resend { nonce, reply }).await?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Drop the current link and connect again right away.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        self.request(Command::Reconnect).await
    }

    /// Leave the room. Pending sends are marked failed and no further
    /// reconnects happen.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }).await?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn reader(&self) -> TranscriptReader {
        self.reader.clone()
    }

    async fn request(&self, command: Command) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}
