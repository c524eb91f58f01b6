use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    Ack, Backoff, Connection, ConnectionState, History, Inbound, Outbound, RecentWindow,
    ResyncCursor, RoomContext, SessionNotice, SystemNotice, Transport, TransportEvent,
};
use crate::config::SessionConfig;
use crate::error::{ChannelError, ConnectError, DesyncError, SendError};
use crate::transcript::{DeliveryState, Message, Nonce, TranscriptStore};

const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_millis(50);

/// Requests from [`super::SessionHandle`].
pub(super) enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Nonce>,
    },
    Resend {
        nonce: Nonce,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Reconnect,
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Results reported back by background tasks.
pub(super) enum Event {
    Attempting {
        epoch: u64,
    },
    ConnectResult {
        epoch: u64,
        result: Result<Connection, ConnectError>,
    },
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    SendResult {
        nonce: Nonce,
        attempt: u64,
        result: Result<Ack, SendError>,
    },
    AckTimeout {
        nonce: Nonce,
        attempt: u64,
    },
    Resynced {
        result: Result<Vec<Inbound>, DesyncError>,
    },
}

struct InFlight {
    attempt: u64,
    send: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl InFlight {
    fn cancel(self) {
        self.send.abort();
        self.timer.abort();
    }
}

/// The only code allowed to touch the transcript store. Background tasks
/// (connect attempts, sends, ack timers, inbound forwarding, resync) report
/// back through the bounded event queue and are applied here in order.
pub(super) struct Worker<T, H> {
    context: RoomContext,
    transport: Arc<T>,
    history: Arc<H>,
    config: SessionConfig,
    store: TranscriptStore,
    dedup: RecentWindow,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
    events: mpsc::Sender<Event>,
    // Bumped on every connect attempt; events tagged with an older epoch
    // belong to a link that is gone.
    epoch: u64,
    next_attempt: u64,
    outbox: VecDeque<Nonce>,
    in_flight: HashMap<Nonce, InFlight>,
    connecting: Option<JoinHandle<()>>,
    inbound: Option<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
    consecutive_failures: u32,
    last_seen: Instant,
    ever_connected: bool,
}

impl<T, H> Worker<T, H>
where
    T: Transport,
    H: History,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        context: RoomContext,
        transport: Arc<T>,
        history: Arc<H>,
        config: SessionConfig,
        store: TranscriptStore,
        state: watch::Sender<ConnectionState>,
        notices: broadcast::Sender<SessionNotice>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let dedup = RecentWindow::new(config.dedup_window);
        let backoff = Backoff::new(config.backoff_initial(), config.backoff_max());
        Self {
            context,
            transport,
            history,
            config,
            store,
            dedup,
            backoff,
            state,
            notices,
            events,
            epoch: 0,
            next_attempt: 0,
            outbox: VecDeque::new(),
            in_flight: HashMap::new(),
            connecting: None,
            inbound: None,
            resync: None,
            consecutive_failures: 0,
            last_seen: Instant::now(),
            ever_connected: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        info!(room = %self.context.room_code, user = %self.context.user_id, "session started");
        self.schedule_connect(Duration::ZERO);

        let period = (self.config.heartbeat_timeout() / 4).max(MIN_HEARTBEAT_CHECK);
        let mut heartbeat = time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = heartbeat.tick() => self.check_heartbeat(),
            }
        }

        info!(room = %self.context.room_code, "session closed");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { text, reply } => {
                let nonce = Nonce::generate();
                let message = Message::outgoing(
                    nonce.clone(),
                    &self.context.user_id,
                    &self.context.nickname,
                    text,
                    Utc::now(),
                )
                .with_language(Some(self.context.language.clone()));
                self.store.append(message);
                let _ = reply.send(nonce.clone());
                self.dispatch(nonce);
            }
            Command::Resend { nonce, reply } => {
                let resendable = self.store.find_by_nonce(&nonce).map_or(false, |m| {
                    m.is_optimistic() && m.delivery_state() == DeliveryState::Failed
                });
                if !resendable {
                    let _ = reply.send(Err(ChannelError::NotResendable));
                    return true;
                }
                self.store.set_delivery_state(&nonce, DeliveryState::Pending);
                let _ = reply.send(Ok(()));
                self.dispatch(nonce);
            }
            Command::Reconnect => {
                info!("reconnect requested");
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
                self.backoff.reset();
                self.schedule_connect(Duration::ZERO);
            }
            Command::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Attempting { epoch } if epoch == self.epoch => {
                self.set_state(ConnectionState::Connecting);
            }
            Event::ConnectResult { epoch, result } if epoch == self.epoch => match result {
                Ok(connection) => self.on_connected(connection),
                Err(error) => self.on_connect_failed(error),
            },
            Event::Transport { epoch, event } if epoch == self.epoch => self.on_transport(event),
            Event::SendResult {
                nonce,
                attempt,
                result,
            } => match result {
                Ok(ack) => self.resolve(&nonce, ack),
                Err(error) if self.is_current(&nonce, attempt) => self.fail(&nonce, error),
                Err(error) => debug!(%nonce, %error, "ignoring result of a superseded send"),
            },
            Event::AckTimeout { nonce, attempt } => {
                if self.is_current(&nonce, attempt) {
                    self.fail(&nonce, SendError::AckTimeout);
                }
            }
            Event::Resynced { result } => self.on_resynced(result),
            Event::Attempting { .. } | Event::ConnectResult { .. } | Event::Transport { .. } => {
                debug!("ignoring event from a superseded connection");
            }
        }
    }

    fn schedule_connect(&mut self, delay: Duration) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let transport = self.transport.clone();
        let context = self.context.clone();
        let events = self.events.clone();

        self.connecting = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            if events.send(Event::Attempting { epoch }).await.is_err() {
                return;
            }
            let result = transport.open(&context).await;
            let _ = events.send(Event::ConnectResult { epoch, result }).await;
        }));
    }

    fn on_connected(&mut self, connection: Connection) {
        self.connecting = None;
        self.backoff.reset();
        self.consecutive_failures = 0;
        self.last_seen = Instant::now();
        self.set_state(ConnectionState::Connected);
        self.forward_inbound(connection);

        if self.ever_connected {
            info!(room = %self.context.room_code, "reconnected, requesting resync");
            self.notify(SessionNotice::Reconnected);
            self.request_resync();
        } else {
            info!(room = %self.context.room_code, "connected");
            self.ever_connected = true;
            self.notify(SessionNotice::Connected);
            self.announce(SystemNotice::Joined);
        }

        while let Some(nonce) = self.outbox.pop_front() {
            self.dispatch(nonce);
        }
    }

    fn on_connect_failed(&mut self, error: ConnectError) {
        self.connecting = None;
        self.consecutive_failures += 1;
        warn!(attempt = self.consecutive_failures, %error, "connect failed");
        if self.consecutive_failures >= self.config.connect_failure_notice_after {
            self.notify(SessionNotice::ConnectFailing {
                attempts: self.consecutive_failures,
                error,
            });
        }
        self.set_state(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        debug!(?delay, "scheduling reconnect");
        self.schedule_connect(delay);
    }

    fn forward_inbound(&mut self, mut connection: Connection) {
        if let Some(task) = self.inbound.take() {
            task.abort();
        }
        let epoch = self.epoch;
        let events = self.events.clone();
        self.inbound = Some(tokio::spawn(async move {
            while let Some(event) = connection.events.recv().await {
                if events.send(Event::Transport { epoch, event }).await.is_err() {
                    return;
                }
            }
            let closed = TransportEvent::Closed("transport stream ended".to_string());
            let _ = events.send(Event::Transport { epoch, event: closed }).await;
        }));
    }

    fn on_transport(&mut self, event: TransportEvent) {
        self.last_seen = Instant::now();
        match event {
            TransportEvent::Message(inbound) => self.ingest(inbound),
            TransportEvent::Heartbeat => {}
            TransportEvent::Closed(reason) => self.on_disconnected(&reason),
        }
    }

    fn on_disconnected(&mut self, reason: &str) {
        if self.current_state() != ConnectionState::Connected {
            return;
        }
        warn!(%reason, "connection lost");
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        debug!(?delay, "scheduling reconnect");
        self.schedule_connect(delay);
    }

    fn check_heartbeat(&mut self) {
        if self.current_state() == ConnectionState::Connected
            && self.last_seen.elapsed() >= self.config.heartbeat_timeout()
        {
            self.on_disconnected("heartbeat missed");
        }
    }

    fn drop_link(&mut self) {
        if let Some(task) = self.inbound.take() {
            task.abort();
        }
    }

    /// Live and resync events both land here.
    fn ingest(&mut self, inbound: Inbound) {
        if self.dedup.contains_id(&inbound.id) || self.store.contains_id(&inbound.id) {
            debug!(id = %inbound.id, "dropping duplicate event");
            return;
        }

        if let Some(nonce) = inbound.nonce.clone() {
            let local = self.store.find_by_nonce(&nonce).map(Message::is_optimistic);
            match local {
                Some(true) => {
                    let ack = Ack {
                        id: inbound.id,
                        timestamp: inbound.timestamp,
                    };
                    self.resolve(&nonce, ack);
                    return;
                }
                Some(false) => {
                    debug!(%nonce, id = %inbound.id, "dropping redelivered message");
                    self.dedup.remember(&inbound.id, Some(&nonce));
                    return;
                }
                None if self.dedup.contains_nonce(&nonce) => {
                    debug!(%nonce, "dropping redelivered message");
                    return;
                }
                None => {}
            }
        }

        self.dedup.remember(&inbound.id, inbound.nonce.as_ref());
        let message = inbound.into_message(&self.context.user_id);
        self.store.append(message);
    }

    fn dispatch(&mut self, nonce: Nonce) {
        let Some(text) = self.store.find_by_nonce(&nonce).map(|m| m.text.clone()) else {
            return;
        };
        if self.current_state() != ConnectionState::Connected {
            debug!(%nonce, "queued until connected");
            self.outbox.push_back(nonce);
            return;
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;

        let transport = self.transport.clone();
        let events = self.events.clone();
        let payload = Outbound::Chat {
            nonce: nonce.clone(),
            text,
        };
        let sent = nonce.clone();
        let send = tokio::spawn(async move {
            let result = transport.emit(payload).await;
            let _ = events
                .send(Event::SendResult {
                    nonce: sent,
                    attempt,
                    result,
                })
                .await;
        });

        let events = self.events.clone();
        let ack_timeout = self.config.ack_timeout();
        let timed = nonce.clone();
        let timer = tokio::spawn(async move {
            time::sleep(ack_timeout).await;
            let _ = events
                .send(Event::AckTimeout {
                    nonce: timed,
                    attempt,
                })
                .await;
        });

        let flight = InFlight {
            attempt,
            send,
            timer,
        };
        if let Some(previous) = self.in_flight.insert(nonce, flight) {
            previous.cancel();
        }
    }

    fn is_current(&self, nonce: &Nonce, attempt: u64) -> bool {
        self.in_flight
            .get(nonce)
            .map_or(false, |flight| flight.attempt == attempt)
    }

    fn resolve(&mut self, nonce: &Nonce, ack: Ack) {
        if let Some(flight) = self.in_flight.remove(nonce) {
            flight.cancel();
        }
        self.outbox.retain(|queued| queued != nonce);
        self.dedup.remember(&ack.id, Some(nonce));
        if self.store.confirm(nonce, ack.id.clone(), ack.timestamp).is_none() {
            debug!(%nonce, id = %ack.id, "acknowledgment without a matching pending message");
        }
    }

    fn fail(&mut self, nonce: &Nonce, error: SendError) {
        if let Some(flight) = self.in_flight.remove(nonce) {
            flight.cancel();
        }
        warn!(%nonce, %error, "message delivery failed");
        self.store.set_delivery_state(nonce, DeliveryState::Failed);
        self.notify(SessionNotice::SendFailed {
            nonce: nonce.clone(),
            error,
        });
    }

    fn request_resync(&mut self) {
        if let Some(task) = self.resync.take() {
            task.abort();
        }
        let cursor = self
            .store
            .last_confirmed()
            .map(|m| ResyncCursor {
                after_id: m.id.clone(),
                after: Some(m.timestamp),
            })
            .unwrap_or_default();
        let history = self.history.clone();
        let events = self.events.clone();
        self.resync = Some(tokio::spawn(async move {
            let result = history.fetch_missed(&cursor).await;
            let _ = events.send(Event::Resynced { result }).await;
        }));
    }

    fn on_resynced(&mut self, result: Result<Vec<Inbound>, DesyncError>) {
        self.resync = None;
        match result {
            Ok(mut batch) => {
                info!(count = batch.len(), "applying resync batch");
                batch.sort_by(|a, b| (a.timestamp, a.id.as_str()).cmp(&(b.timestamp, b.id.as_str())));
                for inbound in batch {
                    self.ingest(inbound);
                }
            }
            Err(error) => {
                warn!(%error, "resync failed, transcript may have gaps");
                self.notify(SessionNotice::MessagesMayBeMissing(error));
            }
        }
    }

    fn announce(&self, notice: SystemNotice) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.emit(Outbound::Notice(notice)).await {
                debug!(?notice, %error, "system notice not delivered");
            }
        });
    }

    async fn shutdown(&mut self) {
        info!(room = %self.context.room_code, "closing session");
        let was_connected = self.current_state() == ConnectionState::Connected;

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.resync.take() {
            task.abort();
        }
        self.drop_link();
        for (_, flight) in self.in_flight.drain() {
            flight.cancel();
        }
        self.outbox.clear();
        for nonce in self.store.pending_nonces() {
            self.store.set_delivery_state(&nonce, DeliveryState::Failed);
        }

        if was_connected {
            let leave = self.transport.emit(Outbound::Notice(SystemNotice::Left));
            if time::timeout(LEAVE_TIMEOUT, leave).await.is_err() {
                debug!("leave notice timed out");
            }
        }
        self.transport.close().await;
        self.set_state(ConnectionState::Closed);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.current_state() != state {
            info!(?state, "connection state changed");
            self.state.send_replace(state);
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }
}
