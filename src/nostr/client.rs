use anyhow::Result;
use chrono::{DateTime, Utc};
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Identity;
use crate::config::RelayConfig;
use crate::error::{ConnectError, DesyncError, SendError};
use crate::session::{
    Ack, Connection, History, Inbound, Outbound, ResyncCursor, RoomContext, SystemNotice,
    Transport, TransportEvent,
};
use crate::transcript::{MessageId, Nonce};

const EVENT_BUFFER: usize = 512;
const ROOM_TAG: &str = "h";

/// JSON body of a room event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    translated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notice: Option<SystemNotice>,
}

impl Envelope {
    fn outbound(payload: &Outbound, context: &RoomContext) -> Self {
        let (nonce, text, notice) = match payload {
            Outbound::Chat { nonce, text } => (Some(nonce.as_str().to_string()), text.clone(), None),
            Outbound::Notice(notice) => (None, String::new(), Some(*notice)),
        };
        Self {
            nonce,
            name: Some(context.nickname.clone()),
            text,
            translated: None,
            lang: Some(context.language.clone()),
            notice,
        }
    }
}

struct Live {
    client: Client,
    context: RoomContext,
    subscription: SubscriptionId,
}

/// Room transport over Nostr relays. Rooms are `ChannelMessage` events
/// tagged with the room code; the relay-visible event id doubles as the
/// server message id.
pub struct NostrTransport {
    identity: Identity,
    relays: Vec<String>,
    connect_timeout: Duration,
    liveness_interval: Duration,
    history_limit: usize,
    live: RwLock<Option<Live>>,
}

impl NostrTransport {
    pub fn new(identity: Identity, config: &RelayConfig) -> Self {
        Self {
            identity,
            relays: config.urls.clone(),
            connect_timeout: config.connect_timeout(),
            liveness_interval: config.liveness_interval(),
            history_limit: config.history_limit,
            live: RwLock::new(None),
        }
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    async fn current(&self) -> Option<(Client, RoomContext)> {
        self.live
            .read()
            .await
            .as_ref()
            .map(|live| (live.client.clone(), live.context.clone()))
    }

    async fn teardown(live: Live) {
        live.client.unsubscribe(live.subscription).await;
        let _ = live.client.disconnect().await;
    }
}

impl Transport for NostrTransport {
    async fn open(&self, context: &RoomContext) -> Result<Connection, ConnectError> {
        let client = Client::new(&self.identity.keys);

        let mut added = 0usize;
        for relay_url in &self.relays {
            match client.add_relay(relay_url.as_str()).await {
                Ok(_) => added += 1,
                Err(e) => warn!(relay = %relay_url, error = %e, "failed to add relay"),
            }
        }
        if added == 0 {
            return Err(ConnectError::NoRelays);
        }

        if timeout(self.connect_timeout, client.connect()).await.is_err() {
            let _ = client.disconnect().await;
            return Err(ConnectError::Timeout);
        }

        // Subscribe after grabbing the receiver so the first events are not missed.
        let mut notifications = client.notifications();
        let filter = room_filter(&context.room_code).limit(self.history_limit);
        let subscription = client.subscribe(vec![filter], None).await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let room = context.room_code.clone();
        let pool = client.clone();
        let mut ticker = interval(self.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    notification = notifications.recv() => match notification {
                        Ok(RelayPoolNotification::Event { event, .. }) => match decode(&event, &room) {
                            Some(inbound) => TransportEvent::Message(inbound),
                            None => TransportEvent::Heartbeat,
                        },
                        Ok(_) => TransportEvent::Heartbeat,
                        // A lagging or closed notification stream ends the link; the
                        // session reconnects and resyncs whatever was skipped.
                        Err(error) => TransportEvent::Closed(format!("relay notifications ended: {error}")),
                    },
                    // Quiet rooms produce no notifications, so the relay pool
                    // itself is polled to keep the link alive.
                    _ = ticker.tick() => match liveness(&relay_statuses(&pool).await) {
                        Some(event) => event,
                        None => continue,
                    },
                };
                let closing = matches!(event, TransportEvent::Closed(_));
                if closing {
                    debug!(room = %room, ?event, "room link ending");
                }
                if tx.send(event).await.is_err() || closing {
                    return;
                }
            }
        });

        let previous = self.live.write().await.replace(Live {
            client,
            context: context.clone(),
            subscription,
        });
        if let Some(previous) = previous {
            Self::teardown(previous).await;
        }

        info!(room = %context.room_code, relays = added, "subscribed to room");
        Ok(Connection { events: rx })
    }

    async fn emit(&self, payload: Outbound) -> Result<Ack, SendError> {
        let (client, context) = self.current().await.ok_or(SendError::NotConnected)?;

        let content = serde_json::to_string(&Envelope::outbound(&payload, &context))
            .map_err(|e| SendError::Rejected(e.to_string()))?;
        let tags = room_tags(&context.room_code).map_err(|e| SendError::Rejected(e.to_string()))?;
        let event = self
            .identity
            .sign_event(EventBuilder::new(Kind::ChannelMessage, content, tags))
            .map_err(|e| SendError::Rejected(e.to_string()))?;
        let timestamp = to_datetime(event.created_at());

        match client.send_event(event).await {
            Ok(event_id) => Ok(Ack {
                id: MessageId::new(event_id.to_hex()),
                timestamp,
            }),
            Err(e) => Err(SendError::Rejected(e.to_string())),
        }
    }

    async fn close(&self) {
        let live = self.live.write().await.take();
        if let Some(live) = live {
            Self::teardown(live).await;
        }
    }
}

impl History for NostrTransport {
    async fn fetch_missed(&self, cursor: &ResyncCursor) -> Result<Vec<Inbound>, DesyncError> {
        let (client, context) = self
            .current()
            .await
            .ok_or_else(|| DesyncError("not connected".to_string()))?;

        // Relays filter by whole seconds, so the cursor message itself comes
        // back too and is dropped by the session's dedup.
        let mut filter = room_filter(&context.room_code).limit(self.history_limit);
        if let Some(after) = cursor.after {
            filter = filter.since(Timestamp::from(after.timestamp().max(0) as u64));
        }

        let events = client
            .get_events_of(vec![filter], Some(self.connect_timeout))
            .await
            .map_err(|e| DesyncError(e.to_string()))?;

        let mut batch: Vec<Inbound> = events
            .iter()
            .filter_map(|event| decode(event, &context.room_code))
            .collect();
        batch.sort_by(|a, b| (a.timestamp, a.id.as_str()).cmp(&(b.timestamp, b.id.as_str())));
        debug!(count = batch.len(), since = ?cursor.after, "fetched missed messages");
        Ok(batch)
    }
}

async fn relay_statuses(client: &Client) -> Vec<RelayStatus> {
    let mut statuses = Vec::new();
    for relay in client.relays().await.values() {
        statuses.push(relay.status().await);
    }
    statuses
}

/// Map the pool's relay states to a link signal. One connected relay keeps
/// the room alive; none left standing closes it. Relays still connecting
/// say nothing and leave it to the session's heartbeat timeout.
fn liveness(statuses: &[RelayStatus]) -> Option<TransportEvent> {
    if statuses.iter().any(|status| matches!(status, RelayStatus::Connected)) {
        return Some(TransportEvent::Heartbeat);
    }
    let all_down = statuses.iter().all(|status| {
        matches!(
            status,
            RelayStatus::Disconnected | RelayStatus::Stopped | RelayStatus::Terminated
        )
    });
    all_down.then(|| TransportEvent::Closed("no relay connected".to_string()))
}

fn room_filter(room: &str) -> Filter {
    Filter::new()
        .kind(Kind::ChannelMessage)
        .custom_tag(SingleLetterTag::lowercase(Alphabet::H), vec![room.to_string()])
}

fn room_tags(room: &str) -> Result<Vec<Tag>> {
    Ok(vec![
        Tag::parse(vec![ROOM_TAG, room])?,
        Tag::parse(vec!["client", "babelroom"])?,
    ])
}

fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.as_u64() as i64, 0).unwrap_or_else(Utc::now)
}

fn decode(event: &Event, room: &str) -> Option<Inbound> {
    if event.kind() != Kind::ChannelMessage {
        return None;
    }
    let in_room = event.tags().iter().any(|tag| {
        let parts = tag.as_vec();
        parts.len() >= 2 && parts[0] == ROOM_TAG && parts[1] == room
    });
    if !in_room {
        return None;
    }

    let envelope: Envelope = match serde_json::from_str(event.content()) {
        Ok(envelope) => envelope,
        Err(error) => {
            debug!(%error, "skipping undecodable room event");
            return None;
        }
    };

    let sender_id = event.pubkey.to_hex();
    let sender_name = envelope
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("anon{}", &sender_id[..8]));
    let text = match envelope.notice {
        Some(notice) => notice.describe(&sender_name),
        None => envelope.text,
    };

    Some(Inbound {
        id: MessageId::new(event.id.to_hex()),
        nonce: envelope.nonce.map(Nonce::new),
        sender_id,
        sender_name,
        text,
        translated_text: envelope.translated,
        language: envelope.lang,
        timestamp: to_datetime(event.created_at()),
        system: envelope.notice.is_some(),
    })
}
