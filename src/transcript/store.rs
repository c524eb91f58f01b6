use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::{ChangeKind, DeliveryState, Message, MessageId, Nonce, TranscriptBuilder, TranscriptChange};

const CHANGE_BUFFER: usize = 256;

/// Ordered log of one room session.
///
/// Owned by the session writer; everybody else looks at it through a
/// [`TranscriptReader`].
pub struct TranscriptStore {
    builder: TranscriptBuilder,
    messages: Vec<Arc<Message>>,
    ids: HashSet<MessageId>,
    changes: broadcast::Sender<TranscriptChange>,
    snapshot: watch::Sender<Snapshot>,
}

/// Published view of the log. Entries are shared with the store, so a
/// snapshot only copies pointers and an edit copies just the touched entry.
pub type Snapshot = Arc<Vec<Arc<Message>>>;

impl TranscriptStore {
    pub fn new(builder: TranscriptBuilder) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            builder,
            messages: Vec::new(),
            ids: HashSet::new(),
            changes,
            snapshot,
        }
    }

    pub fn builder(&self) -> &TranscriptBuilder {
        &self.builder
    }

    /// Returns `None` when an entry with the same confirmed id is already
    /// present.
    pub fn append(&mut self, message: Message) -> Option<TranscriptChange> {
        if let Some(id) = &message.id {
            if !self.ids.insert(id.clone()) {
                return None;
            }
        }
        let range = self.builder.insert(&mut self.messages, Arc::new(message));
        Some(self.publish(range, ChangeKind::Appended))
    }

    pub fn append_batch(&mut self, batch: Vec<Message>) -> Option<TranscriptChange> {
        let fresh: Vec<Arc<Message>> = batch
            .into_iter()
            .filter(|m| m.id.as_ref().map_or(true, |id| self.ids.insert(id.clone())))
            .map(Arc::new)
            .collect();
        let range = self.builder.extend(&mut self.messages, fresh)?;
        Some(self.publish(range, ChangeKind::Appended))
    }

    /// Attach the server identity to the optimistic entry carrying `nonce`.
    /// An entry that already has an id keeps it.
    pub fn confirm(
        &mut self,
        nonce: &Nonce,
        id: MessageId,
        timestamp: DateTime<Utc>,
    ) -> Option<TranscriptChange> {
        if self.ids.contains(&id) {
            return None;
        }
        let index = self.position_of_nonce(nonce)?;
        if !self.messages[index].is_optimistic() {
            return None;
        }
        self.ids.insert(id.clone());
        Arc::make_mut(&mut self.messages[index]).confirm(id, timestamp);
        let range = self.builder.reposition(&mut self.messages, index);
        Some(self.publish(range, ChangeKind::Updated))
    }

    pub fn set_delivery_state(
        &mut self,
        nonce: &Nonce,
        state: DeliveryState,
    ) -> Option<TranscriptChange> {
        let index = self.position_of_nonce(nonce)?;
        if self.messages[index].delivery_state() == state {
            return None;
        }
        Arc::make_mut(&mut self.messages[index]).set_delivery_state(state);
        Some(self.publish(index..index + 1, ChangeKind::Updated))
    }

    pub fn read_range(&self, range: Range<usize>) -> &[Arc<Message>] {
        let end = range.end.min(self.messages.len());
        let start = range.start.min(end);
        &self.messages[start..end]
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn find_by_nonce(&self, nonce: &Nonce) -> Option<&Message> {
        self.position_of_nonce(nonce).map(|i| self.messages[i].as_ref())
    }

    /// Newest entry the server has acknowledged; resync starts after it.
    pub fn last_confirmed(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id.is_some()).map(Arc::as_ref)
    }

    pub fn pending_nonces(&self) -> Vec<Nonce> {
        self.messages
            .iter()
            .filter(|m| m.delivery_state() == DeliveryState::Pending)
            .filter_map(|m| m.client_nonce.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptChange> {
        self.changes.subscribe()
    }

    pub fn reader(&self) -> TranscriptReader {
        TranscriptReader {
            snapshot: self.snapshot.subscribe(),
            changes: self.changes.clone(),
        }
    }

    // Pending entries sit near the tail, so search backwards.
    fn position_of_nonce(&self, nonce: &Nonce) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.client_nonce.as_ref() == Some(nonce))
    }

    fn publish(&self, range: Range<usize>, kind: ChangeKind) -> TranscriptChange {
        self.snapshot.send_replace(Arc::new(self.messages.clone()));
        let change = TranscriptChange { range, kind };
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        change
    }
}

/// Read-only view handed to presentation.
#[derive(Clone)]
pub struct TranscriptReader {
    snapshot: watch::Receiver<Snapshot>,
    changes: broadcast::Sender<TranscriptChange>,
}

impl TranscriptReader {
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptChange> {
        self.changes.subscribe()
    }

    /// Wait until the writer publishes a newer snapshot. Fails once the
    /// store is gone.
    pub async fn changed(&mut self) -> Result<Snapshot, watch::error::RecvError> {
        self.snapshot.changed().await?;
        Ok(self.snapshot.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::MessageKind;
    use chrono::TimeZone;

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, m, s).unwrap()
    }

    fn received(id: &str, ts: DateTime<Utc>) -> Message {
        Message::confirmed(MessageId::new(id), MessageKind::ReceivedFromOther, "u", "u", "x", ts)
    }

    #[test]
    fn append_rejects_known_ids() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        assert!(store.append(received("a", at(0, 0))).is_some());
        assert!(store.append(received("a", at(0, 0))).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_batch_skips_known_ids_and_keeps_order() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        store.append(received("b", at(1, 0)));

        let change = store
            .append_batch(vec![received("c", at(2, 0)), received("b", at(1, 0)), received("a", at(0, 0))])
            .unwrap();

        assert_eq!(change.kind, ChangeKind::Appended);
        let ids: Vec<&str> = store
            .read_range(0..10)
            .iter()
            .map(|m| m.id.as_ref().unwrap().as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn confirm_assigns_id_once() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        let nonce = Nonce::new("n");
        store.append(Message::outgoing(nonce.clone(), "me", "me", "hi", at(0, 0)));

        let change = store.confirm(&nonce, MessageId::new("srv"), at(0, 1)).unwrap();

        assert_eq!(change.kind, ChangeKind::Updated);
        assert!(store.contains_id(&MessageId::new("srv")));
        assert_eq!(store.find_by_nonce(&nonce).unwrap().delivery_state(), DeliveryState::Sent);
        assert!(store.confirm(&nonce, MessageId::new("srv"), at(0, 1)).is_none());
        assert_eq!(store.last_confirmed().unwrap().id, Some(MessageId::new("srv")));
    }

    #[test]
    fn confirm_leaves_an_already_confirmed_entry_alone() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        let nonce = Nonce::new("n");
        store.append(Message::outgoing(nonce.clone(), "me", "me", "hi", at(0, 0)));
        store.confirm(&nonce, MessageId::new("echo"), at(0, 1)).unwrap();

        // A late result from a second attempt carries a different id.
        assert!(store.confirm(&nonce, MessageId::new("retry"), at(0, 5)).is_none());

        let entry = store.find_by_nonce(&nonce).unwrap();
        assert_eq!(entry.id, Some(MessageId::new("echo")));
        assert_eq!(entry.timestamp, at(0, 1));
        assert!(!store.contains_id(&MessageId::new("retry")));
    }

    #[test]
    fn delivery_state_changes_are_published_once() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        let mut changes = store.subscribe();
        let nonce = Nonce::new("n");
        store.append(Message::outgoing(nonce.clone(), "me", "me", "hi", at(0, 0)));

        assert!(store.set_delivery_state(&nonce, DeliveryState::Failed).is_some());
        assert!(store.set_delivery_state(&nonce, DeliveryState::Failed).is_none());

        assert_eq!(changes.try_recv().unwrap().kind, ChangeKind::Appended);
        assert_eq!(
            changes.try_recv().unwrap(),
            TranscriptChange { range: 0..1, kind: ChangeKind::Updated }
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn reader_sees_published_snapshots() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        let reader = store.reader();
        assert!(reader.snapshot().is_empty());

        store.append(received("a", at(0, 0)));

        assert_eq!(reader.snapshot().len(), 1);
        assert_eq!(store.snapshot().len(), 1);
        assert!(store.read_range(5..9).is_empty());
    }

    #[test]
    fn snapshots_share_untouched_entries() {
        let mut store = TranscriptStore::new(TranscriptBuilder::utc());
        let nonce = Nonce::new("n");
        store.append(received("a", at(0, 0)));
        store.append(Message::outgoing(nonce.clone(), "me", "me", "hi", at(3, 0)));
        let before = store.snapshot();

        store.set_delivery_state(&nonce, DeliveryState::Failed);
        let after = store.snapshot();

        assert!(Arc::ptr_eq(&before[0], &after[0]));
        assert!(!Arc::ptr_eq(&before[1], &after[1]));
        assert_eq!(before[1].delivery_state(), DeliveryState::Pending);
        assert_eq!(after[1].delivery_state(), DeliveryState::Failed);
    }
}
