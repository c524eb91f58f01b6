use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Utc};
use std::ops::Range;
use std::sync::Arc;

use super::message::{Message, MessageKind};

/// Places messages in the ordered transcript and derives their display
/// annotations from neighbouring entries.
///
/// Annotations of an entry depend on its predecessor (`is_first_of_day`,
/// `show_avatar`) and on its successor (`show_timestamp`), so every
/// operation here re-annotates at most the inserted entry and the two
/// entries touching it.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptBuilder {
    offset: FixedOffset,
}

impl TranscriptBuilder {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Day boundaries and minute buckets follow the client's local calendar.
    pub fn local() -> Self {
        Self::new(Local::now().offset().fix())
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    fn day(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset).date_naive()
    }

    fn minute_bucket(&self, ts: DateTime<Utc>) -> i64 {
        (ts.timestamp() + i64::from(self.offset.local_minus_utc())).div_euclid(60)
    }

    pub fn same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.day(a) == self.day(b)
    }

    pub fn same_display_minute(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.minute_bucket(a) == self.minute_bucket(b)
    }

    /// Whether `next` collapses the timestamp of `prev` onto itself.
    /// System notices never group with anything.
    fn shares_timestamp(&self, prev: &Message, next: &Message) -> bool {
        prev.kind != MessageKind::System
            && next.kind != MessageKind::System
            && prev.sender_id == next.sender_id
            && self.same_display_minute(prev.timestamp, next.timestamp)
    }

    fn suppresses_avatar(&self, prev: &Message, next: &Message) -> bool {
        prev.kind == MessageKind::ReceivedFromOther
            && next.kind == MessageKind::ReceivedFromOther
            && prev.sender_id == next.sender_id
            && self.same_display_minute(prev.timestamp, next.timestamp)
    }

    /// `(is_first_of_day, show_avatar)` of `m` given its predecessor.
    fn annotations(&self, prev: Option<&Message>, m: &Message) -> (bool, bool) {
        let first_of_day = prev.map_or(true, |p| !self.same_day(p.timestamp, m.timestamp));
        let show_avatar = match m.kind {
            MessageKind::System => false,
            _ => prev.map_or(true, |p| !self.suppresses_avatar(p, m)),
        };
        (first_of_day, show_avatar)
    }

    /// Recompute the link between `log[at - 1]` and `log[at]`. Entries are
    /// only written when an annotation actually changes.
    fn relink<E: Entry>(&self, log: &mut [E], at: usize) {
        let (before, rest) = log.split_at_mut(at);
        let Some(m) = rest.first_mut() else {
            return;
        };
        let prev = before.last_mut();

        let annotations = self.annotations(prev.as_deref().map(E::message), m.message());
        if (m.message().is_first_of_day(), m.message().show_avatar()) != annotations {
            let m = m.message_mut();
            m.set_is_first_of_day(annotations.0);
            m.set_show_avatar(annotations.1);
        }

        if let Some(prev) = prev {
            let show = !self.shares_timestamp(prev.message(), m.message());
            set_show_timestamp(prev, show);
        }
    }

    fn slot_for<E: Entry>(&self, log: &[E], m: &Message) -> usize {
        let key = m.order_key();
        match log.last() {
            Some(last) if last.message().order_key() > key => {
                log.partition_point(|existing| existing.message().order_key() <= key)
            }
            _ => log.len(),
        }
    }

    /// Insert `m` at its chronological slot and return the range of entries
    /// whose annotations may have changed.
    pub fn insert<E: Entry>(&self, log: &mut Vec<E>, mut m: E) -> Range<usize> {
        let at = self.slot_for(log, m.message());
        set_show_timestamp(&mut m, true);
        log.insert(at, m);
        self.relink(log, at);
        self.relink(log, at + 1);
        at.saturating_sub(1)..(at + 2).min(log.len())
    }

    /// Re-place `log[index]` after its timestamp or id changed, e.g. when a
    /// server acknowledgment overwrote a provisional send time.
    pub fn reposition<E: Entry>(&self, log: &mut Vec<E>, index: usize) -> Range<usize> {
        if index >= log.len() {
            return index..index;
        }

        let in_order = {
            let key = log[index].message().order_key();
            let after_prev = index == 0 || log[index - 1].message().order_key() <= key;
            let before_next =
                index + 1 == log.len() || key <= log[index + 1].message().order_key();
            after_prev && before_next
        };
        if in_order {
            set_show_timestamp(&mut log[index], true);
            self.relink(log, index);
            self.relink(log, index + 1);
            return index.saturating_sub(1)..(index + 2).min(log.len());
        }

        let moved = log.remove(index);
        if index < log.len() {
            self.relink(log, index);
        } else if let Some(tail) = log.last_mut() {
            set_show_timestamp(tail, true);
        }
        let inserted = self.insert(log, moved);
        let start = index.saturating_sub(1).min(inserted.start);
        let end = (index + 2).max(inserted.end).min(log.len());
        start..end
    }

    /// Feed a batch (history backfill) one message at a time in chronological
    /// order so the outcome equals replaying the live stream.
    pub fn extend<E: Entry>(&self, log: &mut Vec<E>, mut batch: Vec<E>) -> Option<Range<usize>> {
        batch.sort_by(|a, b| a.message().order_key().cmp(&b.message().order_key()));
        let mut changed: Option<Range<usize>> = None;
        for m in batch {
            let range = self.insert(log, m);
            changed = Some(match changed {
                // Earlier ranges shift right by one when a later insert lands before them.
                Some(prev) => prev.start.min(range.start)..(prev.end + 1).max(range.end).min(log.len()),
                None => range,
            });
        }
        changed
    }
}

fn set_show_timestamp<E: Entry>(entry: &mut E, show: bool) {
    if entry.message().show_timestamp() != show {
        entry.message_mut().set_show_timestamp(show);
    }
}

/// A slot in a transcript log the builder can annotate in place.
///
/// Implemented for bare messages and for the shared `Arc<Message>` entries
/// of the transcript store, where writing copies only the touched entry.
pub trait Entry {
    fn message(&self) -> &Message;
    fn message_mut(&mut self) -> &mut Message;
}

impl Entry for Message {
    fn message(&self) -> &Message {
        self
    }

    fn message_mut(&mut self) -> &mut Message {
        self
    }
}

impl Entry for Arc<Message> {
    fn message(&self) -> &Message {
        self
    }

    fn message_mut(&mut self) -> &mut Message {
        Arc::make_mut(self)
    }
}

impl Default for TranscriptBuilder {
    fn default() -> Self {
        Self::local()
    }
}
