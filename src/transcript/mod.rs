use std::ops::Range;

pub use builder::{Entry, TranscriptBuilder};
pub use message::{DeliveryState, Message, MessageId, MessageKind, Nonce};
pub use store::{Snapshot, TranscriptReader, TranscriptStore};

mod builder;
mod message;
mod store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new entry was inserted.
    Appended,
    /// Existing entries changed annotation, delivery state or position.
    Updated,
}

/// Emitted to presentation consumers after every store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptChange {
    pub range: Range<usize>,
    pub kind: ChangeKind,
}
