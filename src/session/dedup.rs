use std::collections::{HashSet, VecDeque};

use crate::transcript::{MessageId, Nonce};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Seen {
    Id(MessageId),
    Nonce(Nonce),
}

/// Bounded memory of recently processed ids and nonces. Oldest entries are
/// forgotten first.
#[derive(Debug)]
pub struct RecentWindow {
    capacity: usize,
    order: VecDeque<Seen>,
    seen: HashSet<Seen>,
}

impl RecentWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.seen.contains(&Seen::Id(id.clone()))
    }

    pub fn contains_nonce(&self, nonce: &Nonce) -> bool {
        self.seen.contains(&Seen::Nonce(nonce.clone()))
    }

    pub fn remember(&mut self, id: &MessageId, nonce: Option<&Nonce>) {
        self.push(Seen::Id(id.clone()));
        if let Some(nonce) = nonce {
            self.push(Seen::Nonce(nonce.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn push(&mut self, key: Seen) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_ids_and_nonces() {
        let mut window = RecentWindow::new(8);
        window.remember(&MessageId::new("a"), Some(&Nonce::new("n")));

        assert!(window.contains_id(&MessageId::new("a")));
        assert!(window.contains_nonce(&Nonce::new("n")));
        assert!(!window.contains_id(&MessageId::new("n")));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut window = RecentWindow::new(2);
        window.remember(&MessageId::new("a"), None);
        window.remember(&MessageId::new("b"), None);
        window.remember(&MessageId::new("a"), None);
        window.remember(&MessageId::new("c"), None);

        assert!(!window.contains_id(&MessageId::new("a")));
        assert!(window.contains_id(&MessageId::new("b")));
        assert!(window.contains_id(&MessageId::new("c")));
    }
}
