//! Message identifiers and duplicate suppression

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Per-link identifier correlating a request with its response.
///
/// Rendered as four upper-case hex digits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s.trim(), 16).map(MessageId)
    }
}

/// Wrapping message id generator.
///
/// Owned by a single link worker and advanced once per outbound request.
#[derive(Debug, Clone, Default)]
pub struct MessageIdCounter {
    next: u16,
}

impl MessageIdCounter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter starting at `first`
    pub fn starting_at(first: u16) -> Self {
        Self { next: first }
    }

    /// Take the next id
    pub fn advance(&mut self) -> MessageId {
        let id = MessageId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Peek at the id the next request will use
    pub fn peek(&self) -> MessageId {
        MessageId(self.next)
    }
}

/// Small FIFO of recently seen ids.
///
/// Devices may retransmit an event before they see our acknowledgement;
/// anything still in the ring is a duplicate.
#[derive(Debug, Clone)]
pub struct RecentIds<T> {
    ring: VecDeque<T>,
    capacity: usize,
}

impl<T: PartialEq> RecentIds<T> {
    /// Default ring size
    pub const DEFAULT_CAPACITY: usize = 16;

    /// Create a ring holding at most `capacity` ids
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`, returning `false` if it was already present
    pub fn insert(&mut self, id: T) -> bool {
        if self.ring.contains(&id) {
            return false;
        }
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(id);
        true
    }

    /// Check membership without recording
    pub fn contains(&self, id: &T) -> bool {
        self.ring.contains(id)
    }

    /// Number of ids held
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<T: PartialEq> Default for RecentIds<T> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_wraps() {
        let mut ids = MessageIdCounter::starting_at(0xFFFE);
        assert_eq!(ids.advance(), MessageId(0xFFFE));
        assert_eq!(ids.advance(), MessageId(0xFFFF));
        assert_eq!(ids.advance(), MessageId(0x0000));
        assert_eq!(ids.peek(), MessageId(0x0001));
    }

    #[test]
    fn test_render_and_parse() {
        assert_eq!(MessageId(0x2a).to_string(), "002A");
        assert_eq!("002a".parse::<MessageId>().unwrap(), MessageId(0x2a));
        assert!("zz".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(3);
        assert!(recent.insert(1));
        assert!(recent.insert(2));
        assert!(recent.insert(3));
        assert!(!recent.insert(2));
        assert!(recent.insert(4));
        assert_eq!(recent.len(), 3);
        assert!(!recent.contains(&1));
        // 1 fell out of the ring, so a late retransmit is accepted again
        assert!(recent.insert(1));
    }
}
