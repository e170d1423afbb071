//! Packed event sets.
//!
//! States carry three of these (defers, transition triggers, do triggers)
//! and receive declarations carry one. Membership tests happen on every
//! dequeue, so the representation is a flat bitset over event declaration
//! indices.

use serde::{Deserialize, Serialize};

const WORD_BITS: u32 = 32;

/// A set of events, packed into 32-bit words by declaration index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSet {
    words: Vec<u32>,
}

impl EventSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set containing the given event indices.
    pub fn from_events(events: &[u32]) -> Self {
        let mut set = Self::new();
        for &event in events {
            set.insert(event);
        }
        set
    }

    /// Adds an event.
    pub fn insert(&mut self, event: u32) {
        let word = (event / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (event % WORD_BITS);
    }

    /// Membership test.
    pub fn contains(&self, event: u32) -> bool {
        let word = (event / WORD_BITS) as usize;
        match self.words.get(word) {
            Some(bits) => bits & (1 << (event % WORD_BITS)) != 0,
            None => false,
        }
    }

    /// Returns `true` if no event is in the set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let set = EventSet::new();
        assert!(set.is_empty());
        assert!(!set.contains(0));
        assert!(!set.contains(1000));
    }

    #[test]
    fn test_insert_and_contains() {
        let set = EventSet::from_events(&[2, 31, 32, 95]);
        assert!(set.contains(2));
        assert!(set.contains(31));
        assert!(set.contains(32));
        assert!(set.contains(95));
        assert!(!set.contains(3));
        assert!(!set.contains(96));
        assert!(!set.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut set = EventSet::new();
        set.insert(5);
        set.insert(5);
        assert_eq!(set, EventSet::from_events(&[5]));
    }
}
