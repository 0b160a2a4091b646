//! Keyed deadline tracking for liveness timers.
//!
//! Every peer and server entry carries an expiry deadline that a fresh PDU
//! pushes forward. Restarting is deadline overwrite — semantically cancel
//! then schedule — so the reactor sleeps until the earliest deadline and
//! simply finds nothing expired after a stale wakeup.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// A set of keys, each with one pending deadline.
#[derive(Debug)]
pub struct DeadlineMap<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> DeadlineMap<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Arm (or re-arm) the key's deadline at `now + ttl`. An existing
    /// deadline for the key is replaced, resetting the elapsed window.
    pub fn restart(&mut self, key: K, ttl: Duration) {
        self.deadlines.insert(key, Instant::now() + ttl);
    }

    /// Drop the key's pending deadline. Returns whether one existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest pending deadline, if any. The reactor sleeps until this.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }
}

impl<K: Eq + Hash + Clone> Default for DeadlineMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest of two optional deadlines; `None` means sleep forever.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restart_resets_the_window() {
        let mut map = DeadlineMap::new();
        map.restart("peer", Duration::from_millis(50));
        let first = map.next_deadline().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        map.restart("peer", Duration::from_millis(50));
        let second = map.next_deadline().unwrap();

        assert!(second > first);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn pop_expired_returns_only_past_deadlines() {
        let mut map = DeadlineMap::new();
        map.restart("soon", Duration::from_millis(0));
        map.restart("later", Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = map.pop_expired(Instant::now());
        assert_eq!(expired, vec!["soon"]);
        assert!(map.contains(&"later"));
        assert!(!map.contains(&"soon"));
    }

    #[test]
    fn cancel_removes_the_deadline() {
        let mut map = DeadlineMap::new();
        map.restart(1u32, Duration::from_secs(1));
        assert!(map.cancel(&1));
        assert!(!map.cancel(&1));
        assert!(map.next_deadline().is_none());
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let mut map = DeadlineMap::new();
        map.restart("far", Duration::from_secs(60));
        map.restart("near", Duration::from_secs(1));
        let near = map.deadlines[&"near"];
        assert_eq!(map.next_deadline(), Some(near));
    }

    #[test]
    fn earliest_prefers_the_sooner_side() {
        let now = Instant::now();
        let soon = Some(now + Duration::from_secs(1));
        let late = Some(now + Duration::from_secs(2));
        assert_eq!(earliest(soon, late), soon);
        assert_eq!(earliest(None, late), late);
        assert_eq!(earliest(None, None), None);
    }
}
