//! Duplicate-delivery window.
//!
//! An at-least-once broker may hand the same event over more than once.
//! Overwrite semantics already make repeats harmless for the final state,
//! so the window is off by default; when enabled it drops byte-identical
//! `(topic, payload)` pairs seen within the TTL before they reach the store.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct DedupWindow {
    ttl: Duration,
    capacity: usize,
    /// fingerprint -> expiry
    seen: HashMap<[u8; 32], Instant>,
    /// Insertion order for eviction.
    order: VecDeque<[u8; 32]>,
}

fn fingerprint(topic: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

impl DedupWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Record the event and report whether it was already seen within the
    /// window.
    pub fn check_and_record(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.check_and_record_at(topic, payload, Instant::now())
    }

    fn check_and_record_at(&mut self, topic: &str, payload: &[u8], now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.evict_expired(now);

        let fp = fingerprint(topic, payload);
        if let Some(expires_at) = self.seen.get(&fp) {
            if *expires_at > now {
                return true;
            }
        }

        if self.seen.insert(fp, now + self.ttl).is_none() {
            self.order.push_back(fp);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    /// Drop expired fingerprints. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        self.evict_expired(Instant::now())
    }

    fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| *expires_at > now);
        let seen = &self.seen;
        self.order.retain(|fp| seen.contains_key(fp));
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_window_never_reports_duplicates() {
        let mut w = DedupWindow::new(Duration::ZERO, 16);
        assert!(!w.check_and_record("WORLD", b"a"));
        assert!(!w.check_and_record("WORLD", b"a"));
        assert!(w.is_empty());
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let mut w = DedupWindow::new(Duration::from_secs(60), 16);
        assert!(!w.check_and_record("WORLD", b"a"));
        assert!(w.check_and_record("WORLD", b"a"));
        assert!(!w.check_and_record("ApproveWORLD", b"a"), "topic is part of the fingerprint");
        assert!(!w.check_and_record("WORLD", b"b"));
    }

    #[test]
    fn repeat_after_expiry_is_fresh() {
        let mut w = DedupWindow::new(Duration::from_secs(5), 16);
        let t0 = Instant::now();
        assert!(!w.check_and_record_at("WORLD", b"a", t0));
        assert!(w.check_and_record_at("WORLD", b"a", t0 + Duration::from_secs(4)));
        assert!(!w.check_and_record_at("WORLD", b"a", t0 + Duration::from_secs(6)));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut w = DedupWindow::new(Duration::from_secs(60), 2);
        w.check_and_record("WORLD", b"1");
        w.check_and_record("WORLD", b"2");
        w.check_and_record("WORLD", b"3");
        assert_eq!(w.len(), 2);
        assert!(!w.check_and_record("WORLD", b"1"), "evicted entry is forgotten");
    }

    #[test]
    fn sweep_removes_expired() {
        let mut w = DedupWindow::new(Duration::from_millis(1), 16);
        w.check_and_record("WORLD", b"a");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(w.sweep_expired(), 1);
        assert!(w.is_empty());
    }
}
