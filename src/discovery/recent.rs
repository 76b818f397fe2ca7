use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    time::{Duration, Instant},
};

/// Sliding window of recently seen keys.
pub(crate) struct RecentMessages<K> {
    window: Duration,
    keys: HashSet<K>,
    // Oldest first.
    order: VecDeque<(Instant, K)>,
}

impl<K: Hash + Eq + Clone> RecentMessages<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember `key`. Returns false if it was already seen within the window.
    pub fn insert(&mut self, key: K) -> bool {
        self.insert_at(key, Instant::now())
    }

    fn insert_at(&mut self, key: K, now: Instant) -> bool {
        self.expire(now);

        if !self.keys.insert(key.clone()) {
            return false;
        }

        self.order.push_back((now, key));
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some((seen_at, _)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < self.window {
                break;
            }

            if let Some((_, key)) = self.order.pop_front() {
                self.keys.remove(&key);
            }
        }
    }
}
