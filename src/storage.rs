use crate::id::Identifier;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

pub const DEFAULT_MAX_VALUES: usize = 4096;
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Bounded store for values other peers asked us to keep. Best effort: values expire and a full
/// store rejects new keys.
pub struct ValueStore {
    values: HashMap<Identifier, Item>,
    max_values: usize,
    expiry: Duration,
}

struct Item {
    value: Vec<u8>,
    stored_at: Instant,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_VALUES, DEFAULT_EXPIRY)
    }

    pub fn with_limits(max_values: usize, expiry: Duration) -> Self {
        Self {
            values: HashMap::new(),
            max_values,
            expiry,
        }
    }

    /// Store (or overwrite) a value. Returns false if the store is full.
    pub fn put(&mut self, key: Identifier, value: Vec<u8>) -> bool {
        self.put_at(key, value, Instant::now())
    }

    pub fn get(&mut self, key: &Identifier) -> Option<Vec<u8>> {
        self.get_at(key, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn put_at(&mut self, key: Identifier, value: Vec<u8>, now: Instant) -> bool {
        if !self.values.contains_key(&key) && self.values.len() >= self.max_values {
            self.remove_expired(now);

            if self.values.len() >= self.max_values {
                return false;
            }
        }

        self.values.insert(
            key,
            Item {
                value,
                stored_at: now,
            },
        );

        true
    }

    fn get_at(&mut self, key: &Identifier, now: Instant) -> Option<Vec<u8>> {
        let expired = match self.values.get(key) {
            Some(item) => now.saturating_duration_since(item.stored_at) >= self.expiry,
            None => return None,
        };

        if expired {
            self.values.remove(key);
            None
        } else {
            self.values.get(key).map(|item| item.value.clone())
        }
    }

    fn remove_expired(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.values
            .retain(|_, item| now.saturating_duration_since(item.stored_at) < expiry);
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}
