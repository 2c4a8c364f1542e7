//! Notification subscriptions held by a backend.
//!
//! One live subscription per key: subscribing again cancels the previous one,
//! and disconnecting a device cancels everything it registered.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Something that stops delivering notifications once cancelled
pub trait Subscription: Send {
    fn cancel(self);
}

impl Subscription for JoinHandle<()> {
    fn cancel(self) {
        self.abort();
    }
}

/// Shared registry of active subscriptions keyed by `(device, characteristic)`
pub struct Subscriptions<K, S> {
    active: Arc<Mutex<HashMap<K, S>>>,
}

impl<K, S> Clone for Subscriptions<K, S> {
    fn clone(&self) -> Self {
        Self {
            active: self.active.clone(),
        }
    }
}

impl<K, S> Default for Subscriptions<K, S> {
    fn default() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, S> std::fmt::Debug for Subscriptions<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Subscriptions").field("active", &count).finish()
    }
}

impl<K: Eq + Hash + Clone, S: Subscription> Subscriptions<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription`, cancelling whatever held `key` before
    pub fn replace(&self, key: K, subscription: S) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, subscription);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel every subscription whose key matches
    pub fn cancel_where(&self, matches: impl Fn(&K) -> bool) {
        let cancelled: Vec<S> = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<K> = active.keys().filter(|k| matches(k)).cloned().collect();
            keys.iter().filter_map(|k| active.remove(k)).collect()
        };
        for subscription in cancelled {
            subscription.cancel();
        }
    }

    pub fn cancel_all(&self) {
        self.cancel_where(|_| true);
    }

    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
