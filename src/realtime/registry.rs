//! Subscription registry
//!
//! Two maps: destination -> listeners (the source of truth, survives
//! disconnects) and destination -> live protocol handle (valid only for the
//! current session). A destination with listeners but no handle is simply
//! waiting for the next connect.

use crate::transport::SubscriptionHandle;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with each decoded payload for a destination
pub type Listener = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Identity of one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Outcome of removing a listener
#[derive(Debug, PartialEq, Eq)]
pub enum Removal {
    /// Listener was not registered (already removed)
    NotFound,
    /// Other listeners remain on the destination
    Remaining(usize),
    /// That was the last listener; the destination is gone from the registry
    LastRemoved,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    /// Listeners per destination, in registration order
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    /// Live protocol subscription per destination
    handles: HashMap<String, SubscriptionHandle>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, creating the destination entry if needed
    pub fn add_listener(&mut self, destination: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(destination.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one listener. An emptied destination is deleted.
    pub fn remove_listener(&mut self, destination: &str, id: ListenerId) -> Removal {
        let Some(entries) = self.listeners.get_mut(destination) else {
            return Removal::NotFound;
        };
        let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id) else {
            return Removal::NotFound;
        };
        entries.remove(pos);

        if entries.is_empty() {
            self.listeners.remove(destination);
            Removal::LastRemoved
        } else {
            Removal::Remaining(entries.len())
        }
    }

    /// Snapshot of the listeners for a destination, in registration order
    pub fn listeners_for(&self, destination: &str) -> Vec<(ListenerId, Listener)> {
        self.listeners
            .get(destination)
            .map(|entries| entries.to_vec())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, destination: &str) -> usize {
        self.listeners.get(destination).map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, destination: &str) -> bool {
        self.listeners.contains_key(destination)
    }

    pub fn has_handle(&self, destination: &str) -> bool {
        self.handles.contains_key(destination)
    }

    pub fn insert_handle(&mut self, destination: &str, handle: SubscriptionHandle) {
        self.handles.insert(destination.to_string(), handle);
    }

    pub fn take_handle(&mut self, destination: &str) -> Option<SubscriptionHandle> {
        self.handles.remove(destination)
    }

    /// Forget every protocol handle (they die with the session). Returns how many.
    pub fn clear_handles(&mut self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        count
    }

    /// Destinations with listeners but no live handle, sorted
    pub fn pending_destinations(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .listeners
            .keys()
            .filter(|dest| !self.handles.contains_key(*dest))
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// Destinations with a live handle, sorted
    pub fn subscribed_destinations(&self) -> Vec<String> {
        let mut active: Vec<String> = self.handles.keys().cloned().collect();
        active.sort();
        active
    }
}
