//! Real-time subscription multiplexer
//!
//! One shared transport connection carries any number of logical
//! subscriptions. Screens register listeners per destination and get back an
//! [`Unsubscribe`] handle. This module handles:
//! - Lazy protocol subscriptions (one per destination, opened only while live)
//! - Fan-out of decoded payloads to every listener of a destination
//! - Re-subscription of every listened destination after a reconnect
//! - Teardown of a destination's subscription when its last listener leaves

mod dispatcher;
mod registry;

#[cfg(test)]
mod tests;

pub use dispatcher::{decode_payload, fan_out, DeliveryReport, DispatchError};
pub use registry::{Listener, ListenerId, Removal, SubscriptionRegistry};

use crate::config::RealtimeConfig;
use crate::transport::{Transport, TransportEvent};
use anyhow::{Context, Result};
use rollcall_shared::{LinkEvent, LinkState, LinkStateMachine, Transition};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Errors returned to `subscribe` callers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Destination must not be empty")]
    EmptyDestination,
}

/// Mutable state guarded by one lock
struct State {
    link: LinkStateMachine,
    registry: SubscriptionRegistry,
    /// Activation whose events are applied; `None` while disconnected
    generation: Option<u64>,
}

impl State {
    /// Whether an event stamped with `generation` belongs to the current activation
    fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation)
    }
}

/// Shared core reachable from unsubscribe handles
struct Core {
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_listener(&self, destination: &str, id: ListenerId) {
        let mut state = self.lock();
        match state.registry.remove_listener(destination, id) {
            Removal::NotFound => {}
            Removal::Remaining(left) => {
                debug!(destination = %destination, listener = %id, remaining = left, "Listener removed");
            }
            Removal::LastRemoved => {
                if let Some(handle) = state.registry.take_handle(destination) {
                    self.transport.unsubscribe(&handle);
                    debug!(destination = %destination, handle = %handle, "Last listener gone, unsubscribed");
                } else {
                    debug!(destination = %destination, "Last listener gone");
                }
            }
        }
    }
}

/// Removes one listener when called. Safe to call any number of times.
#[must_use = "the listener stays registered until `unsubscribe` is called"]
#[derive(Clone)]
pub struct Unsubscribe {
    core: Weak<Core>,
    destination: String,
    listener: ListenerId,
    done: Arc<AtomicBool>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.remove_listener(&self.destination, self.listener);
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }
}

/// The subscription multiplexer.
///
/// Construct one per app session and share it (e.g. behind an `Arc`) with
/// whatever needs real-time updates.
pub struct RealtimeService {
    broker_url: Option<Url>,
    core: Arc<Core>,
}

impl RealtimeService {
    /// Create a service over `transport`. A config without an API base URL
    /// yields a disabled service whose `connect` does nothing.
    pub fn new(config: &RealtimeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let broker_url = config.broker_url().context("Invalid real-time configuration")?;
        if broker_url.is_none() {
            info!("No API base URL configured, real-time updates disabled");
        }

        Ok(Self {
            broker_url,
            core: Arc::new(Core {
                transport,
                state: Mutex::new(State {
                    link: LinkStateMachine::new(),
                    registry: SubscriptionRegistry::new(),
                    generation: None,
                }),
            }),
        })
    }

    /// Whether a broker endpoint is configured
    pub fn is_enabled(&self) -> bool {
        self.broker_url.is_some()
    }

    /// Ensure the channel is active. Safe to call repeatedly.
    ///
    /// A supplied token becomes the `Authorization` header of the next
    /// (re)connection handshake.
    pub fn connect(&self, token: Option<&str>) {
        let Some(url) = &self.broker_url else {
            debug!("Real-time disabled, ignoring connect");
            return;
        };

        if let Some(token) = token {
            let mut headers = BTreeMap::new();
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
            self.core.transport.set_connect_headers(headers);
        }

        let mut state = self.core.lock();
        if self.core.transport.is_active() {
            debug!(state = %state.link.state(), "Already active, not activating again");
            return;
        }

        state.link.process_event(LinkEvent::Activate);
        info!(url = %url, "Connecting real-time channel");
        state.generation = Some(self.core.transport.activate(url));
    }

    /// Tear down the channel. Listeners stay registered for the next connect.
    pub fn disconnect(&self) {
        let mut state = self.core.lock();
        if self.core.transport.is_active() {
            self.core.transport.deactivate();
        }
        state.link.process_event(LinkEvent::Deactivate);
        state.generation = None;
        let dropped = state.registry.clear_handles();
        info!(dropped_subscriptions = dropped, "Real-time channel disconnected");
    }

    /// Register `listener` for `destination`.
    ///
    /// Opens the protocol subscription right away when the channel is live
    /// and none exists yet; otherwise the next connect takes care of it.
    pub fn subscribe<F>(&self, destination: &str, listener: F) -> Result<Unsubscribe, SubscribeError>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if destination.is_empty() {
            return Err(SubscribeError::EmptyDestination);
        }

        let mut state = self.core.lock();
        let id = state.registry.add_listener(destination, Arc::new(listener));

        if state.link.is_live() && !state.registry.has_handle(destination) {
            let handle = self.core.transport.subscribe(destination);
            debug!(destination = %destination, handle = %handle, "Subscribed");
            state.registry.insert_handle(destination, handle);
        } else {
            debug!(destination = %destination, listener = %id, live = state.link.is_live(), "Listener registered");
        }

        Ok(Unsubscribe {
            core: Arc::downgrade(&self.core),
            destination: destination.to_string(),
            listener: id,
            done: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Like [`subscribe`](Self::subscribe) but hands the listener a typed payload.
    ///
    /// A payload that does not deserialize into `T` counts as a listener error.
    pub fn subscribe_json<T, F>(&self, destination: &str, listener: F) -> Result<Unsubscribe, SubscribeError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let target = std::any::type_name::<T>();
        self.subscribe(destination, move |value: &Value| {
            let typed = serde_json::from_value::<T>(value.clone())
                .with_context(|| format!("Payload does not match {}", target))?;
            listener(typed)
        })
    }

    /// Apply one transport event. Events from an activation other than the
    /// current one (or any after `disconnect`) are dropped.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { generation } => self.on_connect(generation),
            TransportEvent::Disconnected { generation, reason } => self.on_disconnect(generation, &reason),
            TransportEvent::Message {
                generation,
                destination,
                body,
            } => self.on_message(generation, &destination, &body),
            TransportEvent::ProtocolError { message } => {
                error!(message = %message, "Broker reported a protocol error");
            }
        }
    }

    /// Feed transport events into the service until the channel closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Transport event stream closed");
    }

    fn on_connect(&self, generation: u64) {
        let mut state = self.core.lock();
        if !state.is_current(generation) {
            debug!(generation, current = ?state.generation, "Ignoring connect from a previous activation");
            return;
        }
        match state.link.process_event(LinkEvent::Established) {
            Transition::Ignored { from, .. } => {
                debug!(state = %from, "Ignoring late connect notification");
                return;
            }
            _ => info!("Real-time channel connected"),
        }

        for destination in state.registry.pending_destinations() {
            let handle = self.core.transport.subscribe(&destination);
            debug!(destination = %destination, handle = %handle, "Subscribed");
            state.registry.insert_handle(&destination, handle);
        }
    }

    fn on_disconnect(&self, generation: u64, reason: &str) {
        let mut state = self.core.lock();
        if !state.is_current(generation) {
            debug!(generation, reason = %reason, "Ignoring disconnect from a previous activation");
            return;
        }
        let transition = state.link.process_event(LinkEvent::Dropped);
        let dropped = state.registry.clear_handles();

        if let Transition::Changed { from: LinkState::Connected, .. } = transition {
            warn!(reason = %reason, dropped_subscriptions = dropped, "Real-time channel lost, waiting for reconnect");
        } else {
            debug!(reason = %reason, state = %state.link.state(), "Disconnect notification");
        }
    }

    fn on_message(&self, generation: u64, destination: &str, body: &[u8]) {
        // Snapshot under the lock, call listeners outside it
        let listeners = {
            let state = self.core.lock();
            if !state.is_current(generation) {
                debug!(destination = %destination, generation, "Dropping message from a previous activation");
                return;
            }
            state.registry.listeners_for(destination)
        };
        if listeners.is_empty() {
            debug!(destination = %destination, "No listeners, dropping message");
            return;
        }

        let payload = match decode_payload(destination, body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable message");
                return;
            }
        };

        let report = fan_out(destination, &payload, &listeners);
        for failure in &report.failures {
            warn!(error = %failure, "Listener failed");
        }
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        self.core.lock().link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.lock().link.is_live()
    }

    pub fn listener_count(&self, destination: &str) -> usize {
        self.core.lock().registry.listener_count(destination)
    }

    /// Destinations with a live protocol subscription, sorted
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.core.lock().registry.subscribed_destinations()
    }
}
