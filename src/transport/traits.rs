//! Transport trait abstraction for pluggable real-time backends
//!
//! The multiplexer only needs four capabilities from a transport:
//! activate/deactivate, subscribe to a destination, unsubscribe a handle,
//! and a stream of lifecycle/message events.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// WebSocket stream produced by a [`Connector`]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opaque protocol-level subscription id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events emitted by a transport, in the order they happened.
///
/// Session events carry the generation returned by the
/// [`Transport::activate`] call that produced them, so events still queued
/// from an earlier activation can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake complete; subscriptions can be opened
    Connected { generation: u64 },
    /// Session ended (dropped, closed by broker, or deactivated)
    Disconnected { generation: u64, reason: String },
    /// Inbound message for a destination
    Message {
        generation: u64,
        destination: String,
        body: Bytes,
    },
    /// Broker reported an error frame
    ProtocolError { message: String },
}

/// A persistent publish/subscribe connection.
///
/// Every method is fire-and-forget: it records intent and returns without
/// waiting on the network. Outcomes arrive as [`TransportEvent`]s.
pub trait Transport: Send + Sync {
    /// Start connecting to `url` and keep reconnecting until deactivated.
    ///
    /// Returns the activation generation stamped on the resulting events.
    /// Calling it while already active returns the running generation.
    fn activate(&self, url: &Url) -> u64;

    /// Stop the connection and the reconnect loop.
    fn deactivate(&self);

    /// Whether the transport is activated (connecting or connected).
    fn is_active(&self) -> bool;

    /// Headers sent with every subsequent (re)connection handshake.
    fn set_connect_headers(&self, headers: BTreeMap<String, String>);

    /// Open a protocol subscription for a destination.
    fn subscribe(&self, destination: &str) -> SubscriptionHandle;

    /// Close a protocol subscription.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Factory for raw WebSocket connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the WebSocket handshake for `request`
    async fn connect(&self, request: Request) -> Result<WsStream>;

    /// Human-readable name for this connector
    fn name(&self) -> &'static str;
}
