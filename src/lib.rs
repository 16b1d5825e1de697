//! Rollcall real-time updates
//!
//! A single STOMP-over-WebSocket connection multiplexed across any number of
//! per-destination listeners. See [`realtime::RealtimeService`].

pub mod config;
pub mod destinations;
pub mod realtime;
pub mod transport;

pub use config::RealtimeConfig;
pub use realtime::{RealtimeService, SubscribeError, Unsubscribe};
pub use rollcall_shared::LinkState;
pub use transport::{StompOptions, StompTransport, Transport, TransportEvent};
