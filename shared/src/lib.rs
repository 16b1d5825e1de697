//! Rollcall Shared Protocol Types
//!
//! This crate provides the STOMP frame model, the frame codec and the link
//! state machine used by Rollcall real-time clients. Nothing in here depends
//! on an async runtime.

pub mod codec;
pub mod frame;
pub mod state_machine;

// Re-export commonly used types at crate root
pub use frame::{Command, Frame, HeartBeat};
pub use state_machine::{LinkEvent, LinkState, LinkStateMachine, Transition};

/// Timing parameters for the real-time channel
pub mod timing {
    /// Fixed delay between reconnection attempts
    pub const RECONNECT_DELAY_MS: u64 = 5000;

    /// Interval at which the client sends heart-beats
    pub const HEARTBEAT_OUTGOING_MS: u64 = 4000;

    /// Interval at which the client wants heart-beats from the broker
    pub const HEARTBEAT_INCOMING_MS: u64 = 4000;

    /// Missed-heart-beat tolerance, as a multiple of the negotiated interval
    pub const HEARTBEAT_GRACE_FACTOR: u64 = 2;

    /// Ceiling for any negotiated heart-beat interval
    pub const HEARTBEAT_MAX_MS: u64 = 3_600_000;

    /// Timeout for the WebSocket handshake plus the STOMP CONNECT exchange
    pub const CONNECT_TIMEOUT_MS: u64 = 10000;

    /// Time allowed for DISCONNECT and the close handshake on deactivate
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 1000;
}
