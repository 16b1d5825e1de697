//! Link State Machine
//!
//! Tracks whether the real-time link is down, being (re)established, or live.
//! Subscribe decisions key off [`LinkState::Connected`].

use std::fmt;

/// Connection state of the real-time link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Not activated, or deactivated by the caller
    #[default]
    Disconnected,
    /// Activated; the transport is handshaking or waiting to retry
    Connecting,
    /// Handshake complete, subscriptions can be opened
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked for the link to be up
    Activate,
    /// Transport finished the handshake
    Established,
    /// Transport lost the connection (or an attempt failed)
    Dropped,
    /// Caller tore the link down
    Deactivate,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Changed { from: LinkState, to: LinkState },
    /// Event was valid but the state stays the same
    Unchanged(LinkState),
    /// Event makes no sense from the current state and was ignored
    Ignored { from: LinkState, event: LinkEvent },
}

/// The link state machine
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: LinkState,
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// True only while the handshake is complete
    pub fn is_live(&self) -> bool {
        self.current_state == LinkState::Connected
    }

    /// True while activated, live or not
    pub fn is_active(&self) -> bool {
        self.current_state != LinkState::Disconnected
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> Transition {
        use LinkEvent::*;
        use LinkState::*;

        let from = self.current_state;
        let next = match (from, event) {
            (Disconnected, Activate) => Some(Connecting),
            (Connecting | Connected, Activate) => None,

            (Connecting, Established) => Some(Connected),

            // The transport keeps retrying after a drop
            (Connected | Connecting, Dropped) => Some(Connecting),
            // Late drop notification after the caller deactivated
            (Disconnected, Dropped) => Some(Disconnected),

            (_, Deactivate) => Some(Disconnected),

            // Late handshake after deactivate, or a duplicate
            (Disconnected | Connected, Established) => None,
        };

        match next {
            Some(to) if to == from => Transition::Unchanged(to),
            Some(to) => {
                self.current_state = to;
                Transition::Changed { from, to }
            }
            None => Transition::Ignored { from, event },
        }
    }
}
