//! Poller state types.
//!
//! # State Transitions
//!
//! ```text
//!            poll()               batch received
//! Idle ─────────────────→ Polling ─────────────────→ Applying
//!  ↑  ↑                      │                          │
//!  │  │   (poll failed,      │                          │ result
//!  │  └── backoff) ──────────┘                          │
//!  │                                                    ↓
//!  │                      schema caught up      wait_for_version > 0?
//!  └──────────────────── WaitingForSchema ←──────────── yes
//!  ↑                                                    │ no
//!  └────────────────────────────────────────────────────┘
//!
//! any state ── shutdown() ──→ Shutdown
//! ```

/// State of one poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Between cycles, possibly sleeping for backoff or idle delay.
    Idle,

    /// A "get changes" request is in flight.
    Polling,

    /// The output client is applying the last batch.
    Applying,

    /// Paused until the consumer schema reaches the requested version.
    WaitingForSchema,

    /// Terminal.
    Shutdown,
}

impl std::fmt::Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerState::Idle => write!(f, "Idle"),
            PollerState::Polling => write!(f, "Polling"),
            PollerState::Applying => write!(f, "Applying"),
            PollerState::WaitingForSchema => write!(f, "WaitingForSchema"),
            PollerState::Shutdown => write!(f, "Shutdown"),
        }
    }
}
