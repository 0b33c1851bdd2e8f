//! Reconnection state machine
//!
//! Tracks whether a relay client holds a registered physical connection and
//! what it should do next when it does not. The value type only records
//! transitions; timers and dialing live in the client's driver task, so every
//! transition can be tested without a runtime.

use std::fmt;
use std::time::Instant;

/// Reconnection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No registered connection (initial state, and after a transport loss)
    Disconnected,

    /// Registered with the relay server
    Connected,

    /// A reconnection attempt is due or in progress
    Reconnecting,

    /// Closed for good - no further transitions
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connected => "connected",
            SupervisorState::Reconnecting => "reconnecting",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Reconnection supervisor
///
/// Every transition method returns `true` if it changed anything and `false`
/// if the event is not valid in the current state. [`SupervisorState::Stopped`]
/// is absorbing.
#[derive(Debug, Clone)]
pub struct Supervisor {
    /// Current state
    state: SupervisorState,

    /// Attempts since the connection was lost
    attempts: u32,

    /// Successful re-registrations after a loss
    reconnects: u64,

    /// Transport losses observed
    losses: u64,

    /// Last state transition time
    last_transition: Instant,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor in the `Disconnected` state
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Disconnected,
            attempts: 0,
            reconnects: 0,
            losses: 0,
            last_transition: Instant::now(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Check if registered
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == SupervisorState::Connected
    }

    /// Check if stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == SupervisorState::Stopped
    }

    /// Attempts made since the last loss
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful reconnections so far
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Transport losses so far
    #[must_use]
    pub fn losses(&self) -> u64 {
        self.losses
    }

    /// Time of the last transition
    #[must_use]
    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// Registration succeeded
    pub fn on_registered(&mut self) -> bool {
        match self.state {
            SupervisorState::Disconnected | SupervisorState::Reconnecting => {
                if self.losses > 0 {
                    self.reconnects += 1;
                }
                self.attempts = 0;
                self.transition(SupervisorState::Connected);
                true
            }
            SupervisorState::Connected | SupervisorState::Stopped => false,
        }
    }

    /// The registered connection failed
    pub fn on_transport_lost(&mut self) -> bool {
        if self.state != SupervisorState::Connected {
            return false;
        }
        self.losses += 1;
        self.attempts = 0;
        self.transition(SupervisorState::Disconnected);
        true
    }

    /// The reconnect timer fired; start an attempt
    pub fn begin_attempt(&mut self) -> bool {
        match self.state {
            SupervisorState::Disconnected | SupervisorState::Reconnecting => {
                self.attempts = self.attempts.saturating_add(1);
                self.transition(SupervisorState::Reconnecting);
                true
            }
            SupervisorState::Connected | SupervisorState::Stopped => false,
        }
    }

    /// The current attempt failed; stay in `Reconnecting` for the next tick
    pub fn on_attempt_failed(&mut self) -> bool {
        self.state == SupervisorState::Reconnecting
    }

    /// Stop for good
    pub fn stop(&mut self) -> bool {
        if self.state == SupervisorState::Stopped {
            return false;
        }
        self.transition(SupervisorState::Stopped);
        true
    }

    fn transition(&mut self, state: SupervisorState) {
        self.state = state;
        self.last_transition = Instant::now();
    }
}
