//! Reconnect policy and the connection state machine.
//!
//! Transitions are pure: `(state, event) -> (state, effect)`. The manager
//! applies the returned [`Effect`]; nothing here touches timers or sessions.

use std::time::Duration;

use portlink_core::Address;
use serde::{Deserialize, Serialize};

/// Connection status of an endpoint session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Automatic attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Whether unsolicited closes trigger automatic reconnection at all.
    pub participates_in_reconnection: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            participates_in_reconnection: true,
        }
    }
}

impl ReconnectPolicy {
    /// Default policy for an endpoint role. The hub is the always-on side
    /// and does not reconnect.
    #[must_use]
    pub fn for_address(address: &Address) -> Self {
        Self::default().with_participation(!address.is_hub())
    }

    /// Set the attempt cap.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set base and maximum delay.
    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub const fn with_participation(mut self, participates: bool) -> Self {
        self.participates_in_reconnection = participates;
        self
    }

    /// Delay before the next attempt, given how many were already made.
    #[must_use]
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempts_made))
            .min(self.max_delay)
    }
}

/// Status plus attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
        }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt began.
    ConnectStarted,
    /// A session was established.
    Connected,
    /// Opening a session failed.
    ConnectFailed { automatic: bool },
    /// The session closed without being asked to, or a send failed.
    Lost { invalidated: bool },
    /// Explicit teardown.
    Disconnected,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Wait `delay`, then make automatic attempt number `attempt`.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// The attempt cap is exhausted.
    GiveUp { attempts: u32 },
}

impl ConnectionState {
    /// Apply one event.
    #[must_use]
    pub fn transition(
        self,
        event: ConnectionEvent,
        policy: &ReconnectPolicy,
    ) -> (Self, Option<Effect>) {
        match event {
            ConnectionEvent::ConnectStarted => (
                Self {
                    status: ConnectionStatus::Connecting,
                    ..self
                },
                None,
            ),
            ConnectionEvent::Connected => (
                Self {
                    status: ConnectionStatus::Connected,
                    reconnect_attempts: 0,
                },
                None,
            ),
            ConnectionEvent::ConnectFailed { automatic } => {
                let next = self.disconnected();
                if automatic && policy.participates_in_reconnection {
                    next.schedule_next(policy)
                } else {
                    (next, None)
                }
            }
            ConnectionEvent::Lost { invalidated } => {
                let was_connected = self.status == ConnectionStatus::Connected;
                let next = self.disconnected();
                if !invalidated && was_connected && policy.participates_in_reconnection {
                    next.schedule_next(policy)
                } else {
                    (next, None)
                }
            }
            ConnectionEvent::Disconnected => (self.disconnected(), None),
        }
    }

    const fn disconnected(self) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            ..self
        }
    }

    fn schedule_next(self, policy: &ReconnectPolicy) -> (Self, Option<Effect>) {
        if self.reconnect_attempts >= policy.max_attempts {
            return (
                self,
                Some(Effect::GiveUp {
                    attempts: self.reconnect_attempts,
                }),
            );
        }
        let delay = policy.delay_for(self.reconnect_attempts);
        let attempt = self.reconnect_attempts + 1;
        (
            Self {
                reconnect_attempts: attempt,
                ..self
            },
            Some(Effect::ScheduleReconnect { attempt, delay }),
        )
    }
}
