//! Public event and cursor types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position in the broker's event stream.
///
/// Ordered so the session loop can keep its cursor non-decreasing. `ZERO`
/// asks the broker for the current position without delivering history.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timetoken(pub u64);

impl Timetoken {
    pub const ZERO: Timetoken = Timetoken(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timetoken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timetoken {
    fn from(value: u64) -> Self {
        Timetoken(value)
    }
}

/// Events delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(MessageEvent),
    Presence(PresenceEvent),
    Status(StatusEvent),
}

impl Event {
    /// Channel the event belongs to; `None` for status events.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Event::Message(m) => Some(&m.channel),
            Event::Presence(p) => Some(&p.channel),
            Event::Status(_) => None,
        }
    }
}

/// A message published to a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub channel: String,
    /// Channel group the message matched through, if any.
    pub subscription: Option<String>,
    pub payload: serde_json::Value,
    /// UUID of the publishing client.
    pub publisher: Option<String>,
    pub timetoken: Timetoken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

/// Membership change on a presence-enabled channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    /// The data channel (without the presence suffix).
    pub channel: String,
    pub subscription: Option<String>,
    pub action: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: Option<u32>,
    pub timetoken: Timetoken,
}

/// Why a status event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// First successful poll after (re)starting from idle or halted.
    Connected,
    /// First successful poll after a reconnect.
    Reconnected,
    NetworkIssues,
    Timeout,
    MalformedResponse,
    /// Credentials rejected. The session halts.
    AccessDenied,
    /// Reconnect attempt cap reached. The session halts.
    ReconnectionFailed,
    /// Every channel and group was removed.
    Disconnected,
    /// The client was shut down.
    Cancelled,
}

impl StatusCategory {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StatusCategory::NetworkIssues
                | StatusCategory::Timeout
                | StatusCategory::MalformedResponse
                | StatusCategory::AccessDenied
                | StatusCategory::ReconnectionFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub category: StatusCategory,
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    /// Last cursor committed by the session when the status was emitted.
    pub timetoken: Timetoken,
    pub error: Option<String>,
}

/// Session loop state, observable through [`Client::watch_state`](crate::Client::watch_state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No channels or groups subscribed.
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay after a failed poll.
    Reconnecting,
    /// Stopped by a fatal failure; a new subscribe restarts the session.
    Halted,
    /// The client was shut down. Final.
    Stopped,
}
