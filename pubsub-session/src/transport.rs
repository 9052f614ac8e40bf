//! Transport adapter boundary consumed by the session loop and publish path.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{PublishError, TransportError};
use crate::types::{Event, Timetoken};

/// One long-poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Channels to poll, presence companions included.
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    /// `Timetoken::ZERO` requests the broker's current position.
    pub cursor: Timetoken,
    pub timeout: Duration,
}

/// Events returned by one poll, in arrival order, and the cursor for the
/// next poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    pub events: Vec<Event>,
    pub next_cursor: Timetoken,
}

/// One publish request; kept whole so a retry resends it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    /// Serialized JSON payload.
    pub payload: Bytes,
    pub compressed: bool,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs one long-poll. Dropping the future abandons the request.
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError>;

    /// Sends one message and returns the timetoken the broker assigned it.
    async fn send(&self, request: &PublishRequest) -> Result<Timetoken, PublishError>;
}
