//! Wire envelopes of the REST broker surface and their decoding into events.

use serde::Deserialize;

use crate::error::{PublishError, TransportError};
use crate::registry::PRESENCE_SUFFIX;
use crate::transport::PollResponse;
use crate::types::{Event, MessageEvent, PresenceAction, PresenceEvent, Timetoken};

// ---------------------------------------------------------------------------
// Subscribe response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeEnvelope {
    #[serde(rename = "t")]
    pub cursor: CursorEnvelope,
    #[serde(rename = "m", default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CursorEnvelope {
    #[serde(rename = "t")]
    pub timetoken: RawTimetoken,
}

/// Timetokens are 17-digit integers, usually sent as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimetoken {
    Number(u64),
    Text(String),
}

impl RawTimetoken {
    fn parse(&self) -> Option<Timetoken> {
        match self {
            RawTimetoken::Number(n) => Some(Timetoken(*n)),
            RawTimetoken::Text(s) => s.trim().parse().ok().map(Timetoken),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "c")]
    pub channel: String,
    /// Subscription the message matched: the channel itself or a group.
    #[serde(rename = "b", default)]
    pub subscription: Option<String>,
    #[serde(rename = "d", default)]
    pub payload: serde_json::Value,
    #[serde(rename = "i", default)]
    pub publisher: Option<String>,
    #[serde(rename = "p", default)]
    pub published: Option<CursorEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
struct PresencePayload {
    action: PresenceAction,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    occupancy: Option<u32>,
}

/// Decode a subscribe response body into ordered events and the next cursor.
pub fn decode_subscribe(body: &[u8]) -> Result<PollResponse, TransportError> {
    let envelope: SubscribeEnvelope = serde_json::from_slice(body)
        .map_err(|e| TransportError::Malformed(format!("subscribe response: {e}")))?;
    let next_cursor = envelope.cursor.timetoken.parse().ok_or_else(|| {
        TransportError::Malformed(format!(
            "invalid timetoken: {:?}",
            envelope.cursor.timetoken
        ))
    })?;

    let mut events = Vec::with_capacity(envelope.messages.len());
    for message in envelope.messages {
        if let Some(event) = decode_message(message, next_cursor) {
            events.push(event);
        }
    }
    Ok(PollResponse {
        events,
        next_cursor,
    })
}

fn decode_message(message: WireMessage, fallback: Timetoken) -> Option<Event> {
    let timetoken = message
        .published
        .as_ref()
        .and_then(|p| p.timetoken.parse())
        .unwrap_or(fallback);

    if let Some(channel) = message.channel.strip_suffix(PRESENCE_SUFFIX) {
        let subscription = message
            .subscription
            .as_deref()
            .map(|s| s.strip_suffix(PRESENCE_SUFFIX).unwrap_or(s))
            .filter(|s| *s != channel)
            .map(str::to_string);
        return match serde_json::from_value::<PresencePayload>(message.payload) {
            Ok(presence) => Some(Event::Presence(PresenceEvent {
                channel: channel.to_string(),
                subscription,
                action: presence.action,
                uuid: presence.uuid,
                occupancy: presence.occupancy,
                timetoken,
            })),
            Err(e) => {
                tracing::warn!(channel, "Dropping undecodable presence event: {e}");
                None
            }
        };
    }

    let subscription = message.subscription.filter(|s| *s != message.channel);
    Some(Event::Message(MessageEvent {
        channel: message.channel,
        subscription,
        payload: message.payload,
        publisher: message.publisher,
        timetoken,
    }))
}

// ---------------------------------------------------------------------------
// Publish response
// ---------------------------------------------------------------------------

/// Decode a `[status, description, timetoken]` publish response.
pub fn decode_publish(body: &[u8]) -> Result<Timetoken, PublishError> {
    let (status, description, timetoken): (i64, String, RawTimetoken) =
        serde_json::from_slice(body)
            .map_err(|e| PublishError::Network(format!("malformed publish response: {e}")))?;
    if status != 1 {
        if description.to_ascii_lowercase().contains("key") {
            return Err(PublishError::InvalidKey(description));
        }
        return Err(PublishError::Network(description));
    }
    timetoken
        .parse()
        .ok_or_else(|| PublishError::Network(format!("invalid timetoken: {timetoken:?}")))
}

// ---------------------------------------------------------------------------
// Error bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorEnvelope {
    message: Option<String>,
}

/// Best-effort human readable message from an error response body.
pub fn error_message(body: &[u8]) -> String {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body)
        && let Some(message) = envelope.message
    {
        return message;
    }
    // Publish errors use the array form.
    if let Ok((_, description, _)) =
        serde_json::from_slice::<(i64, String, serde_json::Value)>(body)
    {
        return description;
    }
    String::from_utf8_lossy(body).trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
