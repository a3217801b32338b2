// Wire and event types shared by the push transports, the fallback poller and
// the sync session.
//
// Push payloads are decoded into typed records here, at the transport
// boundary. Anything that does not decode, or that describes an impossible
// schedule, is rejected with a `PayloadError` and never reaches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Client → server: subscribe to a campus feed.
pub const EVENT_JOIN: &str = "join_campus";
/// Server → client: a challenge went live.
pub const EVENT_DROP: &str = "challenge_drop";
/// Server → client: fields of the live challenge changed.
pub const EVENT_UPDATE: &str = "challenge_update";
/// Server → client: the live challenge ended.
pub const EVENT_END: &str = "challenge_end";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("malformed `{event}` payload: {message}")]
    Malformed { event: String, message: String },

    #[error("challenge {id}: scheduledAt {scheduled_at} is not before expiresAt {expires_at}")]
    InvalidWindow {
        id: String,
        scheduled_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    #[error("unknown push event `{0}`")]
    UnknownEvent(String),
}

// ---------------------------------------------------------------------------
// Challenge records
// ---------------------------------------------------------------------------

/// One scheduled campus challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(alias = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub scheduled_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub campus_id: String,
    /// Media reference (video/image URL), usually filled in by a later update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub is_bonus: bool,
}

impl Challenge {
    /// Decode and validate a challenge from a loosely-typed JSON record.
    ///
    /// `source` names where the record came from (an event name or
    /// `directory`) and is carried into any error.
    pub fn from_value(value: Value, source: &str) -> Result<Self, PayloadError> {
        let challenge: Challenge =
            serde_json::from_value(value).map_err(|e| PayloadError::Malformed {
                event: source.to_string(),
                message: e.to_string(),
            })?;
        challenge.validate()?;
        Ok(challenge)
    }

    /// Check the `scheduledAt < expiresAt` invariant.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.scheduled_at < self.expires_at {
            Ok(())
        } else {
            Err(PayloadError::InvalidWindow {
                id: self.id.clone(),
                scheduled_at: self.scheduled_at,
                expires_at: self.expires_at,
            })
        }
    }

    /// A challenge is live at `t` iff `scheduledAt <= t < expiresAt`.
    pub fn is_live_at(&self, t: DateTime<Utc>) -> bool {
        self.scheduled_at <= t && t < self.expires_at
    }

    /// Return a copy with every field present in `patch` merged in.
    ///
    /// Identity fields (`id`, `campusId`) are never touched. The merged
    /// record must still satisfy the schedule invariant.
    pub fn merged(&self, patch: &ChallengePatch) -> Result<Challenge, PayloadError> {
        let mut next = self.clone();
        if let Some(title) = &patch.title {
            next.title = title.clone();
        }
        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(scheduled_at) = patch.scheduled_at {
            next.scheduled_at = scheduled_at;
        }
        if let Some(expires_at) = patch.expires_at {
            next.expires_at = expires_at;
        }
        if let Some(media_url) = &patch.media_url {
            next.media_url = Some(media_url.clone());
        }
        if let Some(is_bonus) = patch.is_bonus {
            next.is_bonus = is_bonus;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial snapshot of the live challenge carried by `challenge_update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePatch {
    /// Carried for diagnostics only; never merged.
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub media_url: Option<String>,
    pub is_bonus: Option<bool>,
}

/// Payload of `challenge_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeEnd {
    #[serde(alias = "_id")]
    pub id: String,
}

// ---------------------------------------------------------------------------
// Push messages
// ---------------------------------------------------------------------------

/// A validated challenge event from either source.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Drop(Challenge),
    Update(ChallengePatch),
    End(ChallengeEnd),
}

/// A decoded push message: the event plus the metadata that rode along.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub event: PushEvent,
    pub event_id: Option<String>,
    pub server_time: Option<DateTime<Utc>>,
}

/// Subscription scope sent when joining the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinParams {
    pub campus_id: String,
    pub user_id: String,
}

impl JoinParams {
    pub fn new(campus_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            campus_id: campus_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// WebSocket text frame envelope: `{"event": name, "data": payload, "id"?: eventId}`.
#[derive(Debug, Serialize, Deserialize)]
struct Frame<T> {
    event: String,
    data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

/// Build the `join_campus` text frame sent after the WebSocket handshake.
pub fn join_frame(params: &JoinParams) -> serde_json::Result<String> {
    serde_json::to_string(&Frame {
        event: EVENT_JOIN.to_string(),
        data: params,
        id: None,
    })
}

/// Decode a WebSocket text frame into a push message.
pub fn decode_frame(text: &str) -> Result<PushMessage, PayloadError> {
    let frame: Frame<Value> =
        serde_json::from_str(text).map_err(|e| PayloadError::Malformed {
            event: "frame".to_string(),
            message: e.to_string(),
        })?;
    decode_push(&frame.event, frame.data, frame.id)
}

/// Decode a named push event payload.
///
/// A top-level `serverTime` field in the payload is extracted as the server
/// clock reading; an unparseable one is ignored rather than failing the event.
pub fn decode_push(
    event: &str,
    payload: Value,
    event_id: Option<String>,
) -> Result<PushMessage, PayloadError> {
    let server_time = payload
        .get("serverTime")
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());

    let malformed = |e: serde_json::Error| PayloadError::Malformed {
        event: event.to_string(),
        message: e.to_string(),
    };

    let event = match event {
        EVENT_DROP => {
            let challenge: Challenge = serde_json::from_value(payload).map_err(malformed)?;
            challenge.validate()?;
            PushEvent::Drop(challenge)
        }
        EVENT_UPDATE => PushEvent::Update(serde_json::from_value(payload).map_err(malformed)?),
        EVENT_END => PushEvent::End(serde_json::from_value(payload).map_err(malformed)?),
        other => return Err(PayloadError::UnknownEvent(other.to_string())),
    };

    Ok(PushMessage {
        event,
        event_id: event_id.filter(|id| !id.is_empty()),
        server_time,
    })
}

// ---------------------------------------------------------------------------
// Internal event plumbing
// ---------------------------------------------------------------------------

/// Which component produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Push,
    Poll,
}

/// What a transport or poller task reports to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A proposed state transition.
    Proposal {
        event: PushEvent,
        event_id: Option<String>,
    },
    /// The push channel completed its handshake and joined.
    Connected,
    /// The push channel lost its connection and is retrying.
    Disconnected,
}

/// An event tagged with the run that produced it.
///
/// `generation` identifies the connection (or poller run) the event belongs
/// to. The session discards envelopes whose generation is no longer current.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: Origin,
    pub generation: u64,
    pub event: ChannelEvent,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
