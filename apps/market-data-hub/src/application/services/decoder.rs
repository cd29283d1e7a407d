//! Subscription Envelope Decoder
//!
//! Turns the raw JSON text of an inbound payload into a validated
//! `SubscriptionIntent` in one typed pass:
//!
//! 1. `{ "type", "data" }` envelope; only `"subscription"` is accepted
//! 2. `{ "event", "pair", "params"? }` body
//! 3. pair validation
//! 4. OHLCV parameter defaults, filled per field
//!
//! Anything that does not fit is rejected with a `DecodeError` whose
//! `code()` is sent back to the client.

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::domain::ohlcv::{BucketSpec, DEFAULT_DURATION, OhlcvParams, TimeUnit};
use crate::domain::pair::{PairError, PairKey, parse_pair};
use crate::domain::subscription::ChannelKind;

/// The only envelope type the hub acts on.
pub const SUBSCRIPTION_TYPE: &str = "subscription";

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    /// Start receiving the stream.
    Subscribe,
    /// Stop receiving the stream.
    Unsubscribe,
}

/// A validated subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionIntent {
    /// Requested action.
    pub event: SubscriptionEvent,
    /// Target pair.
    pub pair: PairKey,
    /// Normalized parameters, present for parameterized channels only.
    pub params: Option<OhlcvParams>,
}

/// Inbound payload rejection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not a `{type, data}` object.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope type other than `subscription`.
    #[error("payload type {0:?} is not a subscription")]
    UnknownPayloadType(String),

    /// Subscription body does not match the expected shape.
    #[error("malformed subscription: {0}")]
    MalformedSubscription(String),

    /// Pair failed validation.
    #[error(transparent)]
    InvalidPair(#[from] PairError),

    /// OHLCV parameters out of range.
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl DecodeError {
    /// Stable client-facing error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::UnknownPayloadType(_) => "UNKNOWN_PAYLOAD_TYPE",
            Self::MalformedSubscription(_) => "MALFORMED_SUBSCRIPTION",
            Self::InvalidPair(err) => err.code(),
            Self::InvalidParams(_) => "INVALID_PARAMS",
        }
    }
}

// =============================================================================
// Wire Shapes
// =============================================================================

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct RawSubscription {
    event: SubscriptionEvent,
    pair: RawPair,
    #[serde(default)]
    params: Option<RawParams>,
}

/// Missing tokens decode as empty and fail pair validation on their side.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPair {
    #[serde(default)]
    base_token: String,
    #[serde(default)]
    quote_token: String,
}

/// Absent, null and zero fields all mean "use the default".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawParams {
    units: Option<String>,
    duration: Option<i64>,
    from: Option<i64>,
    to: Option<i64>,
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode an inbound payload for `channel`.
///
/// `now` (unix seconds) fills a missing `to`.
///
/// # Errors
///
/// Returns a `DecodeError` describing the first problem found.
pub fn decode(
    raw: &str,
    channel: ChannelKind,
    now: i64,
) -> Result<SubscriptionIntent, DecodeError> {
    let envelope: Envelope<'_> =
        serde_json::from_str(raw).map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;

    if envelope.kind != SUBSCRIPTION_TYPE {
        return Err(DecodeError::UnknownPayloadType(envelope.kind));
    }

    let data = envelope
        .data
        .ok_or_else(|| DecodeError::MalformedSubscription("missing data".to_string()))?;
    let body: RawSubscription = serde_json::from_str(data.get())
        .map_err(|e| DecodeError::MalformedSubscription(e.to_string()))?;

    let pair = parse_pair(&body.pair.base_token, &body.pair.quote_token)?;

    let params = if channel.is_parameterized() {
        Some(normalize_params(body.params.unwrap_or_default(), now)?)
    } else {
        None
    };

    Ok(SubscriptionIntent {
        event: body.event,
        pair,
        params,
    })
}

fn normalize_params(raw: RawParams, now: i64) -> Result<OhlcvParams, DecodeError> {
    let from = raw.from.filter(|v| *v != 0).unwrap_or(0);
    let to = raw.to.filter(|v| *v != 0).unwrap_or(now);

    let duration = match raw.duration.filter(|v| *v != 0) {
        None => DEFAULT_DURATION,
        Some(d) => u32::try_from(d)
            .map_err(|_| DecodeError::InvalidParams(format!("duration {d} out of range")))?,
    };

    let units = match raw.units.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        None => TimeUnit::default(),
        Some(u) => TimeUnit::parse(u)
            .ok_or_else(|| DecodeError::InvalidParams(format!("unknown units {u:?}")))?,
    };

    let spec = BucketSpec::new(units, duration).ok_or_else(|| {
        DecodeError::InvalidParams(format!("bucket of {duration} {units} is too wide"))
    })?;

    Ok(OhlcvParams { spec, from, to })
}

// =============================================================================
// Tests
// =============================================================================
