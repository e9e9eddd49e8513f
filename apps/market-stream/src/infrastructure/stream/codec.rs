//! Feed Codec Module
//!
//! Provider wire formats are confined to this module and its provider
//! submodules. Each codec turns text frames into [`FeedMessage`]s, the
//! tagged variant the stream client understands, and renders the control
//! frames (authentication, subscribe, unsubscribe) the provider expects.
//!
//! - **Polygon**: JSON arrays of `ev`-tagged events, auth frame after connect
//! - **Finnhub**: JSON objects tagged by `type`, token carried in the URL

use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde_json::{Number, Value};

use super::finnhub::FinnhubCodec;
use super::polygon::PolygonCodec;
use crate::domain::tick::{PriceTick, ValidationError};
use crate::infrastructure::config::Provider;

/// Codec errors. The offending frame is dropped as a whole.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON in an unexpected shape.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// One decoded unit from a feed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// A validated price tick.
    Tick(PriceTick),
    /// Transport-level greeting from the provider.
    Connected,
    /// Credential accepted.
    Authenticated,
    /// Credential rejected.
    AuthFailed(String),
    /// Subscription change acknowledged.
    SubscriptionAck(String),
    /// Application-level keepalive.
    Keepalive,
    /// Error reported by the provider.
    ProviderError(String),
    /// A tick-shaped payload that failed validation.
    Rejected(ValidationError),
}

/// Provider wire format.
pub trait FeedCodec: Send + Sync + std::fmt::Debug {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// URL to dial for `endpoint`. Providers that authenticate through the
    /// URL embed the key here.
    fn endpoint_url(&self, endpoint: &str, _api_key: &str) -> String {
        endpoint.to_string()
    }

    /// Frame sent right after connecting, if the provider authenticates
    /// in-band. When `None` the connection counts as authenticated as soon
    /// as the transport is open.
    fn auth_frame(&self, api_key: &str) -> Option<String>;

    /// Frames that subscribe `symbols`. Empty input yields no frames.
    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Frames that unsubscribe `symbols`. Empty input yields no frames.
    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON or does not match the
    /// provider's message shapes.
    fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError>;
}

/// Codec for `provider`.
#[must_use]
pub fn codec_for(provider: Provider) -> Arc<dyn FeedCodec> {
    match provider {
        Provider::Polygon => Arc::new(PolygonCodec::new()),
        Provider::Finnhub => Arc::new(FinnhubCodec::new()),
    }
}

/// Split a frame into its top-level JSON values. Providers batch events in
/// arrays but send some control messages as bare objects.
pub(super) fn frame_values(text: &str) -> Result<Vec<Value>, CodecError> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Array(values) => Ok(values),
        value @ Value::Object(_) => Ok(vec![value]),
        other => {
            let preview: String = other.to_string().chars().take(50).collect();
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}"
            )))
        }
    }
}

/// Convert a JSON number without going through binary floating point.
pub(super) fn decimal_from_number(number: &Number) -> Option<Decimal> {
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Validate raw tick fields into a [`FeedMessage`].
///
/// Missing volume counts as zero; everything else is required.
pub(super) fn build_tick(
    symbol: Option<String>,
    price: Option<&Number>,
    volume: Option<&Number>,
    timestamp_ms: Option<i64>,
) -> FeedMessage {
    match validate_tick(symbol, price, volume, timestamp_ms) {
        Ok(tick) => FeedMessage::Tick(tick),
        Err(error) => FeedMessage::Rejected(error),
    }
}

fn validate_tick(
    symbol: Option<String>,
    price: Option<&Number>,
    volume: Option<&Number>,
    timestamp_ms: Option<i64>,
) -> Result<PriceTick, ValidationError> {
    let symbol = symbol.ok_or(ValidationError::MissingField("symbol"))?;
    let price = price
        .and_then(decimal_from_number)
        .ok_or(ValidationError::MissingField("price"))?;
    let volume = match volume {
        Some(number) => {
            decimal_from_number(number).ok_or(ValidationError::MissingField("volume"))?
        }
        None => Decimal::ZERO,
    };
    let millis = timestamp_ms.ok_or(ValidationError::MissingField("timestamp"))?;
    let timestamp =
        DateTime::from_timestamp_millis(millis).ok_or(ValidationError::InvalidTimestamp(millis))?;

    PriceTick::new(symbol, price, volume, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(json: &str) -> Number {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn frame_values_accepts_array_and_object() {
        assert_eq!(frame_values(r#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(frame_values(r#" {"a":1} "#).unwrap().len(), 1);
        assert!(frame_values("[]").unwrap().is_empty());
    }

    #[test]
    fn frame_values_rejects_scalars_and_garbage() {
        assert!(matches!(
            frame_values("42"),
            Err(CodecError::InvalidFormat(_))
        ));
        assert!(matches!(frame_values("{not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn decimals_keep_their_digits() {
        assert_eq!(
            decimal_from_number(&number("151.80")),
            Some(Decimal::from_str("151.8").unwrap())
        );
        assert_eq!(decimal_from_number(&number("1000")), Some(Decimal::from(1000)));
        assert_eq!(
            decimal_from_number(&number("1.5e2")),
            Some(Decimal::from(150))
        );
    }

    #[test]
    fn build_tick_validates() {
        let price = number("150.0");
        let ok = build_tick(Some("AAPL".into()), Some(&price), None, Some(1_700_000_000_000));
        let FeedMessage::Tick(tick) = &ok else {
            panic!("expected tick, got {ok:?}");
        };
        assert_eq!(tick.volume, Decimal::ZERO);
        assert_eq!(tick.timestamp.timestamp_millis(), 1_700_000_000_000);

        let missing = build_tick(None, Some(&price), None, Some(0));
        assert_eq!(
            missing,
            FeedMessage::Rejected(ValidationError::MissingField("symbol"))
        );

        let zero = number("0");
        let rejected = build_tick(Some("AAPL".into()), Some(&zero), None, Some(0));
        assert!(matches!(
            rejected,
            FeedMessage::Rejected(ValidationError::NonPositivePrice { .. })
        ));
    }

    #[test]
    fn codec_for_selects_provider() {
        assert_eq!(codec_for(Provider::Polygon).name(), "polygon");
        assert_eq!(codec_for(Provider::Finnhub).name(), "finnhub");
    }
}
