//! Polygon.io Stocks Codec
//!
//! # Wire Format (JSON)
//!
//! Server frames are arrays of events tagged by `ev`:
//!
//! ```json
//! [{"ev":"status","status":"connected","message":"Connected Successfully"}]
//! [{"ev":"status","status":"auth_success","message":"authenticated"}]
//! [{"ev":"T","sym":"AAPL","p":150.25,"s":100,"t":1700000000000}]
//! [{"ev":"AM","sym":"AAPL","c":150.3,"v":12000,"s":1700000000000,"e":1700000060000}]
//! ```
//!
//! Client frames:
//!
//! ```json
//! {"action":"auth","params":"API_KEY"}
//! {"action":"subscribe","params":"T.AAPL,T.MSFT"}
//! ```

use serde::Deserialize;
use serde_json::Number;

use super::codec::{CodecError, FeedCodec, FeedMessage, build_tick, frame_values};

/// Event tagged by `ev`. Unknown event kinds (quotes, LULD, ...) are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "ev")]
enum PolygonEvent {
    #[serde(rename = "status")]
    Status {
        status: String,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "T")]
    Trade {
        #[serde(rename = "sym")]
        symbol: Option<String>,
        #[serde(rename = "p")]
        price: Option<Number>,
        #[serde(rename = "s")]
        size: Option<Number>,
        #[serde(rename = "t")]
        timestamp: Option<i64>,
    },
    #[serde(rename = "AM", alias = "A")]
    Aggregate {
        #[serde(rename = "sym")]
        symbol: Option<String>,
        #[serde(rename = "c")]
        close: Option<Number>,
        #[serde(rename = "v")]
        volume: Option<Number>,
        #[serde(rename = "e")]
        end: Option<i64>,
    },
    #[serde(other)]
    Other,
}

/// Polygon.io codec. Subscribes to trade (`T.`) channels.
#[derive(Debug, Default, Clone)]
pub struct PolygonCodec;

impl PolygonCodec {
    /// Create a new Polygon codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn control_frame(action: &str, symbols: &[String]) -> Vec<String> {
        if symbols.is_empty() {
            return Vec::new();
        }
        let params = symbols
            .iter()
            .map(|s| format!("T.{s}"))
            .collect::<Vec<_>>()
            .join(",");
        vec![serde_json::json!({ "action": action, "params": params }).to_string()]
    }

    fn map_event(event: PolygonEvent) -> Option<FeedMessage> {
        match event {
            PolygonEvent::Status { status, message } => Some(match status.as_str() {
                "connected" => FeedMessage::Connected,
                "auth_success" => FeedMessage::Authenticated,
                "auth_failed" => FeedMessage::AuthFailed(message),
                "success" => FeedMessage::SubscriptionAck(message),
                _ => FeedMessage::ProviderError(format!("{status}: {message}")),
            }),
            PolygonEvent::Trade {
                symbol,
                price,
                size,
                timestamp,
            } => Some(build_tick(symbol, price.as_ref(), size.as_ref(), timestamp)),
            PolygonEvent::Aggregate {
                symbol,
                close,
                volume,
                end,
            } => Some(build_tick(symbol, close.as_ref(), volume.as_ref(), end)),
            PolygonEvent::Other => None,
        }
    }
}

impl FeedCodec for PolygonCodec {
    fn name(&self) -> &'static str {
        "polygon"
    }

    fn auth_frame(&self, api_key: &str) -> Option<String> {
        Some(serde_json::json!({ "action": "auth", "params": api_key }).to_string())
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        Self::control_frame("subscribe", symbols)
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        Self::control_frame("unsubscribe", symbols)
    }

    fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let values = frame_values(text)?;
        let mut messages = Vec::with_capacity(values.len());

        for value in values {
            let event: PolygonEvent = serde_json::from_value(value)?;
            if let Some(message) = Self::map_event(event) {
                messages.push(message);
            }
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::tick::ValidationError;

    #[test]
    fn auth_and_subscription_frames() {
        let codec = PolygonCodec::new();
        let parse = |frame: &str| serde_json::from_str::<serde_json::Value>(frame).unwrap();

        assert_eq!(
            parse(&codec.auth_frame("secret").unwrap()),
            serde_json::json!({"action": "auth", "params": "secret"})
        );

        let frames = codec.subscribe_frames(&["AAPL".into(), "MSFT".into()]);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            parse(&frames[0]),
            serde_json::json!({"action": "subscribe", "params": "T.AAPL,T.MSFT"})
        );
        assert!(codec.unsubscribe_frames(&[]).is_empty());
    }

    #[test]
    fn decodes_status_messages() {
        let codec = PolygonCodec::new();
        let messages = codec
            .decode(
                r#"[{"ev":"status","status":"connected","message":"Connected Successfully"},
                    {"ev":"status","status":"auth_success","message":"authenticated"},
                    {"ev":"status","status":"success","message":"subscribed to: T.AAPL"}]"#,
            )
            .unwrap();

        assert_eq!(
            messages,
            vec![
                FeedMessage::Connected,
                FeedMessage::Authenticated,
                FeedMessage::SubscriptionAck("subscribed to: T.AAPL".into()),
            ]
        );
    }

    #[test]
    fn auth_failure_carries_message() {
        let codec = PolygonCodec::new();
        let messages = codec
            .decode(r#"[{"ev":"status","status":"auth_failed","message":"bad key"}]"#)
            .unwrap();
        assert_eq!(messages, vec![FeedMessage::AuthFailed("bad key".into())]);
    }

    #[test]
    fn decodes_trades_and_aggregates() {
        let codec = PolygonCodec::new();
        let messages = codec
            .decode(
                r#"[{"ev":"T","sym":"AAPL","p":151.80,"s":1200,"t":1700000001000},
                    {"ev":"AM","sym":"MSFT","c":330.5,"v":9000,"s":1700000000000,"e":1700000060000}]"#,
            )
            .unwrap();

        let [FeedMessage::Tick(trade), FeedMessage::Tick(bar)] = messages.as_slice() else {
            panic!("expected two ticks, got {messages:?}");
        };
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.price, Decimal::from_str("151.8").unwrap());
        assert_eq!(trade.volume, Decimal::from(1200));
        assert_eq!(bar.symbol, "MSFT");
        assert_eq!(bar.timestamp.timestamp_millis(), 1_700_000_060_000);
    }

    #[test]
    fn invalid_trade_is_rejected_not_dropped() {
        let codec = PolygonCodec::new();
        let messages = codec
            .decode(r#"[{"ev":"T","sym":"AAPL","p":-1,"s":5,"t":1}]"#)
            .unwrap();
        assert!(matches!(
            messages.as_slice(),
            [FeedMessage::Rejected(ValidationError::NonPositivePrice { .. })]
        ));
    }

    #[test]
    fn unknown_events_are_skipped() {
        let codec = PolygonCodec::new();
        let messages = codec
            .decode(r#"[{"ev":"Q","sym":"AAPL","bp":1.0,"ap":1.1}]"#)
            .unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn malformed_frames_fail() {
        let codec = PolygonCodec::new();
        assert!(codec.decode("not json").is_err());
        assert!(codec.decode(r#"[{"no_tag":true}]"#).is_err());
        assert!(codec.decode(r#"[{"ev":"T","p":"abc"}]"#).is_err());
    }
}
