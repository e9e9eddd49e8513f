//! Finnhub Trades Codec
//!
//! The API token travels in the connection URL (`?token=`), so there is no
//! in-band authentication step.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"type":"trade","data":[{"s":"AAPL","p":150.25,"v":100,"t":1700000000000}]}
//! {"type":"ping"}
//! {"type":"error","msg":"Invalid symbol"}
//! ```
//!
//! Client frames, one per symbol:
//!
//! ```json
//! {"type":"subscribe","symbol":"AAPL"}
//! ```

use serde::Deserialize;
use serde_json::Number;

use super::codec::{CodecError, FeedCodec, FeedMessage, build_tick, frame_values};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum FinnhubEvent {
    Trade {
        #[serde(default)]
        data: Vec<FinnhubTrade>,
    },
    Ping,
    Error {
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct FinnhubTrade {
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "p")]
    price: Option<Number>,
    #[serde(rename = "v")]
    volume: Option<Number>,
    #[serde(rename = "t")]
    timestamp: Option<i64>,
}

/// Finnhub codec.
#[derive(Debug, Default, Clone)]
pub struct FinnhubCodec;

impl FinnhubCodec {
    /// Create a new Finnhub codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn control_frames(kind: &str, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .map(|symbol| serde_json::json!({ "type": kind, "symbol": symbol }).to_string())
            .collect()
    }
}

impl FeedCodec for FinnhubCodec {
    fn name(&self) -> &'static str {
        "finnhub"
    }

    fn endpoint_url(&self, endpoint: &str, api_key: &str) -> String {
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        format!("{endpoint}{separator}token={api_key}")
    }

    fn auth_frame(&self, _api_key: &str) -> Option<String> {
        None
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        Self::control_frames("subscribe", symbols)
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        Self::control_frames("unsubscribe", symbols)
    }

    fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let mut messages = Vec::new();

        for value in frame_values(text)? {
            match serde_json::from_value::<FinnhubEvent>(value)? {
                FinnhubEvent::Trade { data } => {
                    messages.extend(data.into_iter().map(|trade| {
                        build_tick(
                            trade.symbol,
                            trade.price.as_ref(),
                            trade.volume.as_ref(),
                            trade.timestamp,
                        )
                    }));
                }
                FinnhubEvent::Ping => messages.push(FeedMessage::Keepalive),
                FinnhubEvent::Error { msg } => messages.push(FeedMessage::ProviderError(msg)),
                FinnhubEvent::Other => {}
            }
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn token_goes_in_url() {
        let codec = FinnhubCodec::new();
        assert_eq!(
            codec.endpoint_url("wss://ws.finnhub.io", "abc"),
            "wss://ws.finnhub.io?token=abc"
        );
        assert_eq!(
            codec.endpoint_url("wss://ws.finnhub.io?x=1", "abc"),
            "wss://ws.finnhub.io?x=1&token=abc"
        );
        assert!(codec.auth_frame("abc").is_none());
    }

    #[test]
    fn one_frame_per_symbol() {
        let codec = FinnhubCodec::new();
        let frames: Vec<serde_json::Value> = codec
            .unsubscribe_frames(&["AAPL".into(), "MSFT".into()])
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(
            frames,
            vec![
                serde_json::json!({"type": "unsubscribe", "symbol": "AAPL"}),
                serde_json::json!({"type": "unsubscribe", "symbol": "MSFT"}),
            ]
        );
    }

    #[test]
    fn decodes_trade_batches() {
        let codec = FinnhubCodec::new();
        let messages = codec
            .decode(
                r#"{"type":"trade","data":[
                    {"s":"AAPL","p":150.0,"v":10,"t":1700000000000},
                    {"s":"AAPL","p":0,"v":10,"t":1700000000001}]}"#,
            )
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], FeedMessage::Tick(t) if t.price == Decimal::from(150)));
        assert!(matches!(messages[1], FeedMessage::Rejected(_)));
    }

    #[test]
    fn decodes_ping_and_error() {
        let codec = FinnhubCodec::new();
        assert_eq!(
            codec.decode(r#"{"type":"ping"}"#).unwrap(),
            vec![FeedMessage::Keepalive]
        );
        assert_eq!(
            codec
                .decode(r#"{"type":"error","msg":"Invalid symbol"}"#)
                .unwrap(),
            vec![FeedMessage::ProviderError("Invalid symbol".into())]
        );
    }

    #[test]
    fn missing_type_is_an_error() {
        let codec = FinnhubCodec::new();
        assert!(codec.decode(r#"{"data":[]}"#).is_err());
    }
}
