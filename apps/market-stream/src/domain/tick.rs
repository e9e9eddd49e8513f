//! Price Tick Types
//!
//! `PriceTick` is the canonical observation produced once at the codec
//! boundary. Every provider-specific payload is mapped into this shape
//! before anything downstream sees it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// One normalized price/volume observation for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Ticker symbol.
    pub symbol: String,
    /// Trade price. Always strictly positive.
    pub price: Decimal,
    /// Traded volume. Never negative.
    pub volume: Decimal,
    /// Exchange timestamp of the observation.
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    /// Build a validated tick.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the symbol is blank, the price is not
    /// strictly positive, or the volume is negative.
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        volume: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let symbol = symbol.into().trim().to_string();
        if symbol.is_empty() {
            return Err(ValidationError::MissingField("symbol"));
        }
        if price <= Decimal::ZERO {
            return Err(ValidationError::NonPositivePrice { symbol, price });
        }
        if volume < Decimal::ZERO {
            return Err(ValidationError::NegativeVolume { symbol, volume });
        }

        Ok(Self {
            symbol,
            price,
            volume,
            timestamp,
        })
    }
}

/// Reasons a decoded tick is discarded before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field was absent from the payload.
    #[error("tick is missing required field `{0}`")]
    MissingField(&'static str),

    /// Price was zero or negative.
    #[error("non-positive price {price} for {symbol}")]
    NonPositivePrice {
        /// Symbol of the rejected tick.
        symbol: String,
        /// Offending price.
        price: Decimal,
    },

    /// Volume was negative.
    #[error("negative volume {volume} for {symbol}")]
    NegativeVolume {
        /// Symbol of the rejected tick.
        symbol: String,
        /// Offending volume.
        volume: Decimal,
    },

    /// Timestamp could not be represented.
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

/// Movement between two consecutive prices of the same symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceChange {
    /// Absolute change (`current - previous`).
    pub change: Decimal,
    /// Change relative to the previous price, in percent.
    pub percent: f64,
}

impl PriceChange {
    /// Compute the movement from `previous` to `current`.
    ///
    /// A zero `previous` yields a percent of `0.0`. Ratios too large for
    /// `Decimal` are computed in `f64` instead.
    #[must_use]
    pub fn between(previous: Decimal, current: Decimal) -> Self {
        let change = current.saturating_sub(previous);
        if previous.is_zero() {
            return Self {
                change,
                percent: 0.0,
            };
        }

        let percent = change
            .checked_div(previous)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .and_then(|percent| percent.to_f64())
            .unwrap_or_else(|| float_percent(change, previous));

        Self { change, percent }
    }
}

fn float_percent(change: Decimal, previous: Decimal) -> f64 {
    let (Some(change), Some(previous)) = (change.to_f64(), previous.to_f64()) else {
        return 0.0;
    };
    let percent = change / previous * 100.0;
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(f64::MIN, f64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn valid_tick_is_trimmed() {
        let tick = PriceTick::new(" AAPL ", dec("150.00"), dec("1000"), Utc::now()).unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price, dec("150"));
    }

    #[test]
    fn blank_symbol_rejected() {
        let err = PriceTick::new("  ", dec("1"), Decimal::ZERO, Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("symbol"));
    }

    #[test]
    fn non_positive_price_rejected() {
        let zero = PriceTick::new("AAPL", Decimal::ZERO, Decimal::ZERO, Utc::now());
        assert!(matches!(
            zero,
            Err(ValidationError::NonPositivePrice { .. })
        ));

        let negative = PriceTick::new("AAPL", dec("-3.5"), Decimal::ZERO, Utc::now());
        assert!(matches!(
            negative,
            Err(ValidationError::NonPositivePrice { .. })
        ));
    }

    #[test]
    fn negative_volume_rejected() {
        let result = PriceTick::new("AAPL", dec("10"), dec("-1"), Utc::now());
        assert!(matches!(result, Err(ValidationError::NegativeVolume { .. })));
    }

    #[test]
    fn change_between_prices() {
        let change = PriceChange::between(dec("150.00"), dec("151.80"));
        assert_eq!(change.change, dec("1.80"));
        assert!((change.percent - 1.2).abs() < 1e-9);

        let drop = PriceChange::between(dec("200"), dec("190"));
        assert_eq!(drop.change, dec("-10"));
        assert!((drop.percent + 5.0).abs() < 1e-9);
    }

    #[test]
    fn change_ratio_beyond_decimal_range_does_not_panic() {
        let tiny = dec("0.00000000000000000001");
        let change = PriceChange::between(tiny, dec("1000000000"));
        assert!(change.percent.is_finite());
        assert!((change.percent / 1e31 - 1.0).abs() < 1e-6);

        let crash = PriceChange::between(dec("1000000000"), tiny);
        assert!((crash.percent + 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_previous_price_has_no_percent() {
        let change = PriceChange::between(Decimal::ZERO, dec("5"));
        assert_eq!(change.change, dec("5"));
        assert_eq!(change.percent, 0.0);
    }
}
