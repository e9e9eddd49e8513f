//! Price Alert Rules
//!
//! One rule per symbol. A rule carries up to three conditions; any of them
//! matching fires the rule. Rules flagged `once` are consumed by the first
//! firing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Conditions attached to an alert rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertConditions {
    /// Fires when `price >= above`.
    pub above: Option<Decimal>,
    /// Fires when `price <= below`.
    pub below: Option<Decimal>,
    /// Fires when `|change_percent| >= change_percent`.
    pub change_percent: Option<f64>,
    /// Remove the rule right after it fires.
    pub once: bool,
}

impl AlertConditions {
    /// Empty condition set; never fires until a condition is added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire when the price reaches or exceeds `threshold`.
    #[must_use]
    pub const fn above(mut self, threshold: Decimal) -> Self {
        self.above = Some(threshold);
        self
    }

    /// Fire when the price reaches or drops under `threshold`.
    #[must_use]
    pub const fn below(mut self, threshold: Decimal) -> Self {
        self.below = Some(threshold);
        self
    }

    /// Fire when the tick-to-tick move is at least `percent` in either direction.
    #[must_use]
    pub const fn change_percent(mut self, percent: f64) -> Self {
        self.change_percent = Some(percent);
        self
    }

    /// Consume the rule on its first firing.
    #[must_use]
    pub const fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Whether at least one condition is set.
    #[must_use]
    pub const fn has_conditions(&self) -> bool {
        self.above.is_some() || self.below.is_some() || self.change_percent.is_some()
    }
}

/// Which condition matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum AlertReason {
    /// Price at or above the threshold.
    Above {
        /// Configured threshold.
        threshold: Decimal,
    },
    /// Price at or below the threshold.
    Below {
        /// Configured threshold.
        threshold: Decimal,
    },
    /// Move magnitude at or above the threshold.
    ChangePercent {
        /// Configured threshold, in percent.
        threshold: f64,
        /// Observed move, in percent.
        actual: f64,
    },
}

/// Alert rule registered for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    /// Symbol the rule watches.
    pub symbol: String,
    /// Conditions to evaluate.
    pub conditions: AlertConditions,
    /// When the rule was set.
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// Create a rule for `symbol`.
    #[must_use]
    pub fn new(symbol: impl Into<String>, conditions: AlertConditions) -> Self {
        Self {
            symbol: symbol.into(),
            conditions,
            created_at: Utc::now(),
        }
    }

    /// Every condition matched by `price` and the optional move.
    ///
    /// `change_percent` is `None` on the first observation of a symbol, in
    /// which case the change condition cannot match.
    #[must_use]
    pub fn evaluate(&self, price: Decimal, change_percent: Option<f64>) -> Vec<AlertReason> {
        let mut reasons = Vec::new();

        if let Some(threshold) = self.conditions.above
            && price >= threshold
        {
            reasons.push(AlertReason::Above { threshold });
        }

        if let Some(threshold) = self.conditions.below
            && price <= threshold
        {
            reasons.push(AlertReason::Below { threshold });
        }

        if let (Some(threshold), Some(actual)) = (self.conditions.change_percent, change_percent)
            && actual.abs() >= threshold
        {
            reasons.push(AlertReason::ChangePercent { threshold, actual });
        }

        reasons
    }
}
