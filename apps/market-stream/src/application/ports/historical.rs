//! Historical Data Port (Driven Port)
//!
//! Backfill collaborator used to seed tick history. Fetching and provider
//! fallback live outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::tick::PriceTick;

/// Historical data error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoricalDataError {
    /// Provider could not be reached or returned an error.
    #[error("historical data provider error: {message}")]
    Provider {
        /// Error details.
        message: String,
    },

    /// No data exists for the symbol in the range.
    #[error("no historical data for {symbol}")]
    NoData {
        /// Requested symbol.
        symbol: String,
    },
}

/// Port for fetching past ticks.
#[async_trait]
pub trait HistoricalDataPort: Send + Sync {
    /// Ticks for `symbol` within `[start, end]`, oldest first.
    async fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceTick>, HistoricalDataError>;
}
