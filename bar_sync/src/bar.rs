//! Bar domain types shared by the validator, resolver, upsert engine and aggregator.
//!
//! - [`RawBar`]: one record as handed over by an upstream collaborator, fields untyped.
//! - [`Bar`]: a validated 5-minute observation keyed by `(symbol, timestamp)`.
//! - [`AggregatedBar`]: a 15-minute rollup keyed by `(symbol, window_start)`.
//!
//! Prices are [`Decimal`] so that VWAP arithmetic and equality checks are exact.

use std::{fmt, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Instrument class of a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    /// Listed equities and ETFs.
    Equity,
    /// Bonds and bond futures.
    Bond,
    /// Commodities and commodity futures.
    Commodity,
    /// Indices.
    Index,
}

impl AssetType {
    /// Storage code used in the `asset_type` columns.
    pub const fn as_str(self) -> &'static str {
        match self {
            AssetType::Equity => "equity",
            AssetType::Bond => "bond",
            AssetType::Commodity => "commodity",
            AssetType::Index => "index",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "equity" => AssetType::Equity,
            "bond" => AssetType::Bond,
            "commodity" => AssetType::Commodity,
            "index" => AssetType::Index,
            other => bail!("unknown asset_type: {other}"),
        })
    }
}

/// Identifier of the upstream origin of a bar (e.g. `intraday_feed`, `historical_backfill`).
///
/// The set of known sources is the configured priority list; identifiers are trimmed and
/// lowercased on construction so that configuration and records compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Build a source id, rejecting empty identifiers.
    pub fn new(raw: impl AsRef<str>) -> anyhow::Result<Self> {
        let s = raw.as_ref().trim().to_ascii_lowercase();
        if s.is_empty() {
            bail!("source identifier cannot be empty");
        }
        Ok(Self(s))
    }

    /// Borrow the normalized identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SourceId {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.0
    }
}

/// Whether an upstream timestamp marks the start or the end of its bar.
///
/// The store always keys bars by their open instant; bar-close stamps are shifted back
/// by one bar width during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampConvention {
    /// Timestamp is the bar's open instant.
    #[default]
    BarOpen,
    /// Timestamp is the bar's close instant.
    BarClose,
}

/// One raw record as delivered by an upstream fetcher, before validation.
///
/// Every field is optional and untyped; the [`crate::validate`] module decides what is
/// usable. `payload` is the opaque upstream blob kept for audit only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBar {
    /// Instrument identifier.
    pub symbol: Option<serde_json::Value>,
    /// Bar timestamp (RFC-3339 or naive market-local text, or epoch seconds).
    pub timestamp: Option<serde_json::Value>,
    /// Open price.
    pub open: Option<serde_json::Value>,
    /// High price.
    pub high: Option<serde_json::Value>,
    /// Low price.
    pub low: Option<serde_json::Value>,
    /// Close price.
    pub close: Option<serde_json::Value>,
    /// Traded volume.
    pub volume: Option<serde_json::Value>,
    /// Instrument class code.
    pub asset_type: Option<serde_json::Value>,
    /// Opaque upstream payload.
    pub payload: Option<serde_json::Value>,
}

impl RawBar {
    /// JSON rendering of the record for diagnostic rows.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A validated 5-minute OHLCV observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Upper-cased instrument identifier.
    pub symbol: String,
    /// Bar open instant (UTC).
    pub timestamp: DateTime<Utc>,
    /// Open price, absent when the upstream value could not be coerced.
    pub open: Option<Decimal>,
    /// High price.
    pub high: Option<Decimal>,
    /// Low price.
    pub low: Option<Decimal>,
    /// Close price.
    pub close: Option<Decimal>,
    /// Non-negative integral volume.
    pub volume: i64,
    /// Instrument class.
    pub asset_type: AssetType,
    /// Upstream origin.
    pub source: SourceId,
    /// Instant the record entered staging.
    pub ingest_time: DateTime<Utc>,
}

impl Bar {
    /// True when both bars carry the same observed values from the same source.
    ///
    /// `ingest_time` is bookkeeping and is ignored.
    pub fn same_observation(&self, other: &Bar) -> bool {
        self.symbol == other.symbol
            && self.timestamp == other.timestamp
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.asset_type == other.asset_type
            && self.source == other.source
    }

    /// JSON rendering used for conflict and failure payload columns.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A 15-minute rollup of authoritative 5-minute bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedBar {
    /// Instrument identifier.
    pub symbol: String,
    /// Inclusive window start (UTC, aligned to 15 minutes).
    pub window_start: DateTime<Utc>,
    /// First non-null open by timestamp.
    pub open: Option<Decimal>,
    /// Maximum high.
    pub high: Option<Decimal>,
    /// Minimum low.
    pub low: Option<Decimal>,
    /// Last non-null close by timestamp.
    pub close: Option<Decimal>,
    /// Sum of member volumes.
    pub volume: i64,
    /// Volume-weighted typical price, `None` when the volume sums to zero.
    pub vwap: Option<Decimal>,
    /// Number of 5-minute bars in the window.
    pub bar_count: i32,
    /// Instrument class of the member bars.
    pub asset_type: AssetType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar() -> Bar {
        Bar {
            symbol: "AAPL".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap(),
            open: Some(dec!(101.5)),
            high: Some(dec!(102)),
            low: Some(dec!(101)),
            close: Some(dec!(101.75)),
            volume: 1200,
            asset_type: AssetType::Equity,
            source: SourceId::new("intraday_feed").unwrap(),
            ingest_time: Utc.with_ymd_and_hms(2025, 3, 3, 14, 36, 0).unwrap(),
        }
    }

    #[test]
    fn same_observation_ignores_ingest_time() {
        let a = bar();
        let mut b = bar();
        b.ingest_time = b.ingest_time + chrono::Duration::minutes(5);
        assert!(a.same_observation(&b));

        b.close = Some(dec!(101.8));
        assert!(!a.same_observation(&b));
    }

    #[test]
    fn source_ids_are_normalized() {
        let s: SourceId = "  Intraday_Feed ".parse().unwrap();
        assert_eq!(s.as_str(), "intraday_feed");
        assert!(SourceId::new("   ").is_err());
    }

    #[test]
    fn asset_type_parses_case_insensitively() {
        assert_eq!("EQUITY".parse::<AssetType>().unwrap(), AssetType::Equity);
        assert_eq!(" index".parse::<AssetType>().unwrap(), AssetType::Index);
        assert!("crypto".parse::<AssetType>().is_err());
    }

    #[test]
    fn raw_bar_accepts_partial_json() {
        let raw: RawBar = serde_json::from_str(r#"{"symbol":"aapl","volume":10}"#).unwrap();
        assert_eq!(raw.symbol, Some(serde_json::json!("aapl")));
        assert!(raw.timestamp.is_none());
    }
}
