//! Diesel models mapping to the database schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`] for use with Diesel Queryable/Insertable APIs:
//! - [`crate::schema::bars_5m`]: authoritative 5-minute bars, one row per `(symbol, ts)`
//! - [`crate::schema::bars_15m`]: derived 15-minute VWAP bars, one row per `(symbol, window_start)`
//! - [`crate::schema::pipeline_watermark`]: per-pipeline progress and run token
//! - the append-only operational log tables written by [`crate::oplog`]
//!
//! Timestamps are RFC3339 UTC strings with millisecond precision; prices are decimal text.

use std::str::FromStr;

use anyhow::Context;
use diesel::prelude::*;
use rust_decimal::Decimal;

use crate::{
    bar::{AggregatedBar, AssetType, Bar, SourceId},
    schema::*,
    tz,
};

fn price_text(p: Option<Decimal>) -> Option<String> {
    p.map(|d| d.normalize().to_string())
}

fn price_parse(col: &str, v: Option<&str>) -> anyhow::Result<Option<Decimal>> {
    v.map(|s| Decimal::from_str(s).with_context(|| format!("bad decimal in {col}: {s:?}")))
        .transpose()
}

/// A row in [`crate::schema::bars_5m`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = bars_5m, check_for_backend(diesel::sqlite::Sqlite))]
pub struct BarRow {
    /// Instrument identifier.
    pub symbol: String,
    /// Bar open instant in RFC3339 UTC.
    pub ts: String,
    /// Open price as decimal text.
    pub open: Option<String>,
    /// High price as decimal text.
    pub high: Option<String>,
    /// Low price as decimal text.
    pub low: Option<String>,
    /// Close price as decimal text.
    pub close: Option<String>,
    /// Integral volume.
    pub volume: i64,
    /// Asset type code.
    pub asset_type: String,
    /// Source id that supplied the surviving value.
    pub source: String,
    /// When the surviving value entered staging.
    pub ingest_time: String,
    /// First insert time.
    pub created_at: String,
    /// Last write time (the writer's `ingest_time`).
    pub updated_at: String,
}

impl BarRow {
    /// Decode into the domain type.
    pub fn into_bar(self) -> anyhow::Result<Bar> {
        Ok(Bar {
            timestamp: tz::parse_ts_to_utc(&self.ts)?,
            open: price_parse("open", self.open.as_deref())?,
            high: price_parse("high", self.high.as_deref())?,
            low: price_parse("low", self.low.as_deref())?,
            close: price_parse("close", self.close.as_deref())?,
            volume: self.volume,
            asset_type: AssetType::from_str(&self.asset_type)?,
            source: SourceId::new(&self.source)?,
            ingest_time: tz::parse_ts_to_utc(&self.ingest_time)?,
            symbol: self.symbol,
        })
    }
}

/// Insertable form of [`BarRow`]; `created_at` comes from the column default.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = bars_5m)]
pub struct NewBar {
    /// Instrument identifier.
    pub symbol: String,
    /// Bar open instant in RFC3339 UTC.
    pub ts: String,
    /// Open price.
    pub open: Option<String>,
    /// High price.
    pub high: Option<String>,
    /// Low price.
    pub low: Option<String>,
    /// Close price.
    pub close: Option<String>,
    /// Volume.
    pub volume: i64,
    /// Asset type code.
    pub asset_type: String,
    /// Source id.
    pub source: String,
    /// Staging instant.
    pub ingest_time: String,
    /// Write instant.
    pub updated_at: String,
}

/// Value columns of [`crate::schema::bars_5m`]; `None` prices are written as NULL.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = bars_5m, treat_none_as_null = true)]
pub struct BarChangeset {
    /// Open price.
    pub open: Option<String>,
    /// High price.
    pub high: Option<String>,
    /// Low price.
    pub low: Option<String>,
    /// Close price.
    pub close: Option<String>,
    /// Volume.
    pub volume: i64,
    /// Asset type code.
    pub asset_type: String,
    /// Source id.
    pub source: String,
    /// Staging instant.
    pub ingest_time: String,
    /// Write instant.
    pub updated_at: String,
}

impl From<&Bar> for NewBar {
    fn from(b: &Bar) -> Self {
        let ingest = tz::to_rfc3339_millis(b.ingest_time);
        NewBar {
            symbol: b.symbol.clone(),
            ts: tz::to_rfc3339_millis(b.timestamp),
            open: price_text(b.open),
            high: price_text(b.high),
            low: price_text(b.low),
            close: price_text(b.close),
            volume: b.volume,
            asset_type: b.asset_type.as_str().to_string(),
            source: b.source.to_string(),
            updated_at: ingest.clone(),
            ingest_time: ingest,
        }
    }
}

impl From<&NewBar> for BarChangeset {
    fn from(n: &NewBar) -> Self {
        BarChangeset {
            open: n.open.clone(),
            high: n.high.clone(),
            low: n.low.clone(),
            close: n.close.clone(),
            volume: n.volume,
            asset_type: n.asset_type.clone(),
            source: n.source.clone(),
            ingest_time: n.ingest_time.clone(),
            updated_at: n.updated_at.clone(),
        }
    }
}

/// A row in [`crate::schema::bars_15m`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = bars_15m, check_for_backend(diesel::sqlite::Sqlite))]
pub struct AggregatedRow {
    /// Instrument identifier.
    pub symbol: String,
    /// Window start in RFC3339 UTC.
    pub window_start: String,
    /// First open.
    pub open: Option<String>,
    /// Max high.
    pub high: Option<String>,
    /// Min low.
    pub low: Option<String>,
    /// Last close.
    pub close: Option<String>,
    /// Summed volume.
    pub volume: i64,
    /// VWAP as decimal text; NULL when volume sums to zero.
    pub vwap: Option<String>,
    /// Member bar count.
    pub bar_count: i32,
    /// Asset type code.
    pub asset_type: String,
    /// When the row was computed.
    pub computed_at: String,
}

/// Value columns of [`crate::schema::bars_15m`].
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = bars_15m, treat_none_as_null = true)]
pub struct AggregatedChangeset {
    /// First open.
    pub open: Option<String>,
    /// Max high.
    pub high: Option<String>,
    /// Min low.
    pub low: Option<String>,
    /// Last close.
    pub close: Option<String>,
    /// Summed volume.
    pub volume: i64,
    /// VWAP.
    pub vwap: Option<String>,
    /// Member bar count.
    pub bar_count: i32,
    /// Asset type code.
    pub asset_type: String,
    /// When the row was computed.
    pub computed_at: String,
}

impl AggregatedRow {
    /// Encode a rollup, stamping `computed_at`.
    pub fn from_aggregate(a: &AggregatedBar, computed_at: &str) -> Self {
        AggregatedRow {
            symbol: a.symbol.clone(),
            window_start: tz::to_rfc3339_millis(a.window_start),
            open: price_text(a.open),
            high: price_text(a.high),
            low: price_text(a.low),
            close: price_text(a.close),
            volume: a.volume,
            vwap: price_text(a.vwap),
            bar_count: a.bar_count,
            asset_type: a.asset_type.as_str().to_string(),
            computed_at: computed_at.to_string(),
        }
    }

    /// Value columns only.
    pub fn changeset(&self) -> AggregatedChangeset {
        AggregatedChangeset {
            open: self.open.clone(),
            high: self.high.clone(),
            low: self.low.clone(),
            close: self.close.clone(),
            volume: self.volume,
            vwap: self.vwap.clone(),
            bar_count: self.bar_count,
            asset_type: self.asset_type.clone(),
            computed_at: self.computed_at.clone(),
        }
    }

    /// Decode into the domain type.
    pub fn into_aggregate(self) -> anyhow::Result<AggregatedBar> {
        Ok(AggregatedBar {
            window_start: tz::parse_ts_to_utc(&self.window_start)?,
            open: price_parse("open", self.open.as_deref())?,
            high: price_parse("high", self.high.as_deref())?,
            low: price_parse("low", self.low.as_deref())?,
            close: price_parse("close", self.close.as_deref())?,
            volume: self.volume,
            vwap: price_parse("vwap", self.vwap.as_deref())?,
            bar_count: self.bar_count,
            asset_type: AssetType::from_str(&self.asset_type)?,
            symbol: self.symbol,
        })
    }
}

/// A row in [`crate::schema::pipeline_watermark`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = pipeline_watermark, check_for_backend(diesel::sqlite::Sqlite))]
pub struct WatermarkRow {
    /// Pipeline name (primary key).
    pub pipeline_name: String,
    /// Last committed timestamp in RFC3339 UTC.
    pub last_processed_ts: Option<String>,
    /// `idle` | `running` | `failed` | `completed`.
    pub status: String,
    /// Detail of the last failure.
    pub last_error: Option<String>,
    /// Holder of the current run token.
    pub owner: Option<String>,
    /// Start of the current or last run.
    pub started_at: Option<String>,
    /// Last state change.
    pub updated_at: String,
}

/// Insertable row for [`crate::schema::quality_errors`].
#[derive(Debug, Insertable)]
#[diesel(table_name = quality_errors)]
pub struct NewQualityError<'a> {
    /// Raw symbol text.
    pub symbol: Option<&'a str>,
    /// Raw timestamp text.
    pub raw_ts: Option<&'a str>,
    /// Error category code.
    pub error_type: &'a str,
    /// Reason.
    pub detail: &'a str,
    /// Raw record JSON.
    pub raw_payload: Option<&'a str>,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::cast_errors`].
#[derive(Debug, Insertable)]
#[diesel(table_name = cast_errors)]
pub struct NewCastError<'a> {
    /// Symbol.
    pub symbol: Option<&'a str>,
    /// Bar timestamp.
    pub ts: Option<&'a str>,
    /// Field that failed coercion.
    pub field_name: &'a str,
    /// Raw value.
    pub raw_value: &'a str,
    /// Intended type.
    pub target_type: &'a str,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::dedup_conflicts`].
#[derive(Debug, Insertable)]
#[diesel(table_name = dedup_conflicts)]
pub struct NewDedupConflict<'a> {
    /// Symbol.
    pub symbol: &'a str,
    /// Bar timestamp.
    pub ts: &'a str,
    /// Shared source.
    pub source: &'a str,
    /// Stored value JSON.
    pub existing_payload: &'a str,
    /// Incoming value JSON.
    pub incoming_payload: &'a str,
    /// Resolution tag.
    pub resolution: &'a str,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::authority_conflicts`].
#[derive(Debug, Insertable)]
#[diesel(table_name = authority_conflicts)]
pub struct NewAuthorityConflict<'a> {
    /// Symbol.
    pub symbol: &'a str,
    /// Bar timestamp.
    pub ts: &'a str,
    /// Source of the stored value.
    pub existing_source: &'a str,
    /// Source of the incoming value.
    pub incoming_source: &'a str,
    /// Winning source.
    pub preferred_source: &'a str,
    /// Resolution tag.
    pub resolution: &'a str,
    /// Stored value JSON.
    pub existing_payload: &'a str,
    /// Incoming value JSON.
    pub incoming_payload: &'a str,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::upsert_failures`].
#[derive(Debug, Insertable)]
#[diesel(table_name = upsert_failures)]
pub struct NewUpsertFailure<'a> {
    /// Target table.
    pub table_name: &'a str,
    /// Symbol.
    pub symbol: &'a str,
    /// Key timestamp.
    pub ts: &'a str,
    /// Last error.
    pub error_detail: &'a str,
    /// Attempts made.
    pub attempts: i32,
    /// Value JSON for manual replay.
    pub payload: Option<&'a str>,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::concurrency_issues`].
#[derive(Debug, Insertable)]
#[diesel(table_name = concurrency_issues)]
pub struct NewConcurrencyIssue<'a> {
    /// Target table.
    pub table_name: &'a str,
    /// Symbol.
    pub symbol: &'a str,
    /// Key timestamp.
    pub ts: &'a str,
    /// Actor holding the lock, when known.
    pub blocking_actor: Option<&'a str>,
    /// Driver message.
    pub detail: &'a str,
    /// Attempt number (1-based).
    pub attempt: i32,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::transform_errors`].
#[derive(Debug, Insertable)]
#[diesel(table_name = transform_errors)]
pub struct NewTransformError<'a> {
    /// Symbol.
    pub symbol: &'a str,
    /// Window start.
    pub window_start: &'a str,
    /// `missing_window` | `divide_by_zero` | `numeric_overflow`.
    pub error_type: &'a str,
    /// Reason.
    pub detail: &'a str,
    /// Log instant.
    pub logged_at: &'a str,
}

/// Insertable row for [`crate::schema::fetch_log`].
#[derive(Debug, Insertable)]
#[diesel(table_name = fetch_log)]
pub struct NewFetchLog<'a> {
    /// Pipeline name.
    pub pipeline_name: &'a str,
    /// Symbol.
    pub symbol: &'a str,
    /// Window start.
    pub window_start: &'a str,
    /// Window end (exclusive).
    pub window_end: &'a str,
    /// Records returned by the fetcher.
    pub raw_rows: i32,
    /// Records that passed validation and the window filter.
    pub accepted_rows: i32,
    /// Fetch failure, if any.
    pub error: Option<&'a str>,
    /// Log instant.
    pub logged_at: &'a str,
}
