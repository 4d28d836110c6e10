//! 15-minute VWAP aggregation over the authoritative 5-minute store.
//!
//! [`aggregate_window`] is the pure rollup of one `(symbol, window_start)` group:
//! - typical price per bar is `(high + low + close) / 3`, or `close` when high/low are absent
//! - a window where no bar has a typical price is skipped as `missing_window`
//! - a window whose priced bars carry zero volume keeps OHLC and a null VWAP (`divide_by_zero`)
//! - open is the first non-null open, close the last non-null close, by timestamp
//! - arithmetic that leaves the decimal range keeps OHLC and a null VWAP (`numeric_overflow`)
//!
//! VWAP is rounded to 8 decimal places, midpoint away from zero.
//!
//! [`write_aggregate`] stores a rollup keyed by `(symbol, window_start)` and skips the
//! write when the stored row already carries the same values, so re-running a window is
//! a no-op. [`run_aggregation`] brackets a pass over all closed windows past the
//! watermark; [`aggregate_range`] is the on-demand form without a watermark.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::{SqliteConnection, dsl::min, prelude::*};
use indexmap::IndexMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::{
    bar::{AggregatedBar, Bar},
    bucket,
    models::AggregatedRow,
    oplog::{self, OpEvent, TransformError, TransformErrorType},
    schema::{bars_15m, bars_5m},
    timeframe::Timeframe,
    tz,
    upsert::{self, BARS_15M, RetryPolicy, WriteKey},
    watermark::WatermarkRepo,
};

/// Decimal places kept on VWAP.
pub const VWAP_SCALE: u32 = 8;

/// Outcome of rolling up one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowResult {
    /// Full rollup with VWAP.
    Complete(AggregatedBar),
    /// Rollup written with a null VWAP; the transform error explains why.
    Degraded(AggregatedBar, TransformError),
    /// Nothing written.
    Skipped(TransformError),
}

/// `Err` carries the overflow detail when `high + low + close` leaves the decimal range.
fn typical_price(b: &Bar) -> Result<Option<Decimal>, String> {
    match (b.high, b.low, b.close) {
        (Some(h), Some(l), Some(c)) => h
            .checked_add(l)
            .and_then(|s| s.checked_add(c))
            .and_then(|s| s.checked_div(Decimal::from(3)))
            .map(Some)
            .ok_or_else(|| format!("typical price of bar {} overflows", b.timestamp)),
        (_, _, Some(c)) => Ok(Some(c)),
        _ => Ok(None),
    }
}

/// Volume-weighted typical price, or the overflow detail.
fn checked_vwap(priced: &[(Decimal, i64)], volume: Decimal) -> Result<Decimal, String> {
    let notional = priced
        .iter()
        .try_fold(Decimal::ZERO, |acc, (tp, v)| {
            tp.checked_mul(Decimal::from(*v))
                .and_then(|n| acc.checked_add(n))
        })
        .ok_or_else(|| "price times volume overflows".to_string())?;
    notional
        .checked_div(volume)
        .ok_or_else(|| "vwap division overflows".to_string())
}

/// Roll up the bars of one window. Returns `None` when `bars` has nothing in the window.
///
/// Bars outside `[window_start, window_start + 15m)` are ignored; input order does not matter.
/// Arithmetic is checked: a window whose VWAP would leave the decimal range keeps its OHLC
/// and volume with a null VWAP and a `numeric_overflow` transform error.
pub fn aggregate_window(
    symbol: &str,
    window_start: DateTime<Utc>,
    bars: &[Bar],
) -> Option<WindowResult> {
    let window_end = window_start + Timeframe::FIFTEEN_MINUTES.width();
    let mut members: Vec<&Bar> = bars
        .iter()
        .filter(|b| b.symbol == symbol && b.timestamp >= window_start && b.timestamp < window_end)
        .collect();
    if members.is_empty() {
        return None;
    }
    members.sort_by_key(|b| b.timestamp);

    let transform = |error_type: TransformErrorType, detail: String| TransformError {
        symbol: symbol.to_string(),
        window_start,
        error_type,
        detail,
    };

    let mut priced: Vec<(Decimal, i64)> = Vec::with_capacity(members.len());
    let mut overflow = None;
    for b in &members {
        match typical_price(b) {
            Ok(Some(tp)) => priced.push((tp, b.volume)),
            Ok(None) => {}
            Err(detail) => {
                overflow.get_or_insert(detail);
            }
        }
    }
    if priced.is_empty() && overflow.is_none() {
        return Some(WindowResult::Skipped(transform(
            TransformErrorType::MissingWindow,
            format!("{} bar(s) in window, none with a usable price", members.len()),
        )));
    }

    let last = members[members.len() - 1];
    let mut agg = AggregatedBar {
        symbol: symbol.to_string(),
        window_start,
        open: members.iter().find_map(|b| b.open),
        high: members.iter().filter_map(|b| b.high).max(),
        low: members.iter().filter_map(|b| b.low).min(),
        close: members.iter().rev().find_map(|b| b.close),
        volume: members.iter().fold(0i64, |acc, b| acc.saturating_add(b.volume)),
        vwap: None,
        bar_count: members.len() as i32,
        asset_type: last.asset_type,
    };
    if let Some(detail) = overflow {
        return Some(WindowResult::Degraded(
            agg,
            transform(TransformErrorType::NumericOverflow, detail),
        ));
    }

    let Some(priced_volume) = priced
        .iter()
        .try_fold(Decimal::ZERO, |acc, (_, v)| acc.checked_add(Decimal::from(*v)))
    else {
        return Some(WindowResult::Degraded(
            agg,
            transform(TransformErrorType::NumericOverflow, "priced volume overflows".into()),
        ));
    };
    if priced_volume.is_zero() {
        return Some(WindowResult::Degraded(
            agg,
            transform(
                TransformErrorType::DivideByZero,
                format!("{} priced bar(s) with zero total volume", priced.len()),
            ),
        ));
    }

    match checked_vwap(&priced, priced_volume) {
        Ok(vwap) => {
            agg.vwap = Some(
                vwap.round_dp_with_strategy(VWAP_SCALE, RoundingStrategy::MidpointAwayFromZero)
                    .normalize(),
            );
            Some(WindowResult::Complete(agg))
        }
        Err(detail) => Some(WindowResult::Degraded(
            agg,
            transform(TransformErrorType::NumericOverflow, detail),
        )),
    }
}

/// What [`write_aggregate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Row inserted or replaced.
    Written,
    /// Stored row already had these values.
    Unchanged,
    /// Gave up; recorded in `upsert_failures`.
    Dropped,
}

fn same_values(a: &AggregatedRow, b: &AggregatedRow) -> bool {
    a.open == b.open
        && a.high == b.high
        && a.low == b.low
        && a.close == b.close
        && a.volume == b.volume
        && a.vwap == b.vwap
        && a.bar_count == b.bar_count
        && a.asset_type == b.asset_type
}

/// Store one rollup with the same retry discipline as the 5-minute upserts.
pub fn write_aggregate(
    conn: &mut SqliteConnection,
    agg: &AggregatedBar,
    computed_at: DateTime<Utc>,
    policy: RetryPolicy,
    actor: Option<&str>,
) -> WriteOutcome {
    let row = AggregatedRow::from_aggregate(agg, &tz::to_rfc3339_millis(computed_at));
    let key = WriteKey {
        table: BARS_15M,
        symbol: &agg.symbol,
        timestamp: agg.window_start,
    };

    upsert::with_retry(
        conn,
        policy,
        key,
        actor,
        || serde_json::to_string(agg).unwrap_or_default(),
        |conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let existing = bars_15m::table
                    .find((row.symbol.as_str(), row.window_start.as_str()))
                    .select(AggregatedRow::as_select())
                    .first(conn)
                    .optional()?;
                if existing.as_ref().is_some_and(|e| same_values(e, &row)) {
                    return Ok(WriteOutcome::Unchanged);
                }
                diesel::insert_into(bars_15m::table)
                    .values(&row)
                    .on_conflict((bars_15m::symbol, bars_15m::window_start))
                    .do_update()
                    .set(&row.changeset())
                    .execute(conn)?;
                Ok(WriteOutcome::Written)
            })
        },
    )
    .unwrap_or(WriteOutcome::Dropped)
}

/// Read one stored rollup.
pub fn get_aggregate(
    conn: &mut SqliteConnection,
    symbol: &str,
    window_start: DateTime<Utc>,
) -> anyhow::Result<Option<AggregatedBar>> {
    bars_15m::table
        .find((symbol, tz::to_rfc3339_millis(window_start)))
        .select(AggregatedRow::as_select())
        .first(conn)
        .optional()?
        .map(AggregatedRow::into_aggregate)
        .transpose()
}

/// Per-symbol counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolAggregation {
    /// Rollups written.
    pub written: usize,
    /// Rollups already up to date.
    pub unchanged: usize,
    /// Windows skipped as `missing_window`.
    pub missing_window: usize,
    /// Windows written with a null VWAP because volume summed to zero.
    pub divide_by_zero: usize,
    /// Windows written with a null VWAP because the arithmetic overflowed.
    pub numeric_overflow: usize,
    /// Writes dropped after retries.
    pub dropped: usize,
}

/// Summary of an aggregation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    /// Inclusive range start.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive range end.
    pub end: Option<DateTime<Utc>>,
    /// Counters per symbol.
    pub symbols: IndexMap<String, SymbolAggregation>,
}

impl AggregationReport {
    /// Windows written across all symbols.
    pub fn total_written(&self) -> usize {
        self.symbols.values().map(|s| s.written).sum()
    }
}

fn symbols_with_bars(
    conn: &mut SqliteConnection,
    start: &str,
    end: &str,
) -> anyhow::Result<Vec<String>> {
    Ok(bars_5m::table
        .filter(bars_5m::ts.ge(start))
        .filter(bars_5m::ts.lt(end))
        .select(bars_5m::symbol)
        .distinct()
        .order(bars_5m::symbol.asc())
        .load(conn)?)
}

/// Aggregate every closed 15-minute window overlapping `[start, end)`.
///
/// `start` is floored and `end` floored to window boundaries, so a window still open at
/// `end` is left for a later pass. `symbols = None` covers every symbol with bars in range.
pub fn aggregate_range(
    conn: &mut SqliteConnection,
    symbols: Option<&[String]>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: RetryPolicy,
    actor: Option<&str>,
) -> anyhow::Result<AggregationReport> {
    let tf = Timeframe::FIFTEEN_MINUTES;
    let start = bucket::floor_utc(start, tf);
    let end = bucket::floor_utc(end, tf);
    let mut report = AggregationReport {
        start: Some(start),
        end: Some(end),
        ..Default::default()
    };
    if end <= start {
        return Ok(report);
    }

    let symbols = match symbols {
        Some(list) => list.to_vec(),
        None => symbols_with_bars(
            conn,
            &tz::to_rfc3339_millis(start),
            &tz::to_rfc3339_millis(end),
        )?,
    };

    for symbol in symbols {
        let bars = upsert::bars_in_range(conn, &symbol, start, end)
            .with_context(|| format!("load bars for {symbol}"))?;

        let mut windows: BTreeMap<DateTime<Utc>, Vec<Bar>> = BTreeMap::new();
        for b in bars {
            windows
                .entry(bucket::floor_utc(b.timestamp, tf))
                .or_default()
                .push(b);
        }

        let stats = report.symbols.entry(symbol.clone()).or_default();
        let computed_at = Utc::now();
        for window_start in bucket::closed_buckets(start, end, tf) {
            let Some(members) = windows.remove(&window_start) else {
                continue;
            };
            let Some(result) = aggregate_window(&symbol, window_start, &members) else {
                continue;
            };
            let (agg, transform) = match result {
                WindowResult::Complete(agg) => (agg, None),
                WindowResult::Degraded(agg, t) => {
                    match t.error_type {
                        TransformErrorType::NumericOverflow => stats.numeric_overflow += 1,
                        _ => stats.divide_by_zero += 1,
                    }
                    (agg, Some(t))
                }
                WindowResult::Skipped(t) => {
                    stats.missing_window += 1;
                    tracing::warn!(symbol = %symbol, window_start = %window_start, detail = %t.detail, "window skipped");
                    oplog::record(conn, &OpEvent::Transform(t));
                    continue;
                }
            };
            if let Some(t) = transform {
                tracing::warn!(
                    symbol = %symbol,
                    window_start = %window_start,
                    error_type = t.error_type.as_str(),
                    "window written without vwap"
                );
                oplog::record(conn, &OpEvent::Transform(t));
            }
            match write_aggregate(conn, &agg, computed_at, policy, actor) {
                WriteOutcome::Written => stats.written += 1,
                WriteOutcome::Unchanged => stats.unchanged += 1,
                WriteOutcome::Dropped => stats.dropped += 1,
            }
        }
    }

    Ok(report)
}

fn earliest_bar(conn: &mut SqliteConnection) -> anyhow::Result<Option<DateTime<Utc>>> {
    let ts: Option<String> = bars_5m::table.select(min(bars_5m::ts)).first(conn)?;
    ts.as_deref().map(tz::parse_ts_to_utc).transpose()
}

/// One watermark-bracketed aggregation pass over closed windows up to `now`.
///
/// Starts at the watermark, or at the earliest stored bar on the first run. A window is
/// closed once `now` has passed its end and every pipeline in `upstream` has committed its
/// ingestion watermark past it; a late 5-minute bar therefore lands before its window is
/// rolled up. With no upstream pipelines the wall clock alone decides. On success the
/// watermark advances to the last closed window boundary; any error marks the run failed
/// and leaves the watermark where it was.
#[tracing::instrument(skip(conn, repo, policy))]
pub fn run_aggregation(
    conn: &mut SqliteConnection,
    repo: &dyn WatermarkRepo,
    pipeline: &str,
    upstream: &[String],
    now: DateTime<Utc>,
    policy: RetryPolicy,
) -> anyhow::Result<AggregationReport> {
    repo.begin_at(conn, pipeline, now)?;

    let pass = |conn: &mut SqliteConnection| -> anyhow::Result<AggregationReport> {
        let tf = Timeframe::FIFTEEN_MINUTES;
        let mut end = bucket::floor_utc(now, tf);
        let mut waiting_on = None;
        for name in upstream {
            match repo.read(conn, name)?.last_processed_ts {
                Some(ts) => end = end.min(bucket::floor_utc(ts, tf)),
                None => {
                    waiting_on = Some(name.as_str());
                    break;
                }
            }
        }
        let start = match repo.read(conn, pipeline)?.last_processed_ts {
            Some(ts) => ts,
            None => earliest_bar(conn)?.unwrap_or(end),
        };
        if let Some(name) = waiting_on {
            tracing::info!(upstream = name, "upstream pipeline has not committed yet");
            end = start;
        }
        let end = end.max(bucket::floor_utc(start, tf));
        aggregate_range(conn, None, start, end, policy, Some(pipeline))
    };

    match pass(conn) {
        Ok(report) => {
            let end = report
                .end
                .unwrap_or_else(|| bucket::floor_utc(now, Timeframe::FIFTEEN_MINUTES));
            repo.commit_at(conn, pipeline, end, Utc::now())?;
            tracing::info!(windows_written = report.total_written(), end = %end, "aggregation pass complete");
            Ok(report)
        }
        Err(e) => {
            let detail = format!("{e:#}");
            if let Err(fail_err) = repo.fail_at(conn, pipeline, &detail, Utc::now()) {
                tracing::error!(error = %fail_err, "could not mark aggregation run failed");
            }
            Err(e)
        }
    }
}
