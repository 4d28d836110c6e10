//! Operational log: append-only diagnostic rows for every anomaly the pipeline meets.
//!
//! [`record`] never fails its caller. When a diagnostic row cannot be written the event
//! is emitted through `tracing::error!` instead and the pipeline carries on.
//!
//! Event kinds and their tables:
//!
//! | [`OpEvent`] variant | table |
//! |---|---|
//! | `Quality` | `quality_errors` |
//! | `Cast` | `cast_errors` |
//! | `Conflict` (dedup) | `dedup_conflicts` |
//! | `Conflict` (authority) | `authority_conflicts` |
//! | `UpsertFailure` | `upsert_failures` |
//! | `Concurrency` | `concurrency_issues` |
//! | `Transform` | `transform_errors` |
//! | `Fetch` | `fetch_log` |

use chrono::{DateTime, Duration, Utc};
use diesel::{SqliteConnection, prelude::*};

use crate::{
    models::*,
    resolve::{ConflictKind, ConflictRecord},
    schema::{
        authority_conflicts, cast_errors, concurrency_issues, dedup_conflicts, fetch_log,
        quality_errors, transform_errors, upsert_failures,
    },
    tz,
    validate::{CastError, QualityError},
};

/// Category of an aggregation anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorType {
    /// Window had bars but none with both volume and a price.
    MissingWindow,
    /// Window volume summed to zero; VWAP left null.
    DivideByZero,
    /// VWAP arithmetic left the decimal range; VWAP left null.
    NumericOverflow,
}

impl TransformErrorType {
    /// Code stored in `transform_errors.error_type`.
    pub const fn as_str(self) -> &'static str {
        match self {
            TransformErrorType::MissingWindow => "missing_window",
            TransformErrorType::DivideByZero => "divide_by_zero",
            TransformErrorType::NumericOverflow => "numeric_overflow",
        }
    }
}

/// One aggregation anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    /// Symbol.
    pub symbol: String,
    /// Window start.
    pub window_start: DateTime<Utc>,
    /// Category.
    pub error_type: TransformErrorType,
    /// Reason.
    pub detail: String,
}

/// A write that was given up on after retries or a terminal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertFailure {
    /// Target table.
    pub table: &'static str,
    /// Symbol.
    pub symbol: String,
    /// Key timestamp.
    pub timestamp: DateTime<Utc>,
    /// Last error.
    pub error_detail: String,
    /// Attempts made.
    pub attempts: u32,
    /// Value JSON for manual replay.
    pub payload: Option<String>,
}

/// A write attempt that hit a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyIssue {
    /// Target table.
    pub table: &'static str,
    /// Symbol.
    pub symbol: String,
    /// Key timestamp.
    pub timestamp: DateTime<Utc>,
    /// Actor believed to hold the lock.
    pub blocking_actor: Option<String>,
    /// Driver message.
    pub detail: String,
    /// Attempt number (1-based).
    pub attempt: u32,
}

/// Per-symbol fetch bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLogEntry {
    /// Pipeline name.
    pub pipeline: String,
    /// Symbol.
    pub symbol: String,
    /// Window start.
    pub window_start: DateTime<Utc>,
    /// Window end (exclusive).
    pub window_end: DateTime<Utc>,
    /// Records returned.
    pub raw_rows: usize,
    /// Records accepted.
    pub accepted_rows: usize,
    /// Fetch failure.
    pub error: Option<String>,
}

/// Every event the operational log accepts.
#[derive(Debug, Clone)]
pub enum OpEvent {
    /// Rejected record.
    Quality(QualityError),
    /// Price coercion failure.
    Cast(CastError),
    /// Dedup or authority conflict.
    Conflict(ConflictRecord),
    /// Abandoned write.
    UpsertFailure(UpsertFailure),
    /// Lock contention.
    Concurrency(ConcurrencyIssue),
    /// Aggregation anomaly.
    Transform(TransformError),
    /// Fetch bookkeeping.
    Fetch(FetchLogEntry),
}

impl OpEvent {
    /// Short name used in fallback diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            OpEvent::Quality(_) => "quality_error",
            OpEvent::Cast(_) => "cast_error",
            OpEvent::Conflict(c) => match c.kind {
                ConflictKind::Dedup => "dedup_conflict",
                ConflictKind::Authority => "authority_conflict",
            },
            OpEvent::UpsertFailure(_) => "upsert_failure",
            OpEvent::Concurrency(_) => "concurrency_issue",
            OpEvent::Transform(_) => "transform_error",
            OpEvent::Fetch(_) => "fetch_log",
        }
    }
}

/// Append `event` stamped with the current time. Never fails.
pub fn record(conn: &mut SqliteConnection, event: &OpEvent) {
    record_at(conn, event, Utc::now())
}

/// Append `event` stamped with `now`. Never fails.
pub fn record_at(conn: &mut SqliteConnection, event: &OpEvent, now: DateTime<Utc>) {
    if let Err(e) = try_record(conn, event, now) {
        tracing::error!(kind = event.kind(), error = %e, event = ?event, "operational log write failed");
    }
}

fn try_record(
    conn: &mut SqliteConnection,
    event: &OpEvent,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let logged_at = tz::to_rfc3339_millis(now);
    let logged_at = logged_at.as_str();

    match event {
        OpEvent::Quality(q) => diesel::insert_into(quality_errors::table)
            .values(NewQualityError {
                symbol: q.symbol.as_deref(),
                raw_ts: q.raw_timestamp.as_deref(),
                error_type: q.error_type.as_str(),
                detail: &q.detail,
                raw_payload: Some(q.raw_payload.as_str()),
                logged_at,
            })
            .execute(conn),
        OpEvent::Cast(c) => {
            let ts = tz::to_rfc3339_millis(c.timestamp);
            diesel::insert_into(cast_errors::table)
                .values(NewCastError {
                    symbol: Some(c.symbol.as_str()),
                    ts: Some(ts.as_str()),
                    field_name: c.field,
                    raw_value: &c.raw_value,
                    target_type: c.target_type,
                    logged_at,
                })
                .execute(conn)
        }
        OpEvent::Conflict(c) => {
            let ts = tz::to_rfc3339_millis(c.timestamp);
            let existing = c.existing.to_json();
            let incoming = c.incoming.to_json();
            match c.kind {
                ConflictKind::Dedup => diesel::insert_into(dedup_conflicts::table)
                    .values(NewDedupConflict {
                        symbol: &c.symbol,
                        ts: &ts,
                        source: c.incoming.source.as_str(),
                        existing_payload: &existing,
                        incoming_payload: &incoming,
                        resolution: c.resolution,
                        logged_at,
                    })
                    .execute(conn),
                ConflictKind::Authority => diesel::insert_into(authority_conflicts::table)
                    .values(NewAuthorityConflict {
                        symbol: &c.symbol,
                        ts: &ts,
                        existing_source: c.existing.source.as_str(),
                        incoming_source: c.incoming.source.as_str(),
                        preferred_source: c
                            .preferred_source
                            .as_ref()
                            .map(|s| s.as_str())
                            .unwrap_or(c.existing.source.as_str()),
                        resolution: c.resolution,
                        existing_payload: &existing,
                        incoming_payload: &incoming,
                        logged_at,
                    })
                    .execute(conn),
            }
        }
        OpEvent::UpsertFailure(f) => {
            let ts = tz::to_rfc3339_millis(f.timestamp);
            diesel::insert_into(upsert_failures::table)
                .values(NewUpsertFailure {
                    table_name: f.table,
                    symbol: &f.symbol,
                    ts: &ts,
                    error_detail: &f.error_detail,
                    attempts: f.attempts as i32,
                    payload: f.payload.as_deref(),
                    logged_at,
                })
                .execute(conn)
        }
        OpEvent::Concurrency(c) => {
            let ts = tz::to_rfc3339_millis(c.timestamp);
            diesel::insert_into(concurrency_issues::table)
                .values(NewConcurrencyIssue {
                    table_name: c.table,
                    symbol: &c.symbol,
                    ts: &ts,
                    blocking_actor: c.blocking_actor.as_deref(),
                    detail: &c.detail,
                    attempt: c.attempt as i32,
                    logged_at,
                })
                .execute(conn)
        }
        OpEvent::Transform(t) => {
            let ws = tz::to_rfc3339_millis(t.window_start);
            diesel::insert_into(transform_errors::table)
                .values(NewTransformError {
                    symbol: &t.symbol,
                    window_start: &ws,
                    error_type: t.error_type.as_str(),
                    detail: &t.detail,
                    logged_at,
                })
                .execute(conn)
        }
        OpEvent::Fetch(f) => {
            let ws = tz::to_rfc3339_millis(f.window_start);
            let we = tz::to_rfc3339_millis(f.window_end);
            diesel::insert_into(fetch_log::table)
                .values(NewFetchLog {
                    pipeline_name: &f.pipeline,
                    symbol: &f.symbol,
                    window_start: &ws,
                    window_end: &we,
                    raw_rows: f.raw_rows as i32,
                    accepted_rows: f.accepted_rows as i32,
                    error: f.error.as_deref(),
                    logged_at,
                })
                .execute(conn)
        }
    }
}

/// Delete dedup and authority conflicts logged before `now - retention`.
///
/// `None` retention keeps the log unbounded and deletes nothing. Returns rows removed.
pub fn prune_conflicts(
    conn: &mut SqliteConnection,
    retention: Option<Duration>,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let Some(retention) = retention else {
        return Ok(0);
    };
    let cutoff = tz::to_rfc3339_millis(now - retention);

    let removed = conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        let d = diesel::delete(dedup_conflicts::table.filter(dedup_conflicts::logged_at.lt(cutoff.as_str())))
            .execute(conn)?;
        let a = diesel::delete(
            authority_conflicts::table.filter(authority_conflicts::logged_at.lt(cutoff.as_str())),
        )
        .execute(conn)?;
        Ok(d + a)
    })?;

    tracing::info!(removed, %cutoff, "pruned conflict log");
    Ok(removed)
}
