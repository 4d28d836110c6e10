//! Upsert engine for the authoritative 5-minute store.
//!
//! ## Atomicity
//! Each bar is applied inside one **`BEGIN IMMEDIATE`** transaction: the stored row is
//! read, the [`ConflictResolver`] re-derives the decision against it, the row is written
//! with `INSERT .. ON CONFLICT (symbol, ts) DO UPDATE`, and the conflict (if any) is
//! appended to the operational log. Because the write lock is taken before the read, no
//! other writer can change the row between the decision and the write.
//!
//! ## Contention
//! SQLite waits up to the connection's `busy_timeout` for the lock. When that expires the
//! attempt becomes a concurrency issue and is retried with linear backoff, up to
//! [`RetryPolicy::max_attempts`]. After the last attempt, or on any non-contention error,
//! the bar becomes an upsert failure and is dropped for this run. These diagnostics are
//! appended after the retry loop ends.
//!
//! ## Idempotence
//! Re-applying a bar that is already stored with the same values from the same source
//! resolves to [`Decision::MergeNotApplicable`] and writes nothing.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use diesel::{SqliteConnection, prelude::*, result::Error as DieselError};
use serde::Serialize;

use crate::{
    bar::Bar,
    config::UpsertCfg,
    models::{BarChangeset, BarRow, NewBar},
    oplog::{self, ConcurrencyIssue, OpEvent, UpsertFailure},
    resolve::{ConflictResolver, Decision},
    schema::{bars_5m, pipeline_watermark},
    tz,
};

/// Table name recorded in diagnostics for the authoritative store.
pub const BARS_5M: &str = "bars_5m";
/// Table name recorded in diagnostics for the aggregated store.
pub const BARS_15M: &str = "bars_15m";

/// Bounded retry for contended writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per write, at least 1.
    pub max_attempts: u32,
    /// Base sleep between attempts; attempt `n` sleeps `n * backoff`.
    pub backoff: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        (&UpsertCfg::default()).into()
    }
}

impl From<&UpsertCfg> for RetryPolicy {
    fn from(cfg: &UpsertCfg) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: StdDuration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

/// What happened to one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// New key written.
    Inserted,
    /// Stored row replaced by the incoming bar.
    Overwritten,
    /// Stored row kept; the incoming bar lost an authority conflict.
    Kept,
    /// Same source re-delivered identical values; nothing written.
    Unchanged,
    /// Gave up; recorded in `upsert_failures`.
    Dropped,
}

/// Identifies the row a write targets, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct WriteKey<'a> {
    /// Table name.
    pub table: &'static str,
    /// Symbol.
    pub symbol: &'a str,
    /// Key timestamp.
    pub timestamp: DateTime<Utc>,
}

/// True when the error (or any cause) is SQLite lock contention.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<DieselError>() {
        Some(DieselError::DatabaseError(_, info)) => {
            let m = info.message().to_ascii_lowercase();
            m.contains("database is locked")
                || m.contains("database is busy")
                || m.contains("database table is locked")
        }
        _ => false,
    })
}

/// Pipelines other than `actor` currently holding a `running` watermark.
fn running_pipelines(conn: &mut SqliteConnection, actor: Option<&str>) -> Option<String> {
    let names: Vec<String> = pipeline_watermark::table
        .filter(pipeline_watermark::status.eq("running"))
        .filter(pipeline_watermark::pipeline_name.ne(actor.unwrap_or("")))
        .select(pipeline_watermark::pipeline_name)
        .load(conn)
        .ok()?;
    if names.is_empty() {
        None
    } else {
        Some(names.join(","))
    }
}

/// Run `op` with bounded retry on lock contention.
///
/// Every contended attempt yields a concurrency issue; a terminal failure yields an upsert
/// failure carrying `payload` and returns `None`. The diagnostics are written once the
/// loop ends, since the lock that blocked `op` would block them too.
pub fn with_retry<T>(
    conn: &mut SqliteConnection,
    policy: RetryPolicy,
    key: WriteKey<'_>,
    actor: Option<&str>,
    payload: impl Fn() -> String,
    mut op: impl FnMut(&mut SqliteConnection) -> anyhow::Result<T>,
) -> Option<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut pending = Vec::new();
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        let err = match op(conn) {
            Ok(v) => break Some(v),
            Err(e) => e,
        };

        if is_busy(&err) {
            let blocking_actor = running_pipelines(conn, actor);
            tracing::warn!(
                table = key.table,
                symbol = key.symbol,
                ts = %key.timestamp,
                attempt,
                blocking_actor = blocking_actor.as_deref().unwrap_or("unknown"),
                "write contended"
            );
            pending.push(OpEvent::Concurrency(ConcurrencyIssue {
                table: key.table,
                symbol: key.symbol.to_string(),
                timestamp: key.timestamp,
                blocking_actor,
                detail: format!("{err:#}"),
                attempt,
            }));
            if attempt < max_attempts {
                std::thread::sleep(policy.backoff * attempt);
                continue;
            }
        }

        tracing::error!(
            table = key.table,
            symbol = key.symbol,
            ts = %key.timestamp,
            attempts = attempt,
            error = %format!("{err:#}"),
            "write dropped"
        );
        pending.push(OpEvent::UpsertFailure(UpsertFailure {
            table: key.table,
            symbol: key.symbol.to_string(),
            timestamp: key.timestamp,
            error_detail: format!("{err:#}"),
            attempts: attempt,
            payload: Some(payload()),
        }));
        break None;
    };

    for event in &pending {
        oplog::record(conn, event);
    }
    result
}

/// Applies resolved bars to [`crate::schema::bars_5m`].
#[derive(Debug, Clone)]
pub struct UpsertEngine {
    resolver: ConflictResolver,
    policy: RetryPolicy,
    actor: Option<String>,
}

impl UpsertEngine {
    /// Engine with the given resolver and retry policy.
    pub fn new(resolver: ConflictResolver, policy: RetryPolicy) -> Self {
        Self {
            resolver,
            policy,
            actor: None,
        }
    }

    /// Name of the pipeline writing through this engine; excluded from blocking-actor reports.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Apply one bar with bounded retry. Failures are logged, never returned.
    pub fn apply(&self, conn: &mut SqliteConnection, bar: &Bar) -> UpsertOutcome {
        let key = WriteKey {
            table: BARS_5M,
            symbol: &bar.symbol,
            timestamp: bar.timestamp,
        };
        with_retry(
            conn,
            self.policy,
            key,
            self.actor.as_deref(),
            || bar.to_json(),
            |conn| self.apply_once(conn, bar),
        )
        .unwrap_or(UpsertOutcome::Dropped)
    }

    /// One transactional attempt, without retry.
    pub fn apply_once(
        &self,
        conn: &mut SqliteConnection,
        bar: &Bar,
    ) -> anyhow::Result<UpsertOutcome> {
        let row = NewBar::from(bar);

        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            let existing = bars_5m::table
                .find((row.symbol.as_str(), row.ts.as_str()))
                .select(BarRow::as_select())
                .first(conn)
                .optional()?
                .map(BarRow::into_bar)
                .transpose()?;

            let resolution = self.resolver.resolve(bar, existing.as_ref());
            if let Some(conflict) = resolution.conflict {
                oplog::record(conn, &OpEvent::Conflict(conflict));
            }

            match resolution.decision {
                Decision::MergeNotApplicable => return Ok(UpsertOutcome::Unchanged),
                Decision::KeepExisting => return Ok(UpsertOutcome::Kept),
                Decision::AcceptIncoming => {}
            }

            diesel::insert_into(bars_5m::table)
                .values(&row)
                .on_conflict((bars_5m::symbol, bars_5m::ts))
                .do_update()
                .set(&BarChangeset::from(&row))
                .execute(conn)?;

            Ok(if existing.is_some() {
                UpsertOutcome::Overwritten
            } else {
                UpsertOutcome::Inserted
            })
        })
    }
}

/// Read one stored bar.
pub fn get_bar(
    conn: &mut SqliteConnection,
    symbol: &str,
    ts: DateTime<Utc>,
) -> anyhow::Result<Option<Bar>> {
    bars_5m::table
        .find((symbol, tz::to_rfc3339_millis(ts)))
        .select(BarRow::as_select())
        .first(conn)
        .optional()?
        .map(BarRow::into_bar)
        .transpose()
}

/// Stored bars for `symbol` in `[start, end)`, ordered by timestamp.
pub fn bars_in_range(
    conn: &mut SqliteConnection,
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<Bar>> {
    bars_5m::table
        .filter(bars_5m::symbol.eq(symbol))
        .filter(bars_5m::ts.ge(tz::to_rfc3339_millis(start)))
        .filter(bars_5m::ts.lt(tz::to_rfc3339_millis(end)))
        .order(bars_5m::ts.asc())
        .select(BarRow::as_select())
        .load(conn)?
        .into_iter()
        .map(BarRow::into_bar)
        .collect()
}
