use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use diesel::{SqliteConnection, prelude::*};

use crate::{
    models::WatermarkRow,
    schema::pipeline_watermark::{self, dsl as pw},
    tz,
    watermark::{
        BeginOutcome, CommitOutcome, RepoResult, Watermark, WatermarkError, WatermarkRepo,
        WatermarkStatus,
    },
};

const RUNNING: &str = "running";

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn parse_opt(v: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
    v.map(tz::parse_ts_to_utc).transpose()
}

fn decode(row: WatermarkRow) -> anyhow::Result<Watermark> {
    Ok(Watermark {
        last_processed_ts: parse_opt(row.last_processed_ts.as_deref())?,
        status: row.status.parse()?,
        owner: row.owner,
        started_at: parse_opt(row.started_at.as_deref())?,
        updated_at: Some(tz::parse_ts_to_utc(&row.updated_at)?),
        last_error: row.last_error,
        pipeline_name: row.pipeline_name,
    })
}

/// Watermark repository backed by [`crate::schema::pipeline_watermark`].
///
/// Each instance carries its own owner token; `commit` and `fail` only release the run
/// token when this instance (or nobody) holds it, so a reclaimed run that finishes late
/// cannot clear a newer run's token.
pub struct SqliteWatermarkRepo {
    staleness: Duration,
    owner: String,
}

impl SqliteWatermarkRepo {
    /// Repository with the given staleness threshold and a process-unique owner token.
    pub fn new(staleness: Duration) -> Self {
        let n = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        Self::with_owner(staleness, format!("pid{}-{n}", std::process::id()))
    }

    /// Repository with an explicit owner token.
    pub fn with_owner(staleness: Duration, owner: impl Into<String>) -> Self {
        Self {
            staleness,
            owner: owner.into(),
        }
    }

    /// Owner token written while this instance holds a run.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn ensure_row(conn: &mut SqliteConnection, pipeline: &str, now: &str) -> QueryResult<usize> {
        diesel::insert_into(pipeline_watermark::table)
            .values((
                pw::pipeline_name.eq(pipeline),
                pw::status.eq(WatermarkStatus::Idle.as_str()),
                pw::updated_at.eq(now),
            ))
            .on_conflict(pw::pipeline_name)
            .do_nothing()
            .execute(conn)
    }

    fn load(conn: &mut SqliteConnection, pipeline: &str) -> anyhow::Result<Watermark> {
        let row = pw::pipeline_watermark
            .find(pipeline)
            .select(WatermarkRow::as_select())
            .first(conn)
            .with_context(|| format!("watermark {pipeline} not found"))?;
        decode(row)
    }

    /// Release the token to `status` if this instance or nobody holds it.
    fn release(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        status: WatermarkStatus,
        last_error: Option<&str>,
        now: &str,
    ) -> QueryResult<usize> {
        diesel::update(
            pw::pipeline_watermark.filter(
                pw::pipeline_name.eq(pipeline).and(
                    pw::owner
                        .eq(&self.owner)
                        .or(pw::owner.is_null())
                        .or(pw::status.ne(RUNNING)),
                ),
            ),
        )
        .set((
            pw::status.eq(status.as_str()),
            pw::last_error.eq(last_error),
            pw::owner.eq(None::<String>),
            pw::updated_at.eq(now),
        ))
        .execute(conn)
    }
}

impl WatermarkRepo for SqliteWatermarkRepo {
    fn read(&self, conn: &mut SqliteConnection, pipeline: &str) -> RepoResult<Watermark> {
        match pw::pipeline_watermark
            .find(pipeline)
            .select(WatermarkRow::as_select())
            .first(conn)
            .optional()?
        {
            Some(row) => decode(row),
            None => Ok(Watermark::idle(pipeline)),
        }
    }

    fn begin_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<BeginOutcome> {
        let now_s = tz::to_rfc3339_millis(now);
        let cutoff = tz::to_rfc3339_millis(now - self.staleness);

        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            Self::ensure_row(conn, pipeline, &now_s)?;
            let current = Self::load(conn, pipeline)?;

            let stale = current.status == WatermarkStatus::Running
                && current.started_at.is_none_or(|s| s < now - self.staleness);
            if current.status == WatermarkStatus::Running && !stale {
                return Err(WatermarkError::AlreadyRunning {
                    pipeline: pipeline.to_string(),
                    owner: current.owner,
                    started_at: current.started_at,
                }
                .into());
            }

            let note = stale.then(|| {
                format!(
                    "reclaimed stale run (owner {}, started {})",
                    current.owner.as_deref().unwrap_or("unknown"),
                    current
                        .started_at
                        .map(tz::to_rfc3339_millis)
                        .unwrap_or_else(|| "unknown".into())
                )
            });

            // Conditional flip: only a free or stale token can be taken.
            let taken = diesel::update(
                pw::pipeline_watermark.filter(
                    pw::pipeline_name.eq(pipeline).and(
                        pw::status
                            .ne(RUNNING)
                            .or(pw::started_at.is_null())
                            .or(pw::started_at.lt(&cutoff)),
                    ),
                ),
            )
            .set((
                pw::status.eq(RUNNING),
                pw::owner.eq(&self.owner),
                pw::started_at.eq(&now_s),
                pw::updated_at.eq(&now_s),
            ))
            .execute(conn)?;

            if taken == 0 {
                return Err(WatermarkError::AlreadyRunning {
                    pipeline: pipeline.to_string(),
                    owner: current.owner,
                    started_at: current.started_at,
                }
                .into());
            }

            if let Some(note) = note {
                diesel::update(pw::pipeline_watermark.find(pipeline))
                    .set(pw::last_error.eq(&note))
                    .execute(conn)?;
                tracing::warn!(pipeline, owner = %self.owner, %note, "stale watermark reclaimed");
                return Ok(BeginOutcome::Reclaimed {
                    previous_owner: current.owner,
                    previous_started_at: current.started_at,
                });
            }

            tracing::info!(pipeline, owner = %self.owner, "pipeline run started");
            Ok(BeginOutcome::Started)
        })
    }

    fn commit_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        new_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<CommitOutcome> {
        let now_s = tz::to_rfc3339_millis(now);
        let new_s = tz::to_rfc3339_millis(new_ts);

        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            Self::ensure_row(conn, pipeline, &now_s)?;
            let previous = Self::load(conn, pipeline)?.last_processed_ts;

            // Monotonic compare-and-set: fixed-width RFC3339 strings sort chronologically.
            let advanced = diesel::update(
                pw::pipeline_watermark.filter(
                    pw::pipeline_name.eq(pipeline).and(
                        pw::last_processed_ts
                            .is_null()
                            .or(pw::last_processed_ts.le(&new_s)),
                    ),
                ),
            )
            .set(pw::last_processed_ts.eq(&new_s))
            .execute(conn)?;

            let released =
                self.release(conn, pipeline, WatermarkStatus::Completed, None, &now_s)?;
            if released == 0 {
                tracing::warn!(
                    pipeline,
                    owner = %self.owner,
                    "commit from a run that no longer holds the token; status left unchanged"
                );
            }

            match (advanced, previous) {
                (0, Some(stored)) => {
                    tracing::info!(
                        pipeline,
                        stored = %stored,
                        attempted = %new_ts,
                        "older watermark commit ignored"
                    );
                    Ok(CommitOutcome::Ignored { stored })
                }
                _ => {
                    tracing::info!(pipeline, last_processed_ts = %new_ts, "watermark committed");
                    Ok(CommitOutcome::Advanced { previous })
                }
            }
        })
    }

    fn fail_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let now_s = tz::to_rfc3339_millis(now);

        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            Self::ensure_row(conn, pipeline, &now_s)?;
            let released =
                self.release(conn, pipeline, WatermarkStatus::Failed, Some(detail), &now_s)?;
            if released == 0 {
                tracing::warn!(
                    pipeline,
                    owner = %self.owner,
                    "failure from a run that no longer holds the token; status left unchanged"
                );
            } else {
                tracing::warn!(pipeline, detail, "pipeline run failed");
            }
            Ok(())
        })
    }
}
