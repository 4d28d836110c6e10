//! Per-pipeline watermarks (SQLite).
//!
//! One row per named pipeline records how far the pipeline has got
//! (`last_processed_ts`) and whether a run is in flight (`status`). The row is also the
//! pipeline's single-writer token: [`WatermarkRepo::begin`] flips it to `running` with a
//! conditional UPDATE and refuses while another live run holds it. A `running` row whose
//! run started longer ago than the staleness threshold is treated as failed and reclaimed.

mod repo;

use std::{fmt, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Utc};
use diesel::SqliteConnection;
use serde::Serialize;

pub use repo::SqliteWatermarkRepo;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStatus {
    /// Created, never run.
    Idle,
    /// A run holds the token.
    Running,
    /// Last run failed; `last_processed_ts` was not advanced.
    Failed,
    /// Last run committed.
    Completed,
}

impl WatermarkStatus {
    /// Code stored in `pipeline_watermark.status`.
    pub const fn as_str(self) -> &'static str {
        match self {
            WatermarkStatus::Idle => "idle",
            WatermarkStatus::Running => "running",
            WatermarkStatus::Failed => "failed",
            WatermarkStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for WatermarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "idle" => WatermarkStatus::Idle,
            "running" => WatermarkStatus::Running,
            "failed" => WatermarkStatus::Failed,
            "completed" => WatermarkStatus::Completed,
            other => bail!("unknown watermark status: {other}"),
        })
    }
}

/// Decoded watermark row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Last committed timestamp; `None` before the first commit.
    pub last_processed_ts: Option<DateTime<Utc>>,
    /// Current state.
    pub status: WatermarkStatus,
    /// Detail of the last failure or reclaim.
    pub last_error: Option<String>,
    /// Token holder of the current or last run.
    pub owner: Option<String>,
    /// Start of the current or last run.
    pub started_at: Option<DateTime<Utc>>,
    /// Last state change; `None` when the row does not exist yet.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Default state of a pipeline that has never run.
    pub fn idle(pipeline_name: &str) -> Self {
        Self {
            pipeline_name: pipeline_name.to_string(),
            last_processed_ts: None,
            status: WatermarkStatus::Idle,
            last_error: None,
            owner: None,
            started_at: None,
            updated_at: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while interacting with the watermark repository.
pub enum WatermarkError {
    #[error("pipeline {pipeline} is already running (owner {owner:?}, started {started_at:?})")]
    /// `begin` found a live run holding the token.
    AlreadyRunning {
        /// Pipeline name.
        pipeline: String,
        /// Current token holder.
        owner: Option<String>,
        /// When the live run started.
        started_at: Option<DateTime<Utc>>,
    },
}

/// Result of a successful `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The token was free.
    Started,
    /// A stale `running` token was taken over.
    Reclaimed {
        /// Owner of the abandoned run.
        previous_owner: Option<String>,
        /// Start of the abandoned run.
        previous_started_at: Option<DateTime<Utc>>,
    },
}

/// Result of a `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// `last_processed_ts` moved to the committed value.
    Advanced {
        /// Value before the commit.
        previous: Option<DateTime<Utc>>,
    },
    /// The committed value was older than the stored one and was ignored.
    Ignored {
        /// Value left in place.
        stored: DateTime<Utc>,
    },
}

/// Result type used throughout the watermark repository for fallible operations.
pub type RepoResult<T> = anyhow::Result<T>;

/// Portable surface, SQLite implementation lives in `repo.rs`.
///
/// The `*_at` methods take the clock explicitly; the plain methods use `Utc::now()`.
pub trait WatermarkRepo {
    /// Current watermark, or [`Watermark::idle`] when the pipeline has never run.
    fn read(&self, conn: &mut SqliteConnection, pipeline: &str) -> RepoResult<Watermark>;

    /// Take the run token. Fails with [`WatermarkError::AlreadyRunning`] while a live run holds it.
    fn begin_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<BeginOutcome>;

    /// Advance `last_processed_ts` monotonically and mark the run completed.
    fn commit_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        new_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<CommitOutcome>;

    /// Mark the run failed without advancing `last_processed_ts`.
    fn fail_at(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<()>;

    /// [`WatermarkRepo::begin_at`] with the wall clock.
    fn begin(&self, conn: &mut SqliteConnection, pipeline: &str) -> RepoResult<BeginOutcome> {
        self.begin_at(conn, pipeline, Utc::now())
    }

    /// [`WatermarkRepo::commit_at`] with the wall clock.
    fn commit(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &str,
        new_ts: DateTime<Utc>,
    ) -> RepoResult<CommitOutcome> {
        self.commit_at(conn, pipeline, new_ts, Utc::now())
    }

    /// [`WatermarkRepo::fail_at`] with the wall clock.
    fn fail(&self, conn: &mut SqliteConnection, pipeline: &str, detail: &str) -> RepoResult<()> {
        self.fail_at(conn, pipeline, detail, Utc::now())
    }
}
