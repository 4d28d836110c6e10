//! One ingestion run: fetch, validate, resolve and upsert 5-minute bars for every
//! configured symbol, bracketed by the pipeline's watermark.
//!
//! ## Run boundary
//! - Outside the configured session, or when no bar has closed since the watermark, the
//!   run is skipped and the watermark is not touched.
//! - `begin` takes the watermark token; a live `running` token aborts with
//!   [`WatermarkError::AlreadyRunning`](crate::watermark::WatermarkError).
//! - Symbols are processed on a private thread pool, each worker on its own connection.
//!   Records the fetcher could not attribute to a symbol are staged once, so their
//!   rejections reach the quality log too.
//! - Record-level problems (quality, cast, conflicts, dropped upserts) are logged and the
//!   run carries on. A failed fetch or any other error marks the watermark `failed`
//!   without advancing it, so the next run retries the same window.
//! - Otherwise the watermark is committed at the window end.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use diesel::SqliteConnection;
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    bar::{Bar, RawBar},
    bucket,
    config::PipelineConfig,
    db::connection::connect_sqlite_with,
    oplog::{self, FetchLogEntry, OpEvent},
    resolve::{ConflictKind, ConflictRecord, ConflictResolver, DUPLICATE_IN_BATCH},
    source::{BarFetcher, PayloadArchive},
    timeframe::Timeframe,
    tz,
    upsert::{RetryPolicy, UpsertEngine, UpsertOutcome},
    validate::{StagingValidator, stage},
    watermark::{SqliteWatermarkRepo, WatermarkRepo},
};

/// Pipeline-level failures that abort a run after the watermark is marked failed.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// One or more symbols could not be fetched.
    #[error("fetch failed for {}", .symbols.join(", "))]
    FetchFailed {
        /// Symbols whose fetch returned an error.
        symbols: Vec<String>,
    },
}

/// Half-open ingestion window `[start, end)`, or `None` when no bar has closed since the start.
///
/// Starts at the watermark, or at the top of the current hour when there is none. Ends at
/// `now` floored to 5 minutes and no more than `window_minutes` after the start, so a bar
/// that is still open is never fetched.
pub fn collection_window(
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_minutes: u32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let five = Timeframe::FIVE_MINUTES;
    let start = match watermark {
        Some(ts) => bucket::floor_utc(ts, five),
        None => bucket::floor_utc(now, Timeframe::ONE_HOUR),
    };
    let cap = start + Duration::minutes(i64::from(window_minutes.max(5)));
    let end = bucket::floor_utc(now, five).min(cap);
    (end > start).then_some((start, end))
}

/// Counters for one symbol.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolReport {
    /// Records returned by the fetcher.
    pub raw_rows: usize,
    /// Records rejected by validation.
    pub rejected: usize,
    /// Bars superseded by a later record for the same key in the same batch.
    pub duplicates_in_batch: usize,
    /// Valid bars outside the window or for another symbol.
    pub ignored: usize,
    /// Outcome counts of the bars that reached the upsert engine.
    pub outcomes: IndexMap<UpsertOutcome, usize>,
    /// Fetch failure, when the fetch did not complete.
    pub fetch_error: Option<String>,
}

impl SymbolReport {
    /// Bars handed to the upsert engine.
    pub fn accepted(&self) -> usize {
        self.outcomes.values().sum()
    }

    /// Count for one outcome.
    pub fn count(&self, outcome: UpsertOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Window start, unless skipped.
    pub window_start: Option<DateTime<Utc>>,
    /// Window end (exclusive), unless skipped.
    pub window_end: Option<DateTime<Utc>>,
    /// Why nothing ran.
    pub skipped: Option<String>,
    /// Counters per symbol, in configuration order.
    pub symbols: IndexMap<String, SymbolReport>,
    /// Counters for records the fetcher could not attribute to a symbol.
    pub unkeyed: SymbolReport,
}

/// Ingestion pipeline for one source.
pub struct IngestPipeline {
    name: String,
    cfg: PipelineConfig,
    database_url: String,
    fetcher: Box<dyn BarFetcher>,
    archive: Option<Box<dyn PayloadArchive>>,
}

impl IngestPipeline {
    /// Pipeline `name` writing to `database_url`. `cfg` is expected to be normalized.
    pub fn new(
        name: impl Into<String>,
        cfg: PipelineConfig,
        database_url: impl Into<String>,
        fetcher: Box<dyn BarFetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            cfg,
            database_url: database_url.into(),
            fetcher,
            archive: None,
        }
    }

    /// Archive every raw record before validation.
    pub fn with_archive(mut self, archive: Box<dyn PayloadArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Run once at the current time.
    pub fn run(&self) -> anyhow::Result<RunReport> {
        self.run_at(Utc::now(), None)
    }

    /// Run once as of `now`. `from` replaces the watermark as the window start.
    #[tracing::instrument(skip(self), fields(pipeline = %self.name, source = %self.fetcher.source()))]
    pub fn run_at(
        &self,
        now: DateTime<Utc>,
        from: Option<DateTime<Utc>>,
    ) -> anyhow::Result<RunReport> {
        let market_tz = self.cfg.market_tz()?;
        let mut report = RunReport {
            pipeline: self.name.clone(),
            window_start: None,
            window_end: None,
            skipped: None,
            symbols: IndexMap::new(),
            unkeyed: SymbolReport::default(),
        };

        if let Some((open, close)) = self.cfg.session()? {
            if !tz::is_within_session(now, market_tz, open, close) {
                tracing::info!(%now, "outside market session; run skipped");
                report.skipped = Some(format!("outside session {open}-{close} {market_tz}"));
                return Ok(report);
            }
        }

        let mut conn = connect_sqlite_with(&self.database_url, self.cfg.upsert.busy_timeout_ms)?;
        let repo = SqliteWatermarkRepo::new(self.cfg.staleness_threshold());

        let start_at = self.window_start(&mut conn, &repo, from)?;
        if collection_window(start_at, now, self.cfg.collection.window_minutes).is_none() {
            tracing::info!(%now, ?start_at, "no closed bar since the watermark; run skipped");
            report.skipped = Some("no closed bar since the watermark".to_string());
            return Ok(report);
        }

        repo.begin_at(&mut conn, &self.name, now)?;

        match self.ingest(&mut conn, &repo, now, from, &mut report) {
            Ok(end) => {
                repo.commit_at(&mut conn, &self.name, end, Utc::now())?;
                Ok(report)
            }
            Err(e) => {
                let detail = format!("{e:#}");
                if let Err(fail_err) = repo.fail_at(&mut conn, &self.name, &detail, Utc::now()) {
                    tracing::error!(error = %fail_err, "could not mark ingestion run failed");
                }
                Err(e)
            }
        }
    }

    fn window_start(
        &self,
        conn: &mut SqliteConnection,
        repo: &SqliteWatermarkRepo,
        from: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        match from {
            Some(ts) => Ok(Some(ts)),
            None => Ok(repo.read(conn, &self.name)?.last_processed_ts),
        }
    }

    /// The body between `begin` and `commit`; returns the watermark to commit.
    fn ingest(
        &self,
        conn: &mut SqliteConnection,
        repo: &SqliteWatermarkRepo,
        now: DateTime<Utc>,
        from: Option<DateTime<Utc>>,
        report: &mut RunReport,
    ) -> anyhow::Result<DateTime<Utc>> {
        let start_at = self.window_start(conn, repo, from)?;
        let Some((start, end)) =
            collection_window(start_at, now, self.cfg.collection.window_minutes)
        else {
            // Another run advanced the watermark after the pre-check.
            tracing::info!(?start_at, "watermark already past the closed bars");
            return Ok(start_at.unwrap_or_else(|| bucket::floor_utc(now, Timeframe::ONE_HOUR)));
        };
        report.window_start = Some(start);
        report.window_end = Some(end);
        tracing::info!(%start, %end, symbols = self.cfg.collection.symbols.len(), "ingesting window");

        let validator = StagingValidator::new(
            self.fetcher.source().clone(),
            self.cfg.market_tz()?,
            self.cfg.timestamp_convention,
        );
        let engine = UpsertEngine::new(
            ConflictResolver::new(self.cfg.ranking()?),
            RetryPolicy::from(&self.cfg.upsert),
        )
        .with_actor(self.name.clone());

        report.unkeyed = self.stage_unkeyed(conn, &validator, now)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.collection.max_parallel_symbols.max(1))
            .build()
            .context("build symbol worker pool")?;

        let results: Vec<(String, anyhow::Result<SymbolReport>)> = pool.install(|| {
            self.cfg
                .collection
                .symbols
                .par_iter()
                .map(|symbol| {
                    let r = self.ingest_symbol(&validator, &engine, symbol, start, end, now);
                    (symbol.clone(), r)
                })
                .collect()
        });

        let mut fetch_failed = Vec::new();
        let mut first_error = None;
        for (symbol, result) in results {
            match result {
                Ok(sr) => {
                    if sr.fetch_error.is_some() {
                        fetch_failed.push(symbol.clone());
                    }
                    report.symbols.insert(symbol, sr);
                }
                Err(e) => {
                    tracing::error!(symbol = %symbol, error = %format!("{e:#}"), "symbol ingestion aborted");
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("ingest {symbol}")));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if !fetch_failed.is_empty() {
            return Err(PipelineError::FetchFailed {
                symbols: fetch_failed,
            }
            .into());
        }
        Ok(end)
    }

    fn ingest_symbol(
        &self,
        validator: &StagingValidator,
        engine: &UpsertEngine,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        ingest_time: DateTime<Utc>,
    ) -> anyhow::Result<SymbolReport> {
        let mut conn = connect_sqlite_with(&self.database_url, self.cfg.upsert.busy_timeout_ms)?;
        let mut sr = SymbolReport::default();

        let raws = match self.fetcher.fetch(symbol, start, end) {
            Ok(raws) => raws,
            Err(e) => {
                let detail = format!("{e:#}");
                tracing::error!(symbol, error = %detail, "fetch failed");
                sr.fetch_error = Some(detail);
                self.log_fetch(&mut conn, symbol, start, end, &sr);
                return Ok(sr);
            }
        };
        sr.raw_rows = raws.len();

        // Keyed by timestamp; a later record for the same key replaces the earlier one.
        let mut batch: Vec<Bar> = Vec::with_capacity(raws.len());
        let mut slot: HashMap<DateTime<Utc>, usize> = HashMap::new();
        for raw in &raws {
            self.archive_raw(symbol, raw);

            let Some(bar) = stage(&mut conn, validator, raw, ingest_time) else {
                sr.rejected += 1;
                continue;
            };
            if bar.symbol != symbol || bar.timestamp < start || bar.timestamp >= end {
                sr.ignored += 1;
                continue;
            }

            match slot.get(&bar.timestamp) {
                Some(&i) => {
                    sr.duplicates_in_batch += 1;
                    let dropped = std::mem::replace(&mut batch[i], bar);
                    if !dropped.same_observation(&batch[i]) {
                        oplog::record(
                            &mut conn,
                            &OpEvent::Conflict(ConflictRecord {
                                kind: ConflictKind::Dedup,
                                symbol: dropped.symbol.clone(),
                                timestamp: dropped.timestamp,
                                incoming: batch[i].clone(),
                                existing: dropped,
                                preferred_source: None,
                                resolution: DUPLICATE_IN_BATCH,
                            }),
                        );
                    }
                }
                None => {
                    slot.insert(bar.timestamp, batch.len());
                    batch.push(bar);
                }
            }
        }

        for bar in &batch {
            let outcome = engine.apply(&mut conn, bar);
            *sr.outcomes.entry(outcome).or_default() += 1;
        }

        tracing::info!(
            symbol,
            raw = sr.raw_rows,
            accepted = sr.accepted(),
            rejected = sr.rejected,
            "symbol ingested"
        );
        self.log_fetch(&mut conn, symbol, start, end, &sr);
        Ok(sr)
    }

    fn archive_raw(&self, symbol: &str, raw: &RawBar) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(self.fetcher.source(), symbol, raw) {
                tracing::warn!(symbol, error = %e, "raw payload not archived");
            }
        }
    }

    /// Validate records that carry no usable symbol; accepted ones have nowhere to go.
    fn stage_unkeyed(
        &self,
        conn: &mut SqliteConnection,
        validator: &StagingValidator,
        ingest_time: DateTime<Utc>,
    ) -> anyhow::Result<SymbolReport> {
        let raws = self
            .fetcher
            .unkeyed()
            .context("fetch records without a symbol")?;
        let mut sr = SymbolReport {
            raw_rows: raws.len(),
            ..SymbolReport::default()
        };
        for raw in &raws {
            self.archive_raw("", raw);
            match stage(conn, validator, raw, ingest_time) {
                None => sr.rejected += 1,
                Some(bar) => {
                    tracing::warn!(symbol = %bar.symbol, ts = %bar.timestamp, "unattributed record ignored");
                    sr.ignored += 1;
                }
            }
        }
        if sr.raw_rows > 0 {
            tracing::info!(raw = sr.raw_rows, rejected = sr.rejected, "records without a symbol staged");
        }
        Ok(sr)
    }

    fn log_fetch(
        &self,
        conn: &mut SqliteConnection,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sr: &SymbolReport,
    ) {
        oplog::record(
            conn,
            &OpEvent::Fetch(FetchLogEntry {
                pipeline: self.name.clone(),
                symbol: symbol.to_string(),
                window_start: start,
                window_end: end,
                raw_rows: sr.raw_rows,
                accepted_rows: sr.accepted(),
                error: sr.fetch_error.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap()
    }

    #[test]
    fn first_run_starts_at_top_of_hour() {
        assert_eq!(collection_window(None, at(14, 37), 60), Some((at(14, 0), at(14, 35))));
    }

    #[test]
    fn window_is_capped() {
        assert_eq!(
            collection_window(Some(at(10, 0)), at(14, 37), 60),
            Some((at(10, 0), at(11, 0)))
        );
    }

    #[test]
    fn open_bar_is_never_in_the_window() {
        assert_eq!(collection_window(Some(at(14, 35)), at(14, 37), 60), None);
        assert_eq!(collection_window(None, at(15, 2), 60), None);
        assert_eq!(
            collection_window(Some(at(14, 35)), at(14, 40), 60),
            Some((at(14, 35), at(14, 40)))
        );
    }

    #[test]
    fn unaligned_watermark_is_floored() {
        assert_eq!(
            collection_window(Some(at(14, 12)), at(14, 40), 60),
            Some((at(14, 10), at(14, 40)))
        );
    }
}
