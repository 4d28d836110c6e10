//! Pipeline configuration: parsing, normalization, and loading.
//!
//! This module defines the TOML file that drives ingestion and aggregation runs:
//! - `source_priority`: ordered list of upstream sources, highest authority first
//! - `[watermark] staleness_threshold_secs`: age after which a `running` watermark is reclaimable
//! - `[upsert]`: bounded busy wait and retry policy for contended writes
//! - `[collection]`: symbols, window size, parallelism and the optional market-hours gate
//! - `[retention]`: optional bounded retention for the conflict log
//! - `[aggregation]`: ingestion pipelines whose watermarks bound the 15-minute pass
//!
//! `source_priority` and `staleness_threshold_secs` have no defaults; a file without them
//! does not parse.
//!
//! Key behaviors:
//! - Normalization trims and lowercases source ids, trims and upper-cases symbols,
//!   and de-duplicates symbols while preserving order.
//! - Duplicate sources are an error: a priority list with a repeated entry is ambiguous.
//!
//! Entrypoints:
//! - Parse + normalize from a TOML string: [`load_config_str`]
//! - Parse + normalize from a file path: [`load_config_path`]
//! - Normalization only: [`normalize_config`]

use std::collections::HashSet;

use anyhow::{Context, bail};
use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    bar::{SourceId, TimestampConvention},
    resolve::SourceRanking,
    tz,
};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// SQLite path or `sqlite:` URL. `DATABASE_URL` in the environment takes precedence.
    #[serde(default)]
    pub database_url: Option<String>,
    /// IANA zone used for naive upstream timestamps and the market-hours gate.
    #[serde(default = "default_market_tz")]
    pub market_tz: String,
    /// Whether upstream timestamps mark bar open or bar close.
    #[serde(default)]
    pub timestamp_convention: TimestampConvention,
    /// Source ids ordered from most to least authoritative.
    pub source_priority: Vec<String>,
    /// Watermark settings.
    pub watermark: WatermarkCfg,
    /// Upsert contention settings.
    #[serde(default)]
    pub upsert: UpsertCfg,
    /// Collection settings.
    #[serde(default)]
    pub collection: CollectionCfg,
    /// Conflict log retention.
    #[serde(default)]
    pub retention: RetentionCfg,
    /// Aggregation settings.
    #[serde(default)]
    pub aggregation: AggregationCfg,
}

/// `[watermark]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WatermarkCfg {
    /// A `running` watermark whose run started longer ago than this is treated as failed.
    pub staleness_threshold_secs: u64,
}

/// `[upsert]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpsertCfg {
    /// SQLite busy timeout applied to pipeline connections.
    pub busy_timeout_ms: u64,
    /// Attempts per bar before it is recorded as an upsert failure.
    pub max_attempts: u32,
    /// Sleep between contended attempts, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
}

impl Default for UpsertCfg {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            max_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// `[collection]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CollectionCfg {
    /// Symbols to ingest.
    pub symbols: Vec<String>,
    /// Maximum span of one ingestion window.
    pub window_minutes: u32,
    /// Worker threads for per-symbol processing.
    pub max_parallel_symbols: usize,
    /// Session open (`HH:MM`, market time zone).
    pub market_open: Option<String>,
    /// Session close (`HH:MM`, market time zone, exclusive).
    pub market_close: Option<String>,
}

impl Default for CollectionCfg {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            window_minutes: 60,
            max_parallel_symbols: 4,
            market_open: None,
            market_close: None,
        }
    }
}

/// `[retention]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionCfg {
    /// Days of dedup/authority conflict history to keep; `None` keeps everything.
    pub conflict_log_days: Option<u32>,
}

/// Upper bound on `watermark.staleness_threshold_secs` (30 days).
pub const MAX_STALENESS_SECS: u64 = 30 * 24 * 60 * 60;

/// `[aggregation]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AggregationCfg {
    /// Ingestion pipelines feeding `bars_5m`. A window is aggregated only once every one
    /// of them has committed past its end; empty falls back to the wall clock.
    pub upstream_pipelines: Vec<String>,
}

fn default_market_tz() -> String {
    "America/New_York".to_string()
}

/// Summary of changes performed during normalization.
#[derive(Debug, Default, Serialize)]
pub struct NormalizationReport {
    /// Source ids that changed when lowercasing/trimming.
    pub sources_renamed: usize,
    /// Symbols that changed when upper-casing/trimming.
    pub symbols_renamed: usize,
    /// Duplicate symbols removed after normalization.
    pub symbols_deduped: usize,
}

/// Normalize and validate a configuration in place.
///
/// What normalization does:
/// - Trim + lowercase `source_priority`; reject empty lists, empty ids and duplicates
/// - Trim + upper-case `collection.symbols`; drop empties and duplicates, preserving order
/// - Check the time zone, session hours, thresholds and retry bounds
///
/// Errors:
/// - Any of the checks above failing; the message names the offending key
pub fn normalize_config(cfg: &mut PipelineConfig) -> anyhow::Result<NormalizationReport> {
    let mut report = NormalizationReport::default();

    if cfg.source_priority.is_empty() {
        bail!("source_priority must list at least one source");
    }
    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(cfg.source_priority.len());
    for raw in std::mem::take(&mut cfg.source_priority) {
        let id = SourceId::new(&raw).context("source_priority")?;
        if id.as_str() != raw {
            report.sources_renamed += 1;
        }
        if !seen.insert(id.clone()) {
            bail!("duplicate source in source_priority: {id}");
        }
        sources.push(id.to_string());
    }
    cfg.source_priority = sources;

    let before = cfg.collection.symbols.len();
    let mut seen = HashSet::new();
    let mut symbols = Vec::with_capacity(before);
    for raw in std::mem::take(&mut cfg.collection.symbols) {
        let sym = raw.trim().to_uppercase();
        if sym != raw {
            report.symbols_renamed += 1;
        }
        if sym.is_empty() {
            continue;
        }
        if seen.insert(sym.clone()) {
            symbols.push(sym);
        }
    }
    report.symbols_deduped = before.saturating_sub(symbols.len());
    cfg.collection.symbols = symbols;

    let mut upstream = Vec::with_capacity(cfg.aggregation.upstream_pipelines.len());
    for raw in std::mem::take(&mut cfg.aggregation.upstream_pipelines) {
        let name = raw.trim().to_string();
        if name.is_empty() {
            bail!("aggregation.upstream_pipelines has an empty name");
        }
        if !upstream.contains(&name) {
            upstream.push(name);
        }
    }
    cfg.aggregation.upstream_pipelines = upstream;

    cfg.market_tz = cfg.market_tz.trim().to_string();
    cfg.market_tz()?;

    if cfg.watermark.staleness_threshold_secs == 0 {
        bail!("watermark.staleness_threshold_secs must be > 0");
    }
    if cfg.watermark.staleness_threshold_secs > MAX_STALENESS_SECS {
        bail!("watermark.staleness_threshold_secs must be <= {MAX_STALENESS_SECS}");
    }
    if cfg.upsert.max_attempts == 0 {
        bail!("upsert.max_attempts must be >= 1");
    }
    if cfg.collection.window_minutes < 5 || cfg.collection.window_minutes % 5 != 0 {
        bail!("collection.window_minutes must be a positive multiple of 5");
    }
    if cfg.collection.max_parallel_symbols == 0 {
        bail!("collection.max_parallel_symbols must be >= 1");
    }
    if let Some((open, close)) = cfg.session()? {
        if open >= close {
            bail!("collection.market_open must be before collection.market_close");
        }
    }

    Ok(report)
}

impl PipelineConfig {
    /// Parsed market time zone.
    pub fn market_tz(&self) -> anyhow::Result<Tz> {
        self.market_tz
            .parse()
            .map_err(|e| anyhow::anyhow!("bad market_tz {:?}: {e}", self.market_tz))
    }

    /// Source ranking injected into the conflict resolver.
    pub fn ranking(&self) -> anyhow::Result<SourceRanking> {
        let ids = self
            .source_priority
            .iter()
            .map(SourceId::new)
            .collect::<anyhow::Result<Vec<_>>>()?;
        SourceRanking::new(ids)
    }

    /// Staleness threshold as a duration, clamped to [`MAX_STALENESS_SECS`].
    pub fn staleness_threshold(&self) -> Duration {
        let secs = self.watermark.staleness_threshold_secs.min(MAX_STALENESS_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// Session hours, when both ends are configured.
    pub fn session(&self) -> anyhow::Result<Option<(NaiveTime, NaiveTime)>> {
        match (&self.collection.market_open, &self.collection.market_close) {
            (None, None) => Ok(None),
            (Some(open), Some(close)) => Ok(Some((
                tz::parse_hhmm(open).context("collection.market_open")?,
                tz::parse_hhmm(close).context("collection.market_close")?,
            ))),
            _ => bail!("collection.market_open and collection.market_close must be set together"),
        }
    }

    /// Conflict log retention as a duration; `None` is unbounded.
    pub fn conflict_retention(&self) -> Option<Duration> {
        self.retention
            .conflict_log_days
            .map(|d| Duration::days(d as i64))
    }
}

/// Parse and normalize a configuration from a TOML string.
///
/// Errors:
/// - TOML parse failures, including missing required keys
/// - Normalization errors (see [`normalize_config`])
pub fn load_config_str(toml_str: &str) -> anyhow::Result<PipelineConfig> {
    let mut cfg: PipelineConfig =
        toml::from_str(toml_str).context("failed to parse pipeline config TOML")?;
    let report = normalize_config(&mut cfg).context("normalize_config failed")?;
    tracing::debug!(?report, "pipeline config normalized");
    Ok(cfg)
}

/// Read a configuration TOML file from disk, parse, and normalize it.
pub fn load_config_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<PipelineConfig> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config file {}", path.as_ref().display()))?;
    load_config_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        source_priority = ["intraday_feed", "historical_backfill"]
        [watermark]
        staleness_threshold_secs = 1800
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_str(MINIMAL).unwrap();
        assert_eq!(cfg.market_tz, "America/New_York");
        assert_eq!(cfg.timestamp_convention, TimestampConvention::BarOpen);
        assert_eq!(cfg.upsert.max_attempts, 3);
        assert_eq!(cfg.upsert.busy_timeout_ms, 5000);
        assert_eq!(cfg.collection.window_minutes, 60);
        assert!(cfg.conflict_retention().is_none());
        assert!(cfg.session().unwrap().is_none());
        assert_eq!(cfg.staleness_threshold(), Duration::minutes(30));
    }

    #[test]
    fn source_priority_is_required() {
        let err = load_config_str("[watermark]\nstaleness_threshold_secs = 60\n").unwrap_err();
        assert!(format!("{err:#}").contains("source_priority"));
    }

    #[test]
    fn staleness_threshold_is_required() {
        let err = load_config_str("source_priority = [\"a\"]\n").unwrap_err();
        assert!(format!("{err:#}").contains("watermark"));
    }

    #[test]
    fn oversized_staleness_threshold_is_rejected() {
        let toml_str = format!(
            "source_priority = [\"a\"]\n[watermark]\nstaleness_threshold_secs = {}\n",
            i64::MAX
        );
        let err = load_config_str(&toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("staleness_threshold_secs"));

        let mut cfg = toml::from_str::<PipelineConfig>(&toml_str).unwrap();
        assert_eq!(cfg.staleness_threshold(), Duration::days(30));
        cfg.watermark.staleness_threshold_secs = MAX_STALENESS_SECS;
        assert!(normalize_config(&mut cfg).is_ok());
    }

    #[test]
    fn duplicate_sources_error() {
        let toml_str = r#"
            source_priority = ["Feed_A", "feed_a "]
            [watermark]
            staleness_threshold_secs = 60
        "#;
        let err = load_config_str(toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate source"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml_str = format!("{MINIMAL}\n[upsert]\nmax_attempt = 2\n");
        assert!(load_config_str(&toml_str).is_err());
    }

    #[test]
    fn session_hours_must_be_paired_and_ordered() {
        let half = format!("{MINIMAL}\n[collection]\nmarket_open = \"04:00\"\n");
        assert!(load_config_str(&half).is_err());

        let inverted =
            format!("{MINIMAL}\n[collection]\nmarket_open = \"21:00\"\nmarket_close = \"04:00\"\n");
        assert!(load_config_str(&inverted).is_err());
    }

    #[test]
    fn ranking_follows_list_order() {
        let cfg = load_config_str(MINIMAL).unwrap();
        let ranking = cfg.ranking().unwrap();
        let feed = SourceId::new("intraday_feed").unwrap();
        let backfill = SourceId::new("historical_backfill").unwrap();
        assert!(ranking.outranks(&feed, &backfill));
    }

    #[test]
    fn snapshot_normalized_config() {
        let toml_str = r#"
            source_priority = [" Intraday_Feed", "historical_backfill", "MANUAL_CSV"]
            timestamp_convention = "bar_close"
            [watermark]
            staleness_threshold_secs = 900
            [collection]
            symbols = [" aapl", "MSFT", "AAPL", "  ", "spy "]
            market_open = "04:00"
            market_close = "21:00"
            [retention]
            conflict_log_days = 30
            [aggregation]
            upstream_pipelines = [" live_5m", "live_5m"]
        "#;

        let mut cfg = toml::from_str::<PipelineConfig>(toml_str).unwrap();
        let report = normalize_config(&mut cfg).unwrap();
        assert_eq!(report.sources_renamed, 2);
        assert_eq!(report.symbols_deduped, 2);

        insta::assert_json_snapshot!(cfg, @r#"
        {
          "database_url": null,
          "market_tz": "America/New_York",
          "timestamp_convention": "bar_close",
          "source_priority": [
            "intraday_feed",
            "historical_backfill",
            "manual_csv"
          ],
          "watermark": {
            "staleness_threshold_secs": 900
          },
          "upsert": {
            "busy_timeout_ms": 5000,
            "max_attempts": 3,
            "retry_backoff_ms": 200
          },
          "collection": {
            "symbols": [
              "AAPL",
              "MSFT",
              "SPY"
            ],
            "window_minutes": 60,
            "max_parallel_symbols": 4,
            "market_open": "04:00",
            "market_close": "21:00"
          },
          "retention": {
            "conflict_log_days": 30
          },
          "aggregation": {
            "upstream_pipelines": [
              "live_5m"
            ]
          }
        }
        "#);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn symbols_uppercased_and_unique(
            names in proptest::collection::vec("[a-zA-Z ]{0,6}", 0..8),
        ) {
            let mut cfg = toml::from_str::<PipelineConfig>(MINIMAL).unwrap();
            cfg.collection.symbols = names;
            normalize_config(&mut cfg).unwrap();

            let syms = &cfg.collection.symbols;
            prop_assert!(syms.iter().all(|s| !s.is_empty() && s.trim() == s));
            prop_assert!(syms.iter().all(|s| s.chars().all(|c| !c.is_lowercase())));
            let unique: HashSet<_> = syms.iter().collect();
            prop_assert_eq!(unique.len(), syms.len());
        }
    }
}
