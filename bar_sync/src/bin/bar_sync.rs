use anyhow::{Context, Result};
use bar_sync::{
    aggregate,
    bar::SourceId,
    config::{PipelineConfig, load_config_path},
    db::{
        connection::{connect_sqlite, connect_sqlite_with},
        migrate,
    },
    oplog,
    pipeline::IngestPipeline,
    source::JsonRecordsFetcher,
    tz,
    upsert::RetryPolicy,
    watermark::{SqliteWatermarkRepo, WatermarkRepo},
};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shared_utils::env::{get_env_var, get_env_var_opt};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Bar ingestion and aggregation CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply embedded migrations.
    Migrate,
    /// Run one ingestion pass from a JSON records file.
    Ingest {
        #[arg(long, value_name = "FILE")]
        config: String,
        #[arg(long)]
        pipeline: String,
        #[arg(long)]
        source: String,
        #[arg(long, value_name = "FILE")]
        records: String,
        /// Window start override (RFC3339).
        #[arg(long)]
        from: Option<String>,
        /// Treat this instant (RFC3339) as now.
        #[arg(long)]
        until: Option<String>,
    },
    /// Run one aggregation pass, or re-aggregate a range with --from.
    Aggregate {
        #[arg(long, value_name = "FILE")]
        config: String,
        #[arg(long)]
        pipeline: String,
        /// Re-aggregate from this instant (RFC3339) without touching the watermark.
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        until: Option<String>,
    },
    /// Print a pipeline's watermark.
    Watermark {
        #[arg(long)]
        pipeline: String,
    },
    /// Apply the conflict-log retention policy.
    PruneLogs {
        #[arg(long, value_name = "FILE")]
        config: String,
    },
}

/// `DATABASE_URL` wins over the config file.
fn database_url(cfg: Option<&PipelineConfig>) -> Result<String> {
    if let Some(url) = get_env_var_opt("DATABASE_URL") {
        return Ok(url);
    }
    match cfg.and_then(|c| c.database_url.clone()) {
        Some(url) => Ok(url),
        None => Ok(get_env_var("DATABASE_URL")?),
    }
}

fn parse_instant(flag: &str, v: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    v.map(|s| tz::parse_ts_to_utc(s).with_context(|| format!("--{flag}")))
        .transpose()
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Migrate => {
            let url = database_url(None)?;
            migrate::run_all(&url)?;
            tracing::info!("migrations applied");
        }
        Cmd::Ingest {
            config,
            pipeline,
            source,
            records,
            from,
            until,
        } => {
            let mut cfg = load_config_path(&config)?;
            let url = database_url(Some(&cfg))?;
            let from = parse_instant("from", from.as_deref())?;
            let now = parse_instant("until", until.as_deref())?.unwrap_or_else(Utc::now);

            let fetcher = JsonRecordsFetcher::from_path(SourceId::new(&source)?, &records)?;
            if cfg.collection.symbols.is_empty() {
                cfg.collection.symbols = fetcher.symbols();
                tracing::info!(symbols = cfg.collection.symbols.len(), "symbols taken from records file");
            }
            let report = IngestPipeline::new(pipeline, cfg, url, Box::new(fetcher))
                .run_at(now, from)?;
            print_json(&report)?;
        }
        Cmd::Aggregate {
            config,
            pipeline,
            from,
            until,
        } => {
            let cfg = load_config_path(&config)?;
            let url = database_url(Some(&cfg))?;
            let now = parse_instant("until", until.as_deref())?.unwrap_or_else(Utc::now);
            let policy = RetryPolicy::from(&cfg.upsert);
            let mut conn = connect_sqlite_with(&url, cfg.upsert.busy_timeout_ms)?;

            let report = match parse_instant("from", from.as_deref())? {
                Some(start) => {
                    aggregate::aggregate_range(&mut conn, None, start, now, policy, Some(&pipeline))?
                }
                None => {
                    let repo = SqliteWatermarkRepo::new(cfg.staleness_threshold());
                    aggregate::run_aggregation(
                        &mut conn,
                        &repo,
                        &pipeline,
                        &cfg.aggregation.upstream_pipelines,
                        now,
                        policy,
                    )?
                }
            };
            print_json(&report)?;
        }
        Cmd::Watermark { pipeline } => {
            let url = database_url(None)?;
            let mut conn = connect_sqlite(&url)?;
            let repo = SqliteWatermarkRepo::new(Duration::zero());
            print_json(&repo.read(&mut conn, &pipeline)?)?;
        }
        Cmd::PruneLogs { config } => {
            let cfg = load_config_path(&config)?;
            let url = database_url(Some(&cfg))?;
            let mut conn = connect_sqlite_with(&url, cfg.upsert.busy_timeout_ms)?;
            let removed = oplog::prune_conflicts(&mut conn, cfg.conflict_retention(), Utc::now())?;
            println!("removed {removed} conflict log rows");
        }
    }

    Ok(())
}
