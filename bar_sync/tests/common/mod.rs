#![allow(dead_code)]

use bar_sync::{
    bar::{AssetType, Bar, SourceId},
    db::{connection, migrate},
    resolve::{ConflictResolver, SourceRanking},
    upsert::{RetryPolicy, UpsertEngine},
};
use chrono::{DateTime, TimeZone, Utc};
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}
#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_all(&path).expect("migrations");

    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal"); // WAL is persistent per DB file

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

/// Row count of `table`; only call with literal table names.
pub fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table}"))
        .get_result::<Count>(conn)
        .unwrap()
        .n
}

/// Row count of `table` matching a raw SQL predicate.
pub fn count_where(conn: &mut SqliteConnection, table: &str, predicate: &str) -> i64 {
    diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table} WHERE {predicate}"))
        .get_result::<Count>(conn)
        .unwrap()
        .n
}

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap()
}

pub fn src(s: &str) -> SourceId {
    SourceId::new(s).unwrap()
}

pub fn bar(symbol: &str, at: DateTime<Utc>, source: &str, close: Decimal, volume: i64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: at,
        open: Some(close),
        high: Some(close),
        low: Some(close),
        close: Some(close),
        volume,
        asset_type: AssetType::Equity,
        source: src(source),
        ingest_time: ts(20, 0),
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: StdDuration::from_millis(10),
    }
}

/// `intraday_feed` outranks `historical_backfill`.
pub fn engine() -> UpsertEngine {
    let ranking =
        SourceRanking::new(vec![src("intraday_feed"), src("historical_backfill")]).unwrap();
    UpsertEngine::new(ConflictResolver::new(ranking), fast_policy())
}

pub const CONFIG: &str = r#"
source_priority = ["intraday_feed", "historical_backfill"]

[watermark]
staleness_threshold_secs = 1800

[upsert]
max_attempts = 2
retry_backoff_ms = 10

[collection]
symbols = ["ibm", "spy"]
window_minutes = 60
max_parallel_symbols = 2
"#;
