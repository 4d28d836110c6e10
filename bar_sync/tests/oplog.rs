use bar_sync::oplog::{self, FetchLogEntry, OpEvent, TransformError, TransformErrorType};
use bar_sync::resolve::{ConflictKind, ConflictRecord, OVERWRITE_SAME_SOURCE};
use chrono::Duration;
use rust_decimal_macros::dec;

mod common;
use common::{bar, count, count_where, setup_db, src, ts};

fn dedup(at: chrono::DateTime<chrono::Utc>) -> OpEvent {
    OpEvent::Conflict(ConflictRecord {
        kind: ConflictKind::Dedup,
        symbol: "IBM".into(),
        timestamp: at,
        existing: bar("IBM", at, "intraday_feed", dec!(1), 1),
        incoming: bar("IBM", at, "intraday_feed", dec!(2), 1),
        preferred_source: None,
        resolution: OVERWRITE_SAME_SOURCE,
    })
}

#[test]
fn every_event_kind_lands_in_its_table() {
    let (_db, mut conn) = setup_db();

    oplog::record(&mut conn, &dedup(ts(14, 0)));
    oplog::record(
        &mut conn,
        &OpEvent::Conflict(ConflictRecord {
            kind: ConflictKind::Authority,
            symbol: "IBM".into(),
            timestamp: ts(14, 0),
            existing: bar("IBM", ts(14, 0), "historical_backfill", dec!(1), 1),
            incoming: bar("IBM", ts(14, 0), "intraday_feed", dec!(2), 1),
            preferred_source: Some(src("intraday_feed")),
            resolution: "accept_incoming",
        }),
    );
    oplog::record(
        &mut conn,
        &OpEvent::Transform(TransformError {
            symbol: "IBM".into(),
            window_start: ts(14, 0),
            error_type: TransformErrorType::MissingWindow,
            detail: "no priced bars".into(),
        }),
    );
    oplog::record(
        &mut conn,
        &OpEvent::Fetch(FetchLogEntry {
            pipeline: "live_5m".into(),
            symbol: "IBM".into(),
            window_start: ts(14, 0),
            window_end: ts(15, 0),
            raw_rows: 12,
            accepted_rows: 11,
            error: None,
        }),
    );

    assert_eq!(count(&mut conn, "dedup_conflicts"), 1);
    assert_eq!(
        count_where(&mut conn, "authority_conflicts", "preferred_source = 'intraday_feed'"),
        1
    );
    assert_eq!(count(&mut conn, "transform_errors"), 1);
    assert_eq!(
        count_where(&mut conn, "fetch_log", "raw_rows = 12 AND accepted_rows = 11"),
        1
    );
}

#[test]
fn prune_honors_retention() {
    let (_db, mut conn) = setup_db();
    let now = ts(12, 0) + Duration::days(10);

    oplog::record_at(&mut conn, &dedup(ts(14, 0)), now - Duration::days(9));
    oplog::record_at(&mut conn, &dedup(ts(14, 5)), now - Duration::days(2));
    oplog::record_at(&mut conn, &dedup(ts(14, 10)), now);

    assert_eq!(oplog::prune_conflicts(&mut conn, None, now).unwrap(), 0);
    assert_eq!(count(&mut conn, "dedup_conflicts"), 3);

    assert_eq!(
        oplog::prune_conflicts(&mut conn, Some(Duration::days(7)), now).unwrap(),
        1
    );
    assert_eq!(count(&mut conn, "dedup_conflicts"), 2);
}
