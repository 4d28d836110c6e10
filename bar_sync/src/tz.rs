//! Timestamp parsing and formatting for bars, watermarks and the operational log.
//!
//! - [`parse_ts_to_utc`]: RFC-3339 with an explicit offset, as stored in the database.
//! - [`parse_bar_timestamp`]: upstream bar stamps, either RFC-3339 or a naive wall time in
//!   the market time zone.
//! - [`market_local_to_utc`]: naive market wall time to UTC.
//! - [`parse_hhmm`] and [`is_within_session`]: market-hours gate for collection runs.
//! - [`to_rfc3339_millis`]: the one format written to every TEXT timestamp column.
//!
//! Fixed-width millisecond UTC strings compare lexically in chronological order, which the
//! watermark compare-and-set and range queries rely on.
//!
//! DST edges in naive market time:
//! - a fall-back wall time that occurs twice resolves to the earlier instant
//!   (New York `2024-11-03 01:30` -> `05:30Z`)
//! - a spring-forward wall time that never occurs is an error

use anyhow::{Context, bail};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc, offset::LocalResult};
use chrono_tz::Tz;

/// RFC-3339 with offset -> UTC.
///
/// Example:
/// - "2024-03-10T09:30:00-05:00" -> "2024-03-10T14:30:00Z"
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Naive wall time in `market_tz` -> UTC. Ambiguous times take the earlier instant.
pub fn market_local_to_utc(naive: NaiveDateTime, market_tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    match market_tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => bail!("{naive} falls in a DST gap in {market_tz}"),
    }
}

/// Naive layouts accepted by [`parse_bar_timestamp`], tried in order.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse an upstream bar timestamp into UTC.
///
/// Accepts RFC-3339 with an explicit offset first. Otherwise the text is read as a naive
/// wall time in `market_tz`; ambiguous fall-back times resolve to the earlier instant and
/// spring-forward gaps are rejected.
pub fn parse_bar_timestamp(s: &str, market_tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .with_context(|| format!("unrecognized timestamp: {s:?}"))?;
    market_local_to_utc(naive, market_tz)
}

/// Parse an `HH:MM` wall-clock time (e.g. `"04:00"`).
pub fn parse_hhmm(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("bad HH:MM time: {s}"))
}

/// True when `now` falls in the half-open local session `[open, close)` in `market_tz`.
pub fn is_within_session(now: DateTime<Utc>, market_tz: Tz, open: NaiveTime, close: NaiveTime) -> bool {
    let local = now.with_timezone(&market_tz).time();
    open <= local && local < close
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
