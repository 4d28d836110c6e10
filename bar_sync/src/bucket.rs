//! UTC bucket mapping utilities.
//!
//! - One stable epoch: Unix (1970-01-01T00:00:00Z).
//! - Fixed-size frames only: second-based math with `div_euclid`, so instants before the
//!   epoch still floor downwards.
//!
//! All functions assume the input timestamp is UTC.

use chrono::{DateTime, Duration, Utc};

use crate::timeframe::Timeframe;

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Compute the bucket id for a UTC timestamp.
pub fn bucket_id(ts_utc: DateTime<Utc>, tf: Timeframe) -> i64 {
    let secs = ts_utc.signed_duration_since(EPOCH_UNIX).num_seconds();
    secs.div_euclid(tf.secs())
}

/// Get the UTC start instant for a bucket id.
pub fn bucket_start_utc(id: i64, tf: Timeframe) -> DateTime<Utc> {
    EPOCH_UNIX + Duration::seconds(id * tf.secs())
}

/// Floor a timestamp to the start of its bucket.
///
/// Sub-second precision is dropped before flooring.
pub fn floor_utc(ts_utc: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    bucket_start_utc(bucket_id(ts_utc, tf), tf)
}

/// Bucket starts covering the half-open range `[start, end)`.
///
/// The first bucket is the one containing `start`; a partially covered last bucket is
/// excluded, so only buckets that end at or before `end` are returned.
pub fn closed_buckets(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tf: Timeframe,
) -> Vec<DateTime<Utc>> {
    if end <= start {
        return vec![];
    }
    let first = bucket_id(start, tf);
    let last_exclusive = bucket_id(end, tf);
    (first..last_exclusive)
        .map(|id| bucket_start_utc(id, tf))
        .collect()
}

// -------------------- tests --------------------
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minute_roundtrip() {
        let tf = Timeframe::FIVE_MINUTES;
        let t = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let id = bucket_id(t, tf);
        assert_eq!(bucket_id(bucket_start_utc(id, tf), tf), id);
        assert_eq!(
            bucket_start_utc(id, tf),
            Utc.with_ymd_and_hms(2025, 1, 2, 3, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start_utc(id + 1, tf),
            Utc.with_ymd_and_hms(2025, 1, 2, 3, 5, 0).unwrap()
        );
    }

    #[test]
    fn fifteen_minute_floor() {
        let tf = Timeframe::FIFTEEN_MINUTES;
        let t = Utc.with_ymd_and_hms(2025, 6, 2, 13, 44, 59).unwrap();
        assert_eq!(
            floor_utc(t, tf),
            Utc.with_ymd_and_hms(2025, 6, 2, 13, 30, 0).unwrap()
        );
        let edge = Utc.with_ymd_and_hms(2025, 6, 2, 13, 45, 0).unwrap();
        assert_eq!(floor_utc(edge, tf), edge);
    }

    #[test]
    fn pre_epoch_floors_downwards() {
        let tf = Timeframe::FIVE_MINUTES;
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 58, 0).unwrap();
        assert_eq!(
            floor_utc(t, tf),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 55, 0).unwrap()
        );
    }

    #[test]
    fn closed_buckets_excludes_partial_tail() {
        let tf = Timeframe::FIFTEEN_MINUTES;
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 13, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 13, 40, 0).unwrap();
        let got = closed_buckets(start, end, tf);
        assert_eq!(
            got,
            vec![start, Utc.with_ymd_and_hms(2025, 6, 2, 13, 15, 0).unwrap()]
        );
        assert!(closed_buckets(end, start, tf).is_empty());
    }
}
