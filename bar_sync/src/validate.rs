//! Staging validation: one [`RawBar`] in, one [`Validation`] out.
//!
//! Checks run in a fixed order and the first failure rejects the record:
//! 1. every field empty -> `all_fields_empty`
//! 2. timestamp present and parseable -> else `parse_error`
//! 3. volume present, non-negative and integral -> else `fractional_volume`
//! 4. `symbol` and `asset_type` present -> else `missing_field`
//!
//! Price fields that fail numeric coercion do not reject the record: the field becomes
//! `None` and a [`CastError`] travels with the accepted bar. [`StagingValidator::validate`]
//! has no side effects; [`stage`] writes the resulting diagnostics to the operational log
//! before handing the bar on.

use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use chrono_tz::Tz;
use diesel::SqliteConnection;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde_json::Value;

use crate::{
    bar::{AssetType, Bar, RawBar, SourceId, TimestampConvention},
    oplog::{self, OpEvent},
    timeframe::Timeframe,
    tz,
};

/// Category of a rejected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityErrorType {
    /// No field carried a value.
    AllFieldsEmpty,
    /// Timestamp missing or unparseable.
    ParseError,
    /// Volume missing, negative or fractional.
    FractionalVolume,
    /// `symbol` or `asset_type` missing.
    MissingField,
}

impl QualityErrorType {
    /// Code stored in `quality_errors.error_type`.
    pub const fn as_str(self) -> &'static str {
        match self {
            QualityErrorType::AllFieldsEmpty => "all_fields_empty",
            QualityErrorType::ParseError => "parse_error",
            QualityErrorType::FractionalVolume => "fractional_volume",
            QualityErrorType::MissingField => "missing_field",
        }
    }
}

/// A rejected record.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityError {
    /// Failure category.
    pub error_type: QualityErrorType,
    /// Raw symbol text, if any.
    pub symbol: Option<String>,
    /// Raw timestamp text, if any.
    pub raw_timestamp: Option<String>,
    /// Human-readable reason.
    pub detail: String,
    /// The whole raw record as JSON.
    pub raw_payload: String,
}

/// A price field that could not be coerced to a decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastError {
    /// Symbol of the record.
    pub symbol: String,
    /// Bar timestamp of the record.
    pub timestamp: DateTime<Utc>,
    /// Field name (`open`, `high`, `low`, `close`).
    pub field: &'static str,
    /// Raw value as JSON text.
    pub raw_value: String,
    /// Intended type.
    pub target_type: &'static str,
}

/// Result of validating one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Usable bar, possibly with nulled prices.
    Accepted {
        /// The validated bar.
        bar: Bar,
        /// Price coercion failures.
        cast_errors: Vec<CastError>,
    },
    /// Record dropped.
    Rejected(QualityError),
}

/// Validates raw records from one source.
#[derive(Debug, Clone)]
pub struct StagingValidator {
    source: SourceId,
    market_tz: Tz,
    convention: TimestampConvention,
}

const DECIMAL_TYPE: &str = "decimal";

impl StagingValidator {
    /// Validator for records delivered by `source`.
    pub fn new(source: SourceId, market_tz: Tz, convention: TimestampConvention) -> Self {
        Self {
            source,
            market_tz,
            convention,
        }
    }

    /// Validate one record. Never panics on malformed input.
    pub fn validate(&self, raw: &RawBar, ingest_time: DateTime<Utc>) -> Validation {
        let reject = |error_type: QualityErrorType, detail: String| {
            Validation::Rejected(QualityError {
                error_type,
                symbol: raw.symbol.as_ref().and_then(text),
                raw_timestamp: raw.timestamp.as_ref().and_then(text),
                detail,
                raw_payload: raw.to_json(),
            })
        };

        if all_empty(raw) {
            return reject(
                QualityErrorType::AllFieldsEmpty,
                "record has no populated fields".into(),
            );
        }

        let timestamp = match self.parse_timestamp(raw.timestamp.as_ref()) {
            Ok(ts) => ts,
            Err(detail) => return reject(QualityErrorType::ParseError, detail),
        };

        let volume = match parse_volume(raw.volume.as_ref()) {
            Ok(v) => v,
            Err(detail) => return reject(QualityErrorType::FractionalVolume, detail),
        };

        let Some(symbol) = raw
            .symbol
            .as_ref()
            .and_then(text)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
        else {
            return reject(QualityErrorType::MissingField, "symbol is missing".into());
        };

        let asset_type = match raw.asset_type.as_ref().and_then(text) {
            None => {
                return reject(
                    QualityErrorType::MissingField,
                    "asset_type is missing".into(),
                );
            }
            Some(s) => match AssetType::from_str(&s) {
                Ok(a) => a,
                Err(e) => return reject(QualityErrorType::MissingField, e.to_string()),
            },
        };

        let mut cast_errors = Vec::new();
        let mut price = |field: &'static str, value: Option<&Value>| -> Option<Decimal> {
            match coerce_price(value) {
                Ok(p) => p,
                Err(raw_value) => {
                    cast_errors.push(CastError {
                        symbol: symbol.clone(),
                        timestamp,
                        field,
                        raw_value,
                        target_type: DECIMAL_TYPE,
                    });
                    None
                }
            }
        };
        let open = price("open", raw.open.as_ref());
        let high = price("high", raw.high.as_ref());
        let low = price("low", raw.low.as_ref());
        let close = price("close", raw.close.as_ref());

        Validation::Accepted {
            bar: Bar {
                symbol,
                timestamp,
                open,
                high,
                low,
                close,
                volume,
                asset_type,
                source: self.source.clone(),
                ingest_time,
            },
            cast_errors,
        }
    }

    fn parse_timestamp(&self, value: Option<&Value>) -> Result<DateTime<Utc>, String> {
        let ts = match value {
            None | Some(Value::Null) => return Err("timestamp is missing".into()),
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err("timestamp is missing".into());
            }
            Some(Value::String(s)) => {
                tz::parse_bar_timestamp(s, self.market_tz).map_err(|e| format!("{e:#}"))?
            }
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| format!("timestamp {n} is not whole epoch seconds"))?,
            Some(other) => return Err(format!("timestamp has unsupported type: {other}")),
        };
        // Stored timestamps carry milliseconds only.
        let ts = ts.trunc_subsecs(3);
        Ok(match self.convention {
            TimestampConvention::BarOpen => ts,
            TimestampConvention::BarClose => ts - Timeframe::FIVE_MINUTES.width(),
        })
    }
}

/// Validate one record and append its diagnostics to the operational log.
///
/// Returns the bar when it may continue to conflict resolution.
pub fn stage(
    conn: &mut SqliteConnection,
    validator: &StagingValidator,
    raw: &RawBar,
    ingest_time: DateTime<Utc>,
) -> Option<Bar> {
    match validator.validate(raw, ingest_time) {
        Validation::Rejected(err) => {
            tracing::debug!(
                error_type = err.error_type.as_str(),
                detail = %err.detail,
                "record rejected"
            );
            oplog::record(conn, &OpEvent::Quality(err));
            None
        }
        Validation::Accepted { bar, cast_errors } => {
            for c in cast_errors {
                oplog::record(conn, &OpEvent::Cast(c));
            }
            Some(bar)
        }
    }
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn is_blank(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn all_empty(raw: &RawBar) -> bool {
    [
        &raw.symbol,
        &raw.timestamp,
        &raw.open,
        &raw.high,
        &raw.low,
        &raw.close,
        &raw.volume,
        &raw.asset_type,
    ]
    .iter()
    .all(|v| is_blank(v.as_ref()))
}

fn parse_volume(value: Option<&Value>) -> Result<i64, String> {
    let dec = match value {
        None | Some(Value::Null) => return Err("volume is missing".into()),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Decimal::from(i)
            } else {
                decimal_from_text(&n.to_string())
                    .ok_or_else(|| format!("volume {n} is not a number"))?
            }
        }
        Some(Value::String(s)) if s.trim().is_empty() => return Err("volume is missing".into()),
        Some(Value::String(s)) => {
            decimal_from_text(s).ok_or_else(|| format!("volume {s:?} is not a number"))?
        }
        Some(other) => return Err(format!("volume has unsupported type: {other}")),
    };
    if dec.is_sign_negative() && !dec.is_zero() {
        return Err(format!("volume {dec} is negative"));
    }
    if !dec.fract().is_zero() {
        return Err(format!("volume {dec} is fractional"));
    }
    dec.to_i64()
        .ok_or_else(|| format!("volume {dec} is out of range"))
}

/// `Ok(None)` for absent prices, `Err(raw)` for values that are present but not numeric.
fn coerce_price(value: Option<&Value>) -> Result<Option<Decimal>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => decimal_from_text(s).map(Some).ok_or_else(|| s.clone()),
        Some(Value::Number(n)) => decimal_from_text(&n.to_string())
            .map(Some)
            .ok_or_else(|| n.to_string()),
        Some(other) => Err(other.to_string()),
    }
}

fn decimal_from_text(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn validator() -> StagingValidator {
        StagingValidator::new(
            SourceId::new("intraday_feed").unwrap(),
            "America/New_York".parse().unwrap(),
            TimestampConvention::BarOpen,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap()
    }

    fn raw() -> RawBar {
        RawBar {
            symbol: Some(json!(" aapl ")),
            timestamp: Some(json!("2025-03-03T14:30:00Z")),
            open: Some(json!("101.5")),
            high: Some(json!(102)),
            low: Some(json!(101.0)),
            close: Some(json!("101.75")),
            volume: Some(json!(1200)),
            asset_type: Some(json!("equity")),
            payload: None,
        }
    }

    fn rejected(v: Validation) -> QualityError {
        match v {
            Validation::Rejected(e) => e,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn clean_record_is_accepted() {
        let Validation::Accepted { bar, cast_errors } = validator().validate(&raw(), now()) else {
            panic!("expected acceptance");
        };
        assert!(cast_errors.is_empty());
        assert_eq!(bar.symbol, "AAPL");
        assert_eq!(bar.timestamp, Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap());
        assert_eq!(bar.open, Some(dec!(101.5)));
        assert_eq!(bar.high, Some(dec!(102)));
        assert_eq!(bar.volume, 1200);
        assert_eq!(bar.source.as_str(), "intraday_feed");
        assert_eq!(bar.ingest_time, now());
    }

    #[test]
    fn fractional_volume_is_rejected() {
        let mut r = raw();
        r.volume = Some(json!(10.5));
        let e = rejected(validator().validate(&r, now()));
        assert_eq!(e.error_type, QualityErrorType::FractionalVolume);
        assert!(e.detail.contains("10.5"));
    }

    #[test]
    fn negative_and_missing_volume_are_rejected() {
        let mut r = raw();
        r.volume = Some(json!(-3));
        assert_eq!(
            rejected(validator().validate(&r, now())).error_type,
            QualityErrorType::FractionalVolume
        );
        r.volume = None;
        assert_eq!(
            rejected(validator().validate(&r, now())).error_type,
            QualityErrorType::FractionalVolume
        );
    }

    #[test]
    fn integral_float_and_string_volumes_are_accepted() {
        let mut r = raw();
        r.volume = Some(json!(300.0));
        assert!(matches!(validator().validate(&r, now()), Validation::Accepted { ref bar, .. } if bar.volume == 300));
        r.volume = Some(json!("42"));
        assert!(matches!(validator().validate(&r, now()), Validation::Accepted { ref bar, .. } if bar.volume == 42));
    }

    #[test]
    fn timestamp_is_checked_before_volume() {
        let mut r = raw();
        r.timestamp = Some(json!("not a time"));
        r.volume = Some(json!(10.5));
        let e = rejected(validator().validate(&r, now()));
        assert_eq!(e.error_type, QualityErrorType::ParseError);
        assert_eq!(e.raw_timestamp.as_deref(), Some("not a time"));
    }

    #[test]
    fn missing_identity_fields() {
        let mut r = raw();
        r.symbol = Some(json!("  "));
        assert_eq!(
            rejected(validator().validate(&r, now())).error_type,
            QualityErrorType::MissingField
        );

        let mut r = raw();
        r.asset_type = None;
        assert_eq!(
            rejected(validator().validate(&r, now())).error_type,
            QualityErrorType::MissingField
        );
    }

    #[test]
    fn all_empty_record() {
        let r = RawBar {
            symbol: Some(json!("")),
            payload: Some(json!({"raw": "line"})),
            ..RawBar::default()
        };
        let e = rejected(validator().validate(&r, now()));
        assert_eq!(e.error_type, QualityErrorType::AllFieldsEmpty);
        assert!(e.raw_payload.contains("\"raw\""));
    }

    #[test]
    fn bad_price_is_nulled_with_cast_error() {
        let mut r = raw();
        r.high = Some(json!("n/a"));
        r.low = Some(json!(true));
        let Validation::Accepted { bar, cast_errors } = validator().validate(&r, now()) else {
            panic!("expected acceptance");
        };
        assert_eq!(bar.high, None);
        assert_eq!(bar.low, None);
        assert_eq!(bar.close, Some(dec!(101.75)));
        assert_eq!(cast_errors.len(), 2);
        assert_eq!(cast_errors[0].field, "high");
        assert_eq!(cast_errors[0].raw_value, "n/a");
        assert_eq!(cast_errors[0].target_type, "decimal");
        assert_eq!(cast_errors[1].raw_value, "true");
    }

    #[test]
    fn bar_close_convention_shifts_to_open() {
        let v = StagingValidator::new(
            SourceId::new("historical_backfill").unwrap(),
            "America/New_York".parse().unwrap(),
            TimestampConvention::BarClose,
        );
        let mut r = raw();
        r.timestamp = Some(json!("2025-03-03 09:35:00"));
        let Validation::Accepted { bar, .. } = v.validate(&r, now()) else {
            panic!("expected acceptance");
        };
        // 09:35 EST close -> 09:30 EST open -> 14:30Z
        assert_eq!(bar.timestamp, Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap());
    }

    #[test]
    fn sub_millisecond_timestamp_is_truncated() {
        let mut r = raw();
        r.timestamp = Some(json!("2025-03-03T14:30:00.123456789Z"));
        let Validation::Accepted { bar, .. } = validator().validate(&r, now()) else {
            panic!("expected acceptance");
        };
        assert_eq!(bar.timestamp.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(tz::to_rfc3339_millis(bar.timestamp), "2025-03-03T14:30:00.123Z");
        assert_eq!(tz::parse_ts_to_utc("2025-03-03T14:30:00.123Z").unwrap(), bar.timestamp);
    }

    #[test]
    fn epoch_seconds_timestamp() {
        let mut r = raw();
        r.timestamp = Some(json!(1_741_012_200));
        let Validation::Accepted { bar, .. } = validator().validate(&r, now()) else {
            panic!("expected acceptance");
        };
        assert_eq!(bar.timestamp, Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap());
    }
}
