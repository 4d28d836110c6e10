//! Upstream collaborators of the ingestion pipeline.
//!
//! A [`BarFetcher`] hands over raw records for one symbol and window; a
//! [`PayloadArchive`] keeps a copy of each raw record before validation. Both are
//! object-safe so runtimes can pick implementations from configuration.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bar::{RawBar, SourceId};

/// Supplies raw bar records for one source.
pub trait BarFetcher: Send + Sync {
    /// Source id stamped on every bar this fetcher yields.
    fn source(&self) -> &SourceId;

    /// Raw records for `symbol` covering `[start, end)`.
    ///
    /// Records may fall outside the window or be malformed; the pipeline validates and
    /// filters them. An `Err` marks the whole fetch as failed.
    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RawBar>>;

    /// Records the source could not attribute to any symbol, handed over once per run so
    /// validation can log them.
    fn unkeyed(&self) -> anyhow::Result<Vec<RawBar>> {
        Ok(Vec::new())
    }
}

/// Keeps raw records as received.
pub trait PayloadArchive: Send + Sync {
    /// Store one raw record. Failures are reported, never fatal to the run.
    fn archive(&self, source: &SourceId, symbol: &str, raw: &RawBar) -> anyhow::Result<()>;
}

impl<T: PayloadArchive + ?Sized> PayloadArchive for Arc<T> {
    fn archive(&self, source: &SourceId, symbol: &str, raw: &RawBar) -> anyhow::Result<()> {
        (**self).archive(source, symbol, raw)
    }
}

/// In-memory archive, mostly for inspection in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    records: Mutex<Vec<(SourceId, String, RawBar)>>,
}

impl MemoryArchive {
    /// Number of archived records.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// True when nothing was archived.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PayloadArchive for MemoryArchive {
    fn archive(&self, source: &SourceId, symbol: &str, raw: &RawBar) -> anyhow::Result<()> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("archive lock poisoned"))?;
        guard.push((source.clone(), symbol.to_string(), raw.clone()));
        Ok(())
    }
}

/// Fetcher over a JSON document already on disk.
///
/// Two shapes are accepted:
/// - an array of records, matched to a symbol by their `symbol` field (case-insensitive);
///   records without a usable `symbol` are returned by [`BarFetcher::unkeyed`]
/// - an object keyed by symbol, each value an array of records handed over as-is
///
/// Window bounds are not applied here; the pipeline filters validated bars.
#[derive(Debug, Clone)]
pub struct JsonRecordsFetcher {
    source: SourceId,
    by_symbol: HashMap<String, Vec<RawBar>>,
}

fn symbol_key(s: &str) -> String {
    s.trim().to_ascii_uppercase()
}

impl JsonRecordsFetcher {
    /// Parse records from a JSON string.
    pub fn from_json_str(source: SourceId, json: &str) -> anyhow::Result<Self> {
        let doc: Value = serde_json::from_str(json).context("records are not valid JSON")?;
        let mut by_symbol: HashMap<String, Vec<RawBar>> = HashMap::new();

        match doc {
            Value::Array(items) => {
                for (i, item) in items.into_iter().enumerate() {
                    let raw: RawBar = serde_json::from_value(item)
                        .with_context(|| format!("record {i} is not an object"))?;
                    let key = match &raw.symbol {
                        Some(Value::String(s)) => symbol_key(s),
                        Some(Value::Number(n)) => n.to_string(),
                        _ => String::new(),
                    };
                    by_symbol.entry(key).or_default().push(raw);
                }
            }
            Value::Object(map) => {
                for (symbol, items) in map {
                    let records: Vec<RawBar> = serde_json::from_value(items)
                        .with_context(|| format!("records for {symbol} are not an array of objects"))?;
                    by_symbol.entry(symbol_key(&symbol)).or_default().extend(records);
                }
            }
            _ => bail!("expected a JSON array or an object keyed by symbol"),
        }

        Ok(Self { source, by_symbol })
    }

    /// Read and parse a records file.
    pub fn from_path(source: SourceId, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read records file {}", path.display()))?;
        Self::from_json_str(source, &json)
    }

    /// Symbols present in the document, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .by_symbol
            .keys()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        out.sort();
        out
    }
}

impl BarFetcher for JsonRecordsFetcher {
    fn source(&self) -> &SourceId {
        &self.source
    }

    fn fetch(
        &self,
        symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RawBar>> {
        let key = symbol_key(symbol);
        if key.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.by_symbol.get(&key).cloned().unwrap_or_default())
    }

    fn unkeyed(&self) -> anyhow::Result<Vec<RawBar>> {
        Ok(self.by_symbol.get("").cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 1, 6, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 6, 15, 0, 0).unwrap(),
        )
    }

    #[test]
    fn array_records_are_matched_by_symbol() {
        let doc = json!([
            {"symbol": "ibm", "timestamp": "2025-01-06T14:00:00Z", "volume": 1},
            {"symbol": "SPY", "timestamp": "2025-01-06T14:00:00Z", "volume": 2},
            {"symbol": "IBM", "timestamp": "2025-01-06T14:05:00Z", "volume": 3}
        ]);
        let f = JsonRecordsFetcher::from_json_str(SourceId::new("manual").unwrap(), &doc.to_string())
            .unwrap();
        let (s, e) = window();
        assert_eq!(f.fetch("IBM", s, e).unwrap().len(), 2);
        assert_eq!(f.fetch("QQQ", s, e).unwrap().len(), 0);
        assert_eq!(f.symbols(), vec!["IBM".to_string(), "SPY".to_string()]);
    }

    #[test]
    fn records_without_symbol_are_unkeyed() {
        let doc = json!([
            {"symbol": "IBM", "timestamp": "2025-01-06T14:00:00Z"},
            {"timestamp": "2025-01-06T14:05:00Z", "volume": 3},
            {"symbol": "  ", "volume": 4},
            {"symbol": 7203, "volume": 5}
        ]);
        let f = JsonRecordsFetcher::from_json_str(SourceId::new("manual").unwrap(), &doc.to_string())
            .unwrap();
        let (s, e) = window();
        assert_eq!(f.unkeyed().unwrap().len(), 2);
        assert_eq!(f.fetch("", s, e).unwrap().len(), 0);
        assert_eq!(f.fetch("7203", s, e).unwrap().len(), 1);
        assert_eq!(f.symbols(), vec!["7203".to_string(), "IBM".to_string()]);
    }

    #[test]
    fn keyed_records_keep_malformed_rows() {
        let doc = json!({"IBM": [{"timestamp": "2025-01-06T14:00:00Z"}, {}]});
        let f = JsonRecordsFetcher::from_json_str(SourceId::new("manual").unwrap(), &doc.to_string())
            .unwrap();
        let (s, e) = window();
        assert_eq!(f.fetch("ibm", s, e).unwrap().len(), 2);
    }

    #[test]
    fn scalar_document_is_rejected() {
        assert!(JsonRecordsFetcher::from_json_str(SourceId::new("m").unwrap(), "42").is_err());
    }

    #[test]
    fn memory_archive_counts() {
        let a = MemoryArchive::default();
        assert!(a.is_empty());
        a.archive(&SourceId::new("m").unwrap(), "IBM", &RawBar::default())
            .unwrap();
        assert_eq!(a.len(), 1);
    }
}
