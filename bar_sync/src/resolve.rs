//! Conflict resolution between an incoming bar and the stored bar for the same key.
//!
//! Resolution is a pure function of `(incoming, existing, ranking)`:
//! - no stored row: accept the incoming bar
//! - same source, same values: nothing to do ([`Decision::MergeNotApplicable`])
//! - same source, different values: last write wins, logged as a dedup conflict
//! - different sources: the [`SourceRanking`] decides, ties keep the stored row, logged
//!   as an authority conflict naming the preferred source
//!
//! The upsert engine calls [`ConflictResolver::resolve`] again inside its write
//! transaction, so the decision that lands is always derived from the row actually stored.

use std::collections::HashSet;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bar::{Bar, SourceId};

/// Ordered source priority, most authoritative first.
///
/// Sources missing from the list rank below every listed source and tie with each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRanking {
    order: Vec<SourceId>,
}

impl SourceRanking {
    /// Build a ranking from an ordered list, rejecting empty lists and duplicates.
    pub fn new(order: Vec<SourceId>) -> anyhow::Result<Self> {
        if order.is_empty() {
            bail!("source ranking cannot be empty");
        }
        let mut seen = HashSet::new();
        for s in &order {
            if !seen.insert(s) {
                bail!("duplicate source in ranking: {s}");
            }
        }
        Ok(Self { order })
    }

    /// Position in the list (0 = highest); `None` for unranked sources.
    pub fn position(&self, source: &SourceId) -> Option<usize> {
        self.order.iter().position(|s| s == source)
    }

    fn weight(&self, source: &SourceId) -> usize {
        self.position(source).unwrap_or(usize::MAX)
    }

    /// True when `a` strictly outranks `b`.
    pub fn outranks(&self, a: &SourceId, b: &SourceId) -> bool {
        self.weight(a) < self.weight(b)
    }
}

/// Outcome of comparing an incoming bar with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Write the incoming bar.
    AcceptIncoming,
    /// Leave the stored bar untouched.
    KeepExisting,
    /// Same source delivered the same values again; no write and no conflict.
    MergeNotApplicable,
}

/// Class of a recorded conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Repeated delivery from one source.
    Dedup,
    /// Disagreement between two sources.
    Authority,
}

/// Resolution tag stored for same-source overwrites.
pub const OVERWRITE_SAME_SOURCE: &str = "overwrite_same_source";
/// Resolution tag for authority conflicts won by the incoming bar.
pub const ACCEPT_INCOMING: &str = "accept_incoming";
/// Resolution tag for authority conflicts won by the stored bar.
pub const KEEP_EXISTING: &str = "keep_existing";
/// Resolution tag for duplicates dropped inside one fetched batch.
pub const DUPLICATE_IN_BATCH: &str = "duplicate_in_batch";

/// One conflict, ready to be appended to the conflict log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Dedup or authority.
    pub kind: ConflictKind,
    /// Contended symbol.
    pub symbol: String,
    /// Contended bar timestamp.
    pub timestamp: DateTime<Utc>,
    /// Stored value before resolution.
    pub existing: Bar,
    /// Incoming value.
    pub incoming: Bar,
    /// Winning source for authority conflicts.
    pub preferred_source: Option<SourceId>,
    /// Resolution tag.
    pub resolution: &'static str,
}

/// Decision plus the conflict to log, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// What the upsert engine should do.
    pub decision: Decision,
    /// Conflict to append to the log, if the pair disagreed.
    pub conflict: Option<ConflictRecord>,
}

/// Applies the dedup and authority policies with an injected [`SourceRanking`].
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    ranking: SourceRanking,
}

impl ConflictResolver {
    /// Create a resolver around a ranking.
    pub fn new(ranking: SourceRanking) -> Self {
        Self { ranking }
    }

    /// Decide what happens to `incoming` given the stored bar for the same key.
    pub fn resolve(&self, incoming: &Bar, existing: Option<&Bar>) -> Resolution {
        let Some(existing) = existing else {
            return Resolution {
                decision: Decision::AcceptIncoming,
                conflict: None,
            };
        };

        if incoming.source == existing.source {
            if incoming.same_observation(existing) {
                return Resolution {
                    decision: Decision::MergeNotApplicable,
                    conflict: None,
                };
            }
            return Resolution {
                decision: Decision::AcceptIncoming,
                conflict: Some(self.record(
                    ConflictKind::Dedup,
                    incoming,
                    existing,
                    None,
                    OVERWRITE_SAME_SOURCE,
                )),
            };
        }

        let (decision, preferred, tag) = if self.ranking.outranks(&incoming.source, &existing.source)
        {
            (Decision::AcceptIncoming, &incoming.source, ACCEPT_INCOMING)
        } else {
            (Decision::KeepExisting, &existing.source, KEEP_EXISTING)
        };

        Resolution {
            decision,
            conflict: Some(self.record(
                ConflictKind::Authority,
                incoming,
                existing,
                Some(preferred.clone()),
                tag,
            )),
        }
    }

    fn record(
        &self,
        kind: ConflictKind,
        incoming: &Bar,
        existing: &Bar,
        preferred_source: Option<SourceId>,
        resolution: &'static str,
    ) -> ConflictRecord {
        ConflictRecord {
            kind,
            symbol: incoming.symbol.clone(),
            timestamp: incoming.timestamp,
            existing: existing.clone(),
            incoming: incoming.clone(),
            preferred_source,
            resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::AssetType;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn src(s: &str) -> SourceId {
        SourceId::new(s).unwrap()
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(SourceRanking::new(vec![src("feed_a"), src("feed_b")]).unwrap())
    }

    fn bar(source: &str, close: i64) -> Bar {
        Bar {
            symbol: "SPY".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 4, 1, 14, 0, 0).unwrap(),
            open: Some(Decimal::from(close)),
            high: Some(Decimal::from(close + 1)),
            low: Some(Decimal::from(close - 1)),
            close: Some(Decimal::from(close)),
            volume: 100,
            asset_type: AssetType::Equity,
            source: src(source),
            ingest_time: Utc.with_ymd_and_hms(2025, 4, 1, 14, 6, 0).unwrap(),
        }
    }

    #[test]
    fn absent_key_accepts_without_conflict() {
        let r = resolver().resolve(&bar("feed_b", 10), None);
        assert_eq!(r.decision, Decision::AcceptIncoming);
        assert!(r.conflict.is_none());
    }

    #[test]
    fn same_source_overwrites_and_logs_dedup() {
        let r = resolver().resolve(&bar("feed_a", 11), Some(&bar("feed_a", 10)));
        assert_eq!(r.decision, Decision::AcceptIncoming);
        let c = r.conflict.unwrap();
        assert_eq!(c.kind, ConflictKind::Dedup);
        assert_eq!(c.resolution, OVERWRITE_SAME_SOURCE);
        assert_eq!(c.existing.close, Some(Decimal::from(10)));
    }

    #[test]
    fn identical_redelivery_is_merge_not_applicable() {
        let mut again = bar("feed_a", 10);
        again.ingest_time = again.ingest_time + chrono::Duration::hours(1);
        let r = resolver().resolve(&again, Some(&bar("feed_a", 10)));
        assert_eq!(r.decision, Decision::MergeNotApplicable);
        assert!(r.conflict.is_none());
    }

    #[test]
    fn authority_precedence_both_directions() {
        let res = resolver();

        let lower_over_higher = res.resolve(&bar("feed_b", 11), Some(&bar("feed_a", 10)));
        assert_eq!(lower_over_higher.decision, Decision::KeepExisting);
        let c = lower_over_higher.conflict.unwrap();
        assert_eq!(c.kind, ConflictKind::Authority);
        assert_eq!(c.preferred_source, Some(src("feed_a")));

        let higher_over_lower = res.resolve(&bar("feed_a", 11), Some(&bar("feed_b", 10)));
        assert_eq!(higher_over_lower.decision, Decision::AcceptIncoming);
        let c = higher_over_lower.conflict.unwrap();
        assert_eq!(c.preferred_source, Some(src("feed_a")));
        assert_eq!(c.resolution, ACCEPT_INCOMING);
    }

    #[test]
    fn unranked_sources_lose_and_tie_keeps_existing() {
        let res = resolver();
        let r = res.resolve(&bar("scraper", 11), Some(&bar("feed_b", 10)));
        assert_eq!(r.decision, Decision::KeepExisting);

        let r = res.resolve(&bar("scraper", 11), Some(&bar("other", 10)));
        assert_eq!(r.decision, Decision::KeepExisting);
        assert_eq!(r.conflict.unwrap().preferred_source, Some(src("other")));
    }

    #[test]
    fn ranking_rejects_duplicates() {
        assert!(SourceRanking::new(vec![src("a"), src("A")]).is_err());
        assert!(SourceRanking::new(vec![]).is_err());
    }

    use proptest::prelude::*;

    fn source_strategy() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("feed_a"), Just("feed_b"), Just("manual_csv")]
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(
            s_in in source_strategy(),
            s_ex in source_strategy(),
            c_in in 1i64..50,
            c_ex in 1i64..50,
        ) {
            let res = resolver();
            let incoming = bar(s_in, c_in);
            let existing = bar(s_ex, c_ex);
            let a = res.resolve(&incoming, Some(&existing));
            let b = res.resolve(&incoming, Some(&existing));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn higher_ranked_bar_always_survives(
            c_in in 1i64..50,
            c_ex in 1i64..50,
        ) {
            let res = resolver();
            // feed_b never replaces feed_a
            let r = res.resolve(&bar("feed_b", c_in), Some(&bar("feed_a", c_ex)));
            prop_assert_eq!(r.decision, Decision::KeepExisting);
            // feed_a always replaces feed_b
            let r = res.resolve(&bar("feed_a", c_in), Some(&bar("feed_b", c_ex)));
            prop_assert_eq!(r.decision, Decision::AcceptIncoming);
        }
    }
}
