//! Timeframe utilities for expressing uniform bar intervals.
//!
//! A [`Timeframe`] pairs a non-zero amount with a [`TimeframeUnit`]. The pipeline works
//! with two of them: [`Timeframe::FIVE_MINUTES`] for the authoritative store and
//! [`Timeframe::FIFTEEN_MINUTES`] for the VWAP rollup.
//!
//! Typical usage:
//! ```
//! use std::num::NonZeroU32;
//! use bar_sync::timeframe::{Timeframe, TimeframeUnit};
//!
//! let tf = Timeframe::new(NonZeroU32::new(5).unwrap(), TimeframeUnit::Minute);
//! assert_eq!(tf, Timeframe::FIVE_MINUTES);
//! assert_eq!(tf.width().num_seconds(), 300);
//! assert_eq!(tf.to_string(), "5m");
//! ```

use std::{fmt, num::NonZeroU32};

use chrono::Duration;

/// Fixed-width timeframe granularity (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeframeUnit {
    /// UTC minute
    Minute,
    /// UTC hour
    Hour,
    /// UTC day
    Day,
}

impl TimeframeUnit {
    const fn secs(self) -> i64 {
        match self {
            TimeframeUnit::Minute => 60,
            TimeframeUnit::Hour => 3_600,
            TimeframeUnit::Day => 86_400,
        }
    }
}

/// A timeframe = amount × unit (e.g., 5-Minute, 15-Minute, 1-Hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    amount: NonZeroU32,
    unit: TimeframeUnit,
}

const fn nz(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(v) => v,
        None => panic!("timeframe amount must be non-zero"),
    }
}

impl Timeframe {
    /// Granularity of the authoritative bar store.
    pub const FIVE_MINUTES: Timeframe = Timeframe::new(nz(5), TimeframeUnit::Minute);
    /// Granularity of the aggregated VWAP store.
    pub const FIFTEEN_MINUTES: Timeframe = Timeframe::new(nz(15), TimeframeUnit::Minute);
    /// One hour; used to anchor collection windows.
    pub const ONE_HOUR: Timeframe = Timeframe::new(nz(1), TimeframeUnit::Hour);

    /// Create a new Timeframe
    pub const fn new(amount: NonZeroU32, unit: TimeframeUnit) -> Self {
        Self { amount, unit }
    }



    /// Width of one bucket in seconds.
    pub const fn secs(&self) -> i64 {
        self.unit.secs() * self.amount.get() as i64
    }

    /// Width of one bucket.
    pub fn width(&self) -> Duration {
        Duration::seconds(self.secs())
    }
}

/// Compact form for logs (`"5m"`, `"15m"`, `"1h"`, `"1D"`).
impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.amount.get();
        let u = match self.unit {
            TimeframeUnit::Minute => "m",
            TimeframeUnit::Hour => "h",
            TimeframeUnit::Day => "D",
        };
        write!(f, "{a}{u}")
    }
}
