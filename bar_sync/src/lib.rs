//! OHLCV bar ingestion, reconciliation and 15-minute VWAP aggregation on SQLite.
//!
//! Raw records from an upstream fetcher are validated ([`validate`]), reconciled against
//! the stored bar by source authority ([`resolve`]), written atomically ([`upsert`]) and
//! rolled up into 15-minute bars ([`aggregate`]). Each named pipeline is bracketed by its
//! watermark ([`watermark`]); every anomaly lands in the operational log ([`oplog`]).

#![deny(missing_docs)]

pub mod aggregate;
pub mod bar;
pub mod bucket;
pub mod config;
pub mod db;
pub mod models;
pub mod oplog;
pub mod pipeline;
pub mod resolve;
#[allow(missing_docs)]
pub mod schema;
pub mod source;
pub mod timeframe;
pub mod tz;
pub mod upsert;
pub mod validate;
pub mod watermark;
