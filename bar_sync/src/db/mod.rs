//! Database utilities for connections and schema migrations.
//!
//! This module provides:
//! - SQLite connection helpers: [`connection::connect_sqlite`] applies WAL, foreign_keys=ON, and a 5000ms busy_timeout;
//!   [`connection::connect_sqlite_with`] takes the busy timeout from configuration.
//! - Embedded Diesel migrations and runners: [`migrate::run_sqlite`] and [`migrate::run_all`],
//!   which accepts bare file paths as well as `sqlite:` URLs.
//!
//! Example:
//! ```no_run
//! use bar_sync::db::{migrate, connection};
//!
//! let db_path = std::env::temp_dir().join("bar_sync_example.db");
//! migrate::run_all(db_path.to_str().unwrap()).expect("migrations");
//!
//! let _conn = connection::connect_sqlite(db_path.to_str().unwrap()).expect("connect");
//! ```

pub mod connection;
pub mod migrate;
