//! SQLite connection helpers.
//!
//! Provides [`connect_sqlite`] that opens a connection and applies the PRAGMAs every
//! pipeline connection relies on: WAL journaling, foreign_keys=ON, and a 5000ms
//! busy_timeout. [`connect_sqlite_with`] takes the busy timeout explicitly; it is the
//! bounded wait a writer accepts before a lock attempt surfaces as `SQLITE_BUSY`.
//!
//! Example:
//! ```no_run
//! use bar_sync::db::connection::connect_sqlite;
//!
//! let path = std::env::temp_dir().join("bar_sync_example.db");
//! let _conn = connect_sqlite(path.to_str().unwrap()).expect("open sqlite");
//! ```

use diesel::{Connection, RunQueryDsl, SqliteConnection, sql_query};

/// Busy timeout applied by [`connect_sqlite`].
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Open a SQLite connection and apply connection-wide PRAGMAs.
pub fn connect_sqlite(database_url: &str) -> anyhow::Result<SqliteConnection> {
    connect_sqlite_with(database_url, DEFAULT_BUSY_TIMEOUT_MS)
}

/// Same as [`connect_sqlite`] with an explicit busy timeout in milliseconds.
pub fn connect_sqlite_with(
    database_url: &str,
    busy_timeout_ms: u64,
) -> anyhow::Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(sqlite_path(database_url))?;

    sql_query("PRAGMA journal_mode=WAL;").execute(&mut conn)?;
    sql_query("PRAGMA foreign_keys=ON;").execute(&mut conn)?;
    sql_query(format!("PRAGMA busy_timeout={busy_timeout_ms};")).execute(&mut conn)?;
    Ok(conn)
}

/// Strip a `sqlite://` or `sqlite:` prefix so bare paths and URLs open the same file.
pub fn sqlite_path(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_prefixes_are_stripped() {
        assert_eq!(sqlite_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(sqlite_path("sqlite:bars.db"), "bars.db");
        assert_eq!(sqlite_path("/var/lib/bars.db"), "/var/lib/bars.db");
        assert_eq!(sqlite_path(":memory:"), ":memory:");
    }
}
