//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sample queue
    r#"
    -- AUTOINCREMENT keeps ids from being reused after pruning.
    -- captured_at and delivered stay in clear for ordering and retention;
    -- everything else lives in payload, sealed when nonce is set.
    CREATE TABLE IF NOT EXISTS samples (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        captured_at      TEXT NOT NULL,
        delivered        INTEGER NOT NULL DEFAULT 0,
        nonce            BLOB,
        payload          BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_samples_pending ON samples(delivered, captured_at, id);
    CREATE INDEX IF NOT EXISTS idx_samples_captured_at ON samples(captured_at);
    "#,
];

/// Bring the sample queue up to [`SCHEMA_VERSION`].
///
/// Each step commits together with its `user_version` bump, so a crash
/// mid-upgrade resumes at the step that failed. A file written by a newer
/// build is refused rather than downgraded.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found = get_schema_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "sample database is at schema {} but this build only knows {}",
            found, SCHEMA_VERSION
        )));
    }

    for (step, sql) in (found + 1..).zip(&MIGRATIONS[found as usize..]) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", step)?;
        tx.commit()?;
        tracing::info!(step, "Applied sample queue migration");
    }

    if found < SCHEMA_VERSION {
        tracing::debug!(from = found, to = SCHEMA_VERSION, "Sample queue schema upgraded");
    }
    Ok(())
}

/// Schema version recorded in the database header (0 for a fresh file)
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
