//! SQLite pool construction tuned for this engine's write pattern: many
//! short poll-commit and claim transactions against a single writer, with
//! WAL snapshots keeping scheduler and dispatcher reads off the write lock.
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

/// Poll commits, outbox claims, and admin reads share the pool. SQLite
/// serializes writers regardless, so connections beyond roughly one per
/// loop plus a few readers only sit idle.
const MAX_CONNECTIONS: u32 = 8;

/// Longest a connection waits on the write lock. Poll and claim
/// transactions finish in milliseconds; a wait at this scale means a
/// wedged writer, and failing the cycle beats queueing behind it.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn create_pool(db_path: &Path) -> Result<SqlitePool, String> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("store dir create error ({}): {e}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        // The outbox must survive power loss; keep full fsyncs under WAL.
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| format!("store open error ({}): {e}", db_path.display()))
}
