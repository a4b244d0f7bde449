use sqlx::SqlitePool;
use tracing::info;

pub async fn migrate(pool: &SqlitePool) -> Result<(), String> {
    info!("DB migrate start");

    let ddls = [
        r#"
        CREATE TABLE IF NOT EXISTS listings(
            source TEXT NOT NULL,
            listing_id TEXT NOT NULL,
            first_seen_at_ms INTEGER NOT NULL,
            last_seen_at_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            fields TEXT NOT NULL,
            image_urls TEXT NOT NULL,
            field_hash TEXT NOT NULL,
            version INTEGER NOT NULL,
            etag TEXT NULL,
            last_modified TEXT NULL,
            tracked_fields TEXT NOT NULL,
            change_history TEXT NOT NULL,
            raw_data TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (source, listing_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_listings_source ON listings(source)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status)"#,
        r#"
        CREATE TABLE IF NOT EXISTS polling_targets(
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            domain TEXT NOT NULL,
            base_interval_s INTEGER NOT NULL,
            min_interval_s INTEGER NOT NULL,
            max_interval_s INTEGER NOT NULL,
            adaptive TEXT NOT NULL,
            rate_limit TEXT NOT NULL,
            tracked_fields TEXT NOT NULL,
            ignored_fields TEXT NOT NULL,
            grace_period_s INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            last_polled_at_ms INTEGER NULL,
            last_success_at_ms INTEGER NULL,
            next_poll_at_ms INTEGER NOT NULL,
            consecutive_failures INTEGER NOT NULL,
            breaker TEXT NOT NULL,
            change_rate REAL NOT NULL,
            change_history TEXT NOT NULL,
            first_page_ids TEXT NOT NULL,
            etag TEXT NULL,
            last_modified TEXT NULL,
            updated_at_ms INTEGER NOT NULL
        )"#,
        r#"
        CREATE TABLE IF NOT EXISTS events(
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            listing_id TEXT NOT NULL,
            source TEXT NOT NULL,
            changed_fields TEXT NOT NULL,
            field_hash_before TEXT NULL,
            field_hash_after TEXT NOT NULL,
            detected_at_ms INTEGER NOT NULL,
            version INTEGER NOT NULL,
            confidence REAL NOT NULL,
            significance TEXT NOT NULL,
            metadata TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_retry_at_ms INTEGER NULL,
            next_attempt_at_ms INTEGER NOT NULL,
            lease_expires_at_ms INTEGER NULL,
            created_at_ms INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_events_status_created ON events(status, created_at_ms)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_events_listing ON events(listing_id)"#,
        r#"
        CREATE TABLE IF NOT EXISTS subscribers(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            timeout_ms INTEGER NULL,
            max_retries INTEGER NULL,
            enabled INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )"#,
    ];

    for ddl in ddls {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| format!("migrate error (ddl): {e}"))?;
    }

    info!("DB migrate done");
    Ok(())
}
