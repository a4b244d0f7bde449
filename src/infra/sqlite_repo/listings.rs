use sqlx::{SqliteConnection, SqlitePool};

use crate::domain::listing::{CanonicalListing, ListingStatus};

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    source: String,
    listing_id: String,
    first_seen_at_ms: i64,
    last_seen_at_ms: i64,
    status: String,
    fields: String,
    image_urls: String,
    field_hash: String,
    version: i64,
    etag: Option<String>,
    last_modified: Option<String>,
    tracked_fields: String,
    change_history: String,
    raw_data: String,
}

impl ListingRow {
    fn into_domain(self) -> Result<CanonicalListing, String> {
        Ok(CanonicalListing {
            status: ListingStatus::parse(&self.status)
                .ok_or_else(|| format!("unknown listing status '{}'", self.status))?,
            fields: serde_json::from_str(&self.fields)
                .map_err(|e| format!("listing fields decode: {e}"))?,
            image_urls: serde_json::from_str(&self.image_urls)
                .map_err(|e| format!("listing image_urls decode: {e}"))?,
            tracked_fields: serde_json::from_str(&self.tracked_fields)
                .map_err(|e| format!("listing tracked_fields decode: {e}"))?,
            change_history: serde_json::from_str(&self.change_history)
                .map_err(|e| format!("listing change_history decode: {e}"))?,
            raw_data: serde_json::from_str(&self.raw_data)
                .map_err(|e| format!("listing raw_data decode: {e}"))?,
            source: self.source,
            listing_id: self.listing_id,
            first_seen_at_ms: self.first_seen_at_ms,
            last_seen_at_ms: self.last_seen_at_ms,
            version: self.version,
            field_hash: self.field_hash,
            etag: self.etag,
            last_modified: self.last_modified,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    source, listing_id, first_seen_at_ms, last_seen_at_ms, status,
    fields, image_urls, field_hash, version, etag, last_modified,
    tracked_fields, change_history, raw_data
"#;

pub async fn get(
    pool: &SqlitePool,
    source: &str,
    listing_id: &str,
) -> Result<Option<CanonicalListing>, String> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM listings WHERE source = ?1 AND listing_id = ?2"
    );
    let row = sqlx::query_as::<_, ListingRow>(&sql)
        .bind(source)
        .bind(listing_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| format!("get_listing error: {e}"))?;
    row.map(ListingRow::into_domain).transpose()
}

pub async fn list(pool: &SqlitePool, source: &str) -> Result<Vec<CanonicalListing>, String> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM listings WHERE source = ?1 ORDER BY listing_id"
    );
    let rows = sqlx::query_as::<_, ListingRow>(&sql)
        .bind(source)
        .fetch_all(pool)
        .await
        .map_err(|e| format!("list_listings error: {e}"))?;
    rows.into_iter().map(ListingRow::into_domain).collect()
}

pub async fn upsert(
    conn: &mut SqliteConnection,
    listing: &CanonicalListing,
    now_ms: i64,
) -> Result<(), String> {
    let fields = serde_json::to_string(&listing.fields)
        .map_err(|e| format!("listing fields encode: {e}"))?;
    let image_urls = serde_json::to_string(&listing.image_urls)
        .map_err(|e| format!("listing image_urls encode: {e}"))?;
    let tracked = serde_json::to_string(&listing.tracked_fields)
        .map_err(|e| format!("listing tracked_fields encode: {e}"))?;
    let history = serde_json::to_string(&listing.change_history)
        .map_err(|e| format!("listing change_history encode: {e}"))?;
    let raw = serde_json::to_string(&listing.raw_data)
        .map_err(|e| format!("listing raw_data encode: {e}"))?;

    sqlx::query(
        r#"
        INSERT INTO listings(
            source, listing_id, first_seen_at_ms, last_seen_at_ms, status,
            fields, image_urls, field_hash, version, etag, last_modified,
            tracked_fields, change_history, raw_data, updated_at_ms
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15
        )
        ON CONFLICT(source, listing_id) DO UPDATE SET
            first_seen_at_ms = excluded.first_seen_at_ms,
            last_seen_at_ms = excluded.last_seen_at_ms,
            status = excluded.status,
            fields = excluded.fields,
            image_urls = excluded.image_urls,
            field_hash = excluded.field_hash,
            version = excluded.version,
            etag = excluded.etag,
            last_modified = excluded.last_modified,
            tracked_fields = excluded.tracked_fields,
            change_history = excluded.change_history,
            raw_data = excluded.raw_data,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(&listing.source)
    .bind(&listing.listing_id)
    .bind(listing.first_seen_at_ms)
    .bind(listing.last_seen_at_ms)
    .bind(listing.status.as_str())
    .bind(&fields)
    .bind(&image_urls)
    .bind(&listing.field_hash)
    .bind(listing.version)
    .bind(&listing.etag)
    .bind(&listing.last_modified)
    .bind(&tracked)
    .bind(&history)
    .bind(&raw)
    .bind(now_ms)
    .execute(conn)
    .await
    .map_err(|e| format!("upsert_listing error: {e}"))?;
    Ok(())
}

pub async fn mark_removed(
    conn: &mut SqliteConnection,
    source: &str,
    listing_id: &str,
    detected_at_ms: i64,
) -> Result<(), String> {
    sqlx::query(
        r#"
        UPDATE listings
        SET status = 'REMOVED',
            last_seen_at_ms = ?3,
            version = version + 1,
            updated_at_ms = ?3
        WHERE source = ?1 AND listing_id = ?2 AND status != 'REMOVED'
        "#,
    )
    .bind(source)
    .bind(listing_id)
    .bind(detected_at_ms)
    .execute(conn)
    .await
    .map_err(|e| format!("mark_listing_removed error: {e}"))?;
    Ok(())
}
