use sqlx::{SqliteConnection, SqlitePool};

use crate::domain::event::{ChangeEvent, EventStatus, EventType, SignificanceBucket};
use crate::ports::repo::EventOutcome;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    event_type: String,
    listing_id: String,
    source: String,
    changed_fields: String,
    field_hash_before: Option<String>,
    field_hash_after: String,
    detected_at_ms: i64,
    version: i64,
    confidence: f64,
    significance: String,
    metadata: String,
    status: String,
    retry_count: i64,
    last_retry_at_ms: Option<i64>,
}

impl EventRow {
    fn into_domain(self) -> Result<ChangeEvent, String> {
        Ok(ChangeEvent {
            event_type: EventType::parse(&self.event_type)
                .ok_or_else(|| format!("unknown event type '{}'", self.event_type))?,
            changed_fields: serde_json::from_str(&self.changed_fields)
                .map_err(|e| format!("event changed_fields decode: {e}"))?,
            significance: SignificanceBucket::parse(&self.significance)
                .ok_or_else(|| format!("unknown significance '{}'", self.significance))?,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| format!("event metadata decode: {e}"))?,
            status: EventStatus::parse(&self.status)
                .ok_or_else(|| format!("unknown event status '{}'", self.status))?,
            event_id: self.event_id,
            listing_id: self.listing_id,
            source: self.source,
            field_hash_before: self.field_hash_before,
            field_hash_after: self.field_hash_after,
            detected_at_ms: self.detected_at_ms,
            version: self.version,
            confidence: self.confidence,
            retry_count: self.retry_count.max(0) as u32,
            last_retry_at_ms: self.last_retry_at_ms,
        })
    }
}

pub async fn insert(
    conn: &mut SqliteConnection,
    event: &ChangeEvent,
    now_ms: i64,
) -> Result<(), String> {
    let changed = serde_json::to_string(&event.changed_fields)
        .map_err(|e| format!("event changed_fields encode: {e}"))?;
    let metadata = serde_json::to_string(&event.metadata)
        .map_err(|e| format!("event metadata encode: {e}"))?;

    sqlx::query(
        r#"
        INSERT INTO events(
            event_id, event_type, listing_id, source, changed_fields,
            field_hash_before, field_hash_after, detected_at_ms, version,
            confidence, significance, metadata, status, retry_count,
            last_retry_at_ms, next_attempt_at_ms, lease_expires_at_ms,
            created_at_ms
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9,
            ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, NULL, ?17
        )
        "#,
    )
    .bind(&event.event_id)
    .bind(event.event_type.as_str())
    .bind(&event.listing_id)
    .bind(&event.source)
    .bind(&changed)
    .bind(&event.field_hash_before)
    .bind(&event.field_hash_after)
    .bind(event.detected_at_ms)
    .bind(event.version)
    .bind(event.confidence)
    .bind(event.significance.as_str())
    .bind(&metadata)
    .bind(event.status.as_str())
    .bind(i64::from(event.retry_count))
    .bind(event.last_retry_at_ms)
    .bind(0_i64)
    .bind(now_ms)
    .execute(conn)
    .await
    .map_err(|e| format!("insert_event error: {e}"))?;
    Ok(())
}

const SELECT_COLUMNS: &str = r#"
    event_id, event_type, listing_id, source, changed_fields,
    field_hash_before, field_hash_after, detected_at_ms, version,
    confidence, significance, metadata, status, retry_count,
    last_retry_at_ms
"#;

/// Atomically reclaims expired leases and flips the next eligible PENDING
/// batch to IN_FLIGHT. An event whose listing has an earlier unfinished
/// event is held back to preserve per-listing ordering.
pub async fn claim_pending(
    pool: &SqlitePool,
    limit: i64,
    lease_ms: i64,
    now_ms: i64,
) -> Result<Vec<ChangeEvent>, String> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| format!("claim tx begin: {e}"))?;

    sqlx::query(
        r#"
        UPDATE events
        SET status = 'PENDING', lease_expires_at_ms = NULL
        WHERE status = 'IN_FLIGHT'
          AND lease_expires_at_ms IS NOT NULL
          AND lease_expires_at_ms <= ?1
        "#,
    )
    .bind(now_ms)
    .execute(&mut *tx)
    .await
    .map_err(|e| format!("claim reclaim error: {e}"))?;

    let sql = format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM events e
        WHERE e.status = 'PENDING'
          AND e.next_attempt_at_ms <= ?1
          AND NOT EXISTS (
              SELECT 1 FROM events p
              WHERE p.source = e.source
                AND p.listing_id = e.listing_id
                AND p.version < e.version
                AND p.status IN ('PENDING', 'IN_FLIGHT')
          )
        ORDER BY e.created_at_ms, e.version
        LIMIT ?2
        "#
    );
    let rows = sqlx::query_as::<_, EventRow>(&sql)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| format!("claim select error: {e}"))?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let mut event = row.into_domain()?;
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'IN_FLIGHT', lease_expires_at_ms = ?2
            WHERE event_id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(&event.event_id)
        .bind(now_ms + lease_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| format!("claim flip error: {e}"))?;
        event.status = EventStatus::InFlight;
        claimed.push(event);
    }

    tx.commit()
        .await
        .map_err(|e| format!("claim tx commit: {e}"))?;
    Ok(claimed)
}

pub async fn complete(
    pool: &SqlitePool,
    event_id: &str,
    outcome: EventOutcome,
    now_ms: i64,
) -> Result<(), String> {
    let result = match outcome {
        EventOutcome::Processed => {
            sqlx::query(
                r#"
                UPDATE events
                SET status = 'PROCESSED', lease_expires_at_ms = NULL
                WHERE event_id = ?1
                "#,
            )
            .bind(event_id)
            .execute(pool)
            .await
        }
        EventOutcome::Retry { next_attempt_at_ms } => {
            sqlx::query(
                r#"
                UPDATE events
                SET status = 'PENDING',
                    retry_count = retry_count + 1,
                    last_retry_at_ms = ?2,
                    next_attempt_at_ms = ?3,
                    lease_expires_at_ms = NULL
                WHERE event_id = ?1
                "#,
            )
            .bind(event_id)
            .bind(now_ms)
            .bind(next_attempt_at_ms)
            .execute(pool)
            .await
        }
        EventOutcome::DeadLetter => {
            sqlx::query(
                r#"
                UPDATE events
                SET status = 'FAILED',
                    retry_count = retry_count + 1,
                    last_retry_at_ms = ?2,
                    lease_expires_at_ms = NULL
                WHERE event_id = ?1
                "#,
            )
            .bind(event_id)
            .bind(now_ms)
            .execute(pool)
            .await
        }
    };
    result.map_err(|e| format!("complete_event error: {e}"))?;
    Ok(())
}

pub async fn depth_by_status(pool: &SqlitePool) -> Result<Vec<(String, i64)>, String> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM events GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await
            .map_err(|e| format!("outbox_depth error: {e}"))?;
    Ok(rows)
}
