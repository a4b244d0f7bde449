use sqlx::SqlitePool;

use crate::domain::model::{Subscriber, SubscriberKind};

#[derive(Debug, sqlx::FromRow)]
struct SubscriberRow {
    id: String,
    kind: String,
    endpoint: String,
    timeout_ms: Option<i64>,
    max_retries: Option<i64>,
    enabled: i64,
}

impl SubscriberRow {
    fn into_domain(self) -> Result<Subscriber, String> {
        Ok(Subscriber {
            kind: SubscriberKind::parse(&self.kind)
                .ok_or_else(|| format!("unknown subscriber kind '{}'", self.kind))?,
            id: self.id,
            endpoint: self.endpoint,
            timeout_ms: self.timeout_ms.map(|v| v.max(0) as u64),
            max_retries: self.max_retries.map(|v| v.max(0) as u32),
            enabled: self.enabled != 0,
        })
    }
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Subscriber>, String> {
    let rows = sqlx::query_as::<_, SubscriberRow>(
        "SELECT id, kind, endpoint, timeout_ms, max_retries, enabled FROM subscribers ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| format!("list_subscribers error: {e}"))?;
    rows.into_iter().map(SubscriberRow::into_domain).collect()
}

pub async fn upsert(
    pool: &SqlitePool,
    subscriber: &Subscriber,
    now_ms: i64,
) -> Result<(), String> {
    sqlx::query(
        r#"
        INSERT INTO subscribers(id, kind, endpoint, timeout_ms, max_retries, enabled, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            endpoint = excluded.endpoint,
            timeout_ms = excluded.timeout_ms,
            max_retries = excluded.max_retries,
            enabled = excluded.enabled,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(&subscriber.id)
    .bind(subscriber.kind.as_str())
    .bind(&subscriber.endpoint)
    .bind(subscriber.timeout_ms.map(|v| v as i64))
    .bind(subscriber.max_retries.map(i64::from))
    .bind(subscriber.enabled as i64)
    .bind(now_ms)
    .execute(pool)
    .await
    .map_err(|e| format!("upsert_subscriber error: {e}"))?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, String> {
    let result = sqlx::query("DELETE FROM subscribers WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| format!("delete_subscriber error: {e}"))?;
    Ok(result.rows_affected() > 0)
}
