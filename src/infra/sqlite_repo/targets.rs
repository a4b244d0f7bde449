use sqlx::{SqliteConnection, SqlitePool};

use crate::domain::target::{PollingTarget, TargetRuntime};

#[derive(Debug, sqlx::FromRow)]
struct TargetRow {
    id: String,
    url: String,
    domain: String,
    base_interval_s: i64,
    min_interval_s: i64,
    max_interval_s: i64,
    adaptive: String,
    rate_limit: String,
    tracked_fields: String,
    ignored_fields: String,
    grace_period_s: i64,
    enabled: i64,
    last_polled_at_ms: Option<i64>,
    last_success_at_ms: Option<i64>,
    next_poll_at_ms: i64,
    consecutive_failures: i64,
    breaker: String,
    change_rate: f64,
    change_history: String,
    first_page_ids: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl TargetRow {
    fn into_domain(self) -> Result<PollingTarget, String> {
        Ok(PollingTarget {
            adaptive: serde_json::from_str(&self.adaptive)
                .map_err(|e| format!("target adaptive decode: {e}"))?,
            rate_limit: serde_json::from_str(&self.rate_limit)
                .map_err(|e| format!("target rate_limit decode: {e}"))?,
            tracked_fields: serde_json::from_str(&self.tracked_fields)
                .map_err(|e| format!("target tracked_fields decode: {e}"))?,
            ignored_fields: serde_json::from_str(&self.ignored_fields)
                .map_err(|e| format!("target ignored_fields decode: {e}"))?,
            runtime: TargetRuntime {
                last_polled_at_ms: self.last_polled_at_ms,
                last_success_at_ms: self.last_success_at_ms,
                next_poll_at_ms: self.next_poll_at_ms,
                consecutive_failures: self.consecutive_failures.max(0) as u32,
                breaker: serde_json::from_str(&self.breaker)
                    .map_err(|e| format!("target breaker decode: {e}"))?,
                change_rate: self.change_rate,
                change_history_ms: serde_json::from_str(&self.change_history)
                    .map_err(|e| format!("target change_history decode: {e}"))?,
                first_page_ids: serde_json::from_str(&self.first_page_ids)
                    .map_err(|e| format!("target first_page_ids decode: {e}"))?,
                etag: self.etag,
                last_modified: self.last_modified,
            },
            id: self.id,
            url: self.url,
            domain: self.domain,
            base_interval_secs: self.base_interval_s.max(0) as u64,
            min_interval_secs: self.min_interval_s.max(0) as u64,
            max_interval_secs: self.max_interval_s.max(0) as u64,
            grace_period_secs: self.grace_period_s.max(0) as u64,
            enabled: self.enabled != 0,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    id, url, domain, base_interval_s, min_interval_s, max_interval_s,
    adaptive, rate_limit, tracked_fields, ignored_fields, grace_period_s,
    enabled, last_polled_at_ms, last_success_at_ms, next_poll_at_ms,
    consecutive_failures, breaker, change_rate, change_history,
    first_page_ids, etag, last_modified
"#;

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<PollingTarget>, String> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM polling_targets WHERE id = ?1");
    let row = sqlx::query_as::<_, TargetRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| format!("get_target error: {e}"))?;
    row.map(TargetRow::into_domain).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<PollingTarget>, String> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM polling_targets ORDER BY id");
    let rows = sqlx::query_as::<_, TargetRow>(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| format!("list_targets error: {e}"))?;
    rows.into_iter().map(TargetRow::into_domain).collect()
}

pub async fn upsert(
    conn: &mut SqliteConnection,
    target: &PollingTarget,
    now_ms: i64,
) -> Result<(), String> {
    let adaptive = serde_json::to_string(&target.adaptive)
        .map_err(|e| format!("target adaptive encode: {e}"))?;
    let rate_limit = serde_json::to_string(&target.rate_limit)
        .map_err(|e| format!("target rate_limit encode: {e}"))?;
    let tracked = serde_json::to_string(&target.tracked_fields)
        .map_err(|e| format!("target tracked_fields encode: {e}"))?;
    let ignored = serde_json::to_string(&target.ignored_fields)
        .map_err(|e| format!("target ignored_fields encode: {e}"))?;
    let breaker = serde_json::to_string(&target.runtime.breaker)
        .map_err(|e| format!("target breaker encode: {e}"))?;
    let history = serde_json::to_string(&target.runtime.change_history_ms)
        .map_err(|e| format!("target change_history encode: {e}"))?;
    let first_page = serde_json::to_string(&target.runtime.first_page_ids)
        .map_err(|e| format!("target first_page_ids encode: {e}"))?;

    sqlx::query(
        r#"
        INSERT INTO polling_targets(
            id, url, domain, base_interval_s, min_interval_s, max_interval_s,
            adaptive, rate_limit, tracked_fields, ignored_fields,
            grace_period_s, enabled, last_polled_at_ms, last_success_at_ms,
            next_poll_at_ms, consecutive_failures, breaker, change_rate,
            change_history, first_page_ids, etag, last_modified, updated_at_ms
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14,
            ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23
        )
        ON CONFLICT(id) DO UPDATE SET
            url = excluded.url,
            domain = excluded.domain,
            base_interval_s = excluded.base_interval_s,
            min_interval_s = excluded.min_interval_s,
            max_interval_s = excluded.max_interval_s,
            adaptive = excluded.adaptive,
            rate_limit = excluded.rate_limit,
            tracked_fields = excluded.tracked_fields,
            ignored_fields = excluded.ignored_fields,
            grace_period_s = excluded.grace_period_s,
            enabled = excluded.enabled,
            last_polled_at_ms = excluded.last_polled_at_ms,
            last_success_at_ms = excluded.last_success_at_ms,
            next_poll_at_ms = excluded.next_poll_at_ms,
            consecutive_failures = excluded.consecutive_failures,
            breaker = excluded.breaker,
            change_rate = excluded.change_rate,
            change_history = excluded.change_history,
            first_page_ids = excluded.first_page_ids,
            etag = excluded.etag,
            last_modified = excluded.last_modified,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(&target.id)
    .bind(&target.url)
    .bind(&target.domain)
    .bind(target.base_interval_secs as i64)
    .bind(target.min_interval_secs as i64)
    .bind(target.max_interval_secs as i64)
    .bind(&adaptive)
    .bind(&rate_limit)
    .bind(&tracked)
    .bind(&ignored)
    .bind(target.grace_period_secs as i64)
    .bind(target.enabled as i64)
    .bind(target.runtime.last_polled_at_ms)
    .bind(target.runtime.last_success_at_ms)
    .bind(target.runtime.next_poll_at_ms)
    .bind(i64::from(target.runtime.consecutive_failures))
    .bind(&breaker)
    .bind(target.runtime.change_rate)
    .bind(&history)
    .bind(&first_page)
    .bind(&target.runtime.etag)
    .bind(&target.runtime.last_modified)
    .bind(now_ms)
    .execute(conn)
    .await
    .map_err(|e| format!("upsert_target error: {e}"))?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, String> {
    let result = sqlx::query("DELETE FROM polling_targets WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| format!("delete_target error: {e}"))?;
    Ok(result.rows_affected() > 0)
}
