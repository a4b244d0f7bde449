//! Wall-clock access and epoch-millisecond formatting helpers.
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::ports::clock::Clock;

/// The production `Clock`: epoch milliseconds from the system wall clock.
/// A clock reading before the epoch collapses to zero rather than going
/// negative.
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    async fn now_epoch_ms(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(_) => 0,
        }
    }
}

pub fn format_epoch_ms(ms: i64, zone: &Tz) -> String {
    let dt_utc: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap());
    let dt_local = dt_utc.with_timezone(zone);
    dt_local.format("%Y-%m-%d %H:%M:%S%.3f %Z").to_string()
}
