//! Shared test fixtures: a manual clock, a scripted fetcher, a recording
//! delivery sink, and an engine context over a temporary SQLite store.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use listwatch::app::context::EngineContext;
use listwatch::domain::event::ChangeEvent;
use listwatch::domain::listing::{FetchSnapshot, RawListing};
use listwatch::domain::model::{
    AppConfig, AppMode, CacheConfig, DispatcherConfig, PeakHours, SchedulerConfig, Subscriber,
};
use listwatch::domain::target::{
    AdaptivePolicy, PollingTarget, RateLimitPolicy, TargetRuntime,
};
use listwatch::infra::metrics::Metrics;
use listwatch::infra::random::MutexRng;
use listwatch::infra::sqlite_repo::SqliteRepo;
use listwatch::ports::clock::Clock;
use listwatch::ports::deliver::{Deliver, DeliveryError};
use listwatch::ports::fetch::{Fetch, FetchError};
use listwatch::ports::repo::Repo;

pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    async fn now_epoch_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Replays a scripted sequence of fetch results and records the `full`
/// flag of every call.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchSnapshot, FetchError>>>,
    pub calls: Mutex<Vec<bool>>,
}

impl ScriptedFetcher {
    pub async fn push(&self, result: Result<FetchSnapshot, FetchError>) {
        self.script.lock().await.push_back(result);
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Fetch for ScriptedFetcher {
    async fn fetch(&self, _target: &PollingTarget, full: bool) -> Result<FetchSnapshot, FetchError> {
        self.calls.lock().await.push(full);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(FetchError::Other("fetch script exhausted".into())))
    }
}

#[derive(Debug, Clone)]
pub struct Delivered {
    pub subscriber_id: String,
    pub event_id: String,
    pub listing_id: String,
    pub version: i64,
    pub body: String,
}

/// Records deliveries and fails each event id the configured number of
/// times before succeeding.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<Delivered>>,
    failures_left: Mutex<HashMap<String, u32>>,
}

impl RecordingSink {
    pub async fn fail_event(&self, event_id: &str, times: u32) {
        self.failures_left
            .lock()
            .await
            .insert(event_id.to_string(), times);
    }

    pub async fn delivered_versions(&self, listing_id: &str) -> Vec<i64> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|d| d.listing_id == listing_id)
            .map(|d| d.version)
            .collect()
    }
}

#[async_trait::async_trait]
impl Deliver for RecordingSink {
    async fn deliver(
        &self,
        subscriber: &Subscriber,
        event: &ChangeEvent,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let mut failures = self.failures_left.lock().await;
        if let Some(left) = failures.get_mut(&event.event_id) {
            if *left > 0 {
                *left -= 1;
                return Err(DeliveryError::Status(500));
            }
        }
        drop(failures);

        self.delivered.lock().await.push(Delivered {
            subscriber_id: subscriber.id.clone(),
            event_id: event.event_id.clone(),
            listing_id: event.listing_id.clone(),
            version: event.version,
            body: body.to_string(),
        });
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        mode: AppMode::Dev,
        timezone: chrono_tz::UTC,
        store_path: PathBuf::from("unused.db"),
        scheduler: SchedulerConfig {
            poll_interval_ms: 100,
            max_concurrent_polls: 4,
            drain_deadline_secs: 2,
            watchdog_interval_secs: 1,
            poll_task_ceiling_secs: 300,
            reconcile_interval_hours: 24,
            peak_hours: PeakHours {
                start_hour: 0,
                end_hour: 24,
            },
        },
        dispatcher: DispatcherConfig {
            processing_interval_ms: 50,
            batch_size: 20,
            worker_count: 2,
            lease_ms: 60_000,
            max_retries: 3,
            delivery_timeout_ms: 1_000,
            retry_base_ms: 10,
            retry_cap_ms: 100,
        },
        cache: CacheConfig::default(),
        admin_port: 0,
        log_level: "warn".into(),
        webhook_secret: None,
        user_agent: "listwatch-tests".into(),
        request_timeout_secs: 5,
        max_pages: 5,
        min_significance: 0.1,
    }
}

pub struct TestEngine {
    pub ctx: EngineContext<SqliteRepo, ScriptedFetcher, RecordingSink, ManualClock, MutexRng>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub repo: Arc<SqliteRepo>,
    _dir: TempDir,
}

pub async fn test_engine(now_ms: i64) -> TestEngine {
    let dir = TempDir::new().expect("tempdir");
    let repo = Arc::new(
        SqliteRepo::new(&dir.path().join("test.db"))
            .await
            .expect("open sqlite"),
    );
    repo.migrate().await.expect("migrate");

    let fetcher = Arc::new(ScriptedFetcher::default());
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::at(now_ms));

    let ctx = EngineContext {
        cfg: Arc::new(test_config()),
        repo: repo.clone(),
        fetcher: fetcher.clone(),
        sink: sink.clone(),
        clock: clock.clone(),
        rng: Arc::new(MutexRng::new()),
        metrics: Arc::new(Metrics::new()),
        shutdown: CancellationToken::new(),
    };

    TestEngine {
        ctx,
        fetcher,
        sink,
        clock,
        repo,
        _dir: dir,
    }
}

pub fn target(id: &str) -> PollingTarget {
    PollingTarget {
        id: id.to_string(),
        url: format!("https://market.example.com/api/search?q={id}"),
        domain: "market.example.com".into(),
        base_interval_secs: 300,
        min_interval_secs: 60,
        max_interval_secs: 3600,
        adaptive: AdaptivePolicy {
            change_threshold: 3.0,
            stability_bonus: 0.5,
            activity_boost: 2.0,
            learning_window_hours: 24,
        },
        rate_limit: RateLimitPolicy {
            per_minute: 100,
            per_hour: 1000,
            burst: 4,
        },
        tracked_fields: vec![
            "title".into(),
            "price".into(),
            "condition".into(),
            "location".into(),
        ],
        ignored_fields: vec![],
        grace_period_secs: 300,
        enabled: true,
        runtime: TargetRuntime::default(),
    }
}

pub fn raw_listing(id: &str, title: &str, price: i64) -> RawListing {
    RawListing {
        id: id.to_string(),
        title: Some(title.to_string()),
        price: Some(serde_json::Number::from(price)),
        condition: None,
        location: None,
        url: None,
        image_urls: vec![],
        extra: serde_json::Map::new(),
    }
}

pub fn webhook_subscriber(id: &str) -> Subscriber {
    Subscriber {
        id: id.to_string(),
        kind: listwatch::domain::model::SubscriberKind::Webhook,
        endpoint: "https://hooks.example.com/sink".into(),
        timeout_ms: None,
        max_retries: None,
        enabled: true,
    }
}

pub fn change_event(listing_id: &str, version: i64) -> ChangeEvent {
    use listwatch::domain::event::{EventStatus, EventType, SignificanceBucket};
    ChangeEvent {
        event_id: format!("ev-{listing_id}-{version}"),
        event_type: if version == 1 {
            EventType::Created
        } else {
            EventType::Updated
        },
        listing_id: listing_id.to_string(),
        source: "https://market.example.com/api/search?q=test".into(),
        changed_fields: vec![],
        field_hash_before: None,
        field_hash_after: format!("hash-{version}"),
        detected_at_ms: version * 1_000,
        version,
        confidence: 1.0,
        significance: SignificanceBucket::High,
        metadata: serde_json::Value::Null,
        status: EventStatus::Pending,
        retry_count: 0,
        last_retry_at_ms: None,
    }
}

pub fn snapshot_for(target: &PollingTarget, listings: Vec<RawListing>, full: bool) -> FetchSnapshot {
    FetchSnapshot {
        source: target.url.clone(),
        total_listings: listings.len(),
        first_page_ids: listings.iter().map(|l| l.id.clone()).collect(),
        listings,
        pages_scraped: 1,
        scraped_at_ms: 0,
        full,
        etag: None,
        last_modified: None,
    }
}
