use std::path::PathBuf;
use std::sync::Arc;

use listwatch::app::context::EngineContext;
use listwatch::app::dispatcher::Dispatcher;
use listwatch::app::hub::EventHub;
use listwatch::app::scheduler::Scheduler;
use listwatch::domain::model::AppMode;
use listwatch::infra::admin::{self, AdminState};
use listwatch::infra::config::ConfigLoader;
use listwatch::infra::http_fetcher::HttpFetcher;
use listwatch::infra::logging::{init_logging, BootError};
use listwatch::infra::metrics::Metrics;
use listwatch::infra::random::MutexRng;
use listwatch::infra::sqlite_repo::SqliteRepo;
use listwatch::infra::time::SystemClock;
use listwatch::infra::webhook::SubscriberSink;
use listwatch::ports::repo::Repo;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), BootError> {
    let cfg_path = pick_config_path(std::env::args().nth(1));
    let loaded = ConfigLoader::load(&cfg_path)
        .await
        .map_err(|e| BootError::Fatal(e.to_string()))?;
    init_logging(&loaded.app.log_level);

    let cfg = Arc::new(loaded.app);
    info!(
        targets = loaded.targets.len(),
        subscribers = loaded.subscribers.len(),
        store_path = %cfg.store_path.display(),
        admin_port = cfg.admin_port,
        mode = ?cfg.mode,
        timezone = %cfg.timezone,
        "Loaded config"
    );

    if matches!(cfg.mode, AppMode::Dev) {
        warn!(store_path = %cfg.store_path.display(), "Dev mode enabled, deleting database");
        let _ = tokio::fs::remove_file(&cfg.store_path).await;
    }
    if let Some(host) = &cfg.cache.host {
        warn!(
            host = %host,
            port = ?cfg.cache.port,
            "External cache endpoint configured but not compiled in; using the in-process cache"
        );
    }

    let repo = Arc::new(
        SqliteRepo::new(&cfg.store_path)
            .await
            .map_err(BootError::Fatal)?,
    );
    repo.migrate().await.map_err(BootError::Fatal)?;
    seed(&repo, &loaded.targets, &loaded.subscribers)
        .await
        .map_err(BootError::Fatal)?;

    let hub = EventHub::default();
    let sink = Arc::new(
        SubscriberSink::new(
            cfg.user_agent.clone(),
            cfg.webhook_secret.clone(),
            cfg.dispatcher.delivery_timeout_ms,
            hub.clone(),
        )
        .map_err(|e| BootError::Fatal(e.to_string()))?,
    );
    let fetcher = Arc::new(
        HttpFetcher::new(cfg.user_agent.clone(), cfg.request_timeout_secs, cfg.max_pages)
            .map_err(|e| BootError::Fatal(e.to_string()))?,
    );
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let ctx = EngineContext {
        cfg: cfg.clone(),
        repo: repo.clone(),
        fetcher,
        sink,
        clock: Arc::new(SystemClock),
        rng: Arc::new(MutexRng::new()),
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    };

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let admin_state = AdminState {
        repo,
        commands: commands_tx,
        hub,
        metrics,
        cfg: cfg.clone(),
    };

    let admin_task = tokio::spawn(admin::serve(
        admin_state,
        cfg.admin_port,
        shutdown.clone(),
    ));
    let dispatcher_task = tokio::spawn(Dispatcher::run(ctx.clone()));
    let scheduler_task = tokio::spawn(Scheduler::run(ctx, commands_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BootError::Fatal(e.to_string()))?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for (name, task) in [
        ("scheduler", scheduler_task),
        ("dispatcher", dispatcher_task),
        ("admin", admin_task),
    ] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task ended with error"),
            Err(e) => error!(task = name, error = %e, "Task join failed"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Seeds configured targets and subscribers. Targets already known to the
/// store keep their accumulated runtime state.
async fn seed(
    repo: &SqliteRepo,
    targets: &[listwatch::domain::target::PollingTarget],
    subscribers: &[listwatch::domain::model::Subscriber],
) -> Result<(), String> {
    for target in targets {
        if repo.get_target(&target.id).await?.is_none() {
            info!(target_id = %target.id, url = %target.url, "Seeding target");
            repo.upsert_target(target).await?;
        }
    }
    for subscriber in subscribers {
        info!(subscriber_id = %subscriber.id, kind = subscriber.kind.as_str(), "Seeding subscriber");
        repo.upsert_subscriber(subscriber).await?;
    }
    Ok(())
}

fn pick_config_path(arg1: Option<String>) -> PathBuf {
    if let Some(p) = arg1 {
        return PathBuf::from(p);
    }
    PathBuf::from("res/config.toml")
}
