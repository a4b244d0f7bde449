use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::domain::model::AppConfig;
use crate::infra::metrics::Metrics;
use crate::ports::{
    clock::Clock, deliver::Deliver, fetch::Fetch, random::RandomSource, repo::Repo,
};

/// Everything the engine loops need, built once at startup and passed
/// explicitly; there is no global state.
pub struct EngineContext<R, F, D, C, G>
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    pub cfg: Arc<AppConfig>,
    pub repo: Arc<R>,
    pub fetcher: Arc<F>,
    pub sink: Arc<D>,
    pub clock: Arc<C>,
    pub rng: Arc<G>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
}

impl<R, F, D, C, G> Clone for EngineContext<R, F, D, C, G>
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            repo: self.repo.clone(),
            fetcher: self.fetcher.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
            rng: self.rng.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
