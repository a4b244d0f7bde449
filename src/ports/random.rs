//! Random source abstraction, used for retry jitter.
#[async_trait::async_trait]
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, 1)`.
    async fn next_f64(&self) -> f64;
}
