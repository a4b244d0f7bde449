//! Fetch abstraction: turns a polling target into a listing snapshot.
//! HTTP details, pagination, and payload parsing live behind this seam.
use thiserror::Error;

use crate::domain::listing::FetchSnapshot;
use crate::domain::target::PollingTarget;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout")]
    Timeout,
    #[error("dns failure: {0}")]
    Dns(String),
    #[error("connection failure: {0}")]
    Connect(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Transient failures feed the circuit breaker and back off; the rest
    /// are surfaced as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Dns(_) | FetchError::Connect(_) => true,
            FetchError::Status(code) => (500..600).contains(code),
            FetchError::Parse(_) => true,
            FetchError::Other(_) => true,
        }
    }
}

#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    /// `full = false` fetches only the first page; `full = true` covers the
    /// complete result surface.
    async fn fetch(&self, target: &PollingTarget, full: bool) -> Result<FetchSnapshot, FetchError>;
}
