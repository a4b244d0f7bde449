//! Delivery abstraction: pushes a rendered change event to one subscriber.
use thiserror::Error;

use crate::domain::event::ChangeEvent;
use crate::domain::model::Subscriber;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("timeout")]
    Timeout,
    #[error("http status {0}")]
    Status(u16),
    #[error("connection failure: {0}")]
    Connect(String),
    #[error("unsupported subscriber kind: {0}")]
    Unsupported(String),
}

#[async_trait::async_trait]
pub trait Deliver: Send + Sync {
    /// `body` is the canonical payload; it is rendered once per event so
    /// every subscriber (and the signature) sees identical bytes.
    async fn deliver(
        &self,
        subscriber: &Subscriber,
        event: &ChangeEvent,
        body: &str,
    ) -> Result<(), DeliveryError>;
}
