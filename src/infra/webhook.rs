//! Webhook delivery with HMAC-SHA256 payload signatures, plus the
//! in-process fan-out for websocket subscribers.
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::app::hub::EventHub;
use crate::domain::event::ChangeEvent;
use crate::domain::model::{Subscriber, SubscriberKind};
use crate::ports::deliver::{Deliver, DeliveryError};

type HmacSha256 = Hmac<Sha256>;

/// Computes the signature header value for a payload: `sha256=<hex>`.
/// Subscribers replaying HMAC-SHA256 over the exact received body with the
/// shared secret obtain the same digest.
pub fn signature_header(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `sha256=<hex>` header against a payload. Constant-time via the
/// HMAC library; malformed headers simply fail.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct SubscriberSink {
    client: reqwest::Client,
    secret: Option<String>,
    default_timeout_ms: u64,
    hub: EventHub,
}

impl SubscriberSink {
    pub fn new(
        user_agent: String,
        secret: Option<String>,
        default_timeout_ms: u64,
        hub: EventHub,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            secret,
            default_timeout_ms,
            hub,
        })
    }

    async fn post_webhook(
        &self,
        subscriber: &Subscriber,
        event: &ChangeEvent,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let timeout = Duration::from_millis(
            subscriber.timeout_ms.unwrap_or(self.default_timeout_ms),
        );
        let mut request = self
            .client
            .post(&subscriber.endpoint)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("X-Event-Id", &event.event_id)
            .header("X-Event-Type", event.event_type.as_str());
        if let Some(secret) = &self.secret {
            request = request.header(
                "X-Signature",
                signature_header(secret.as_bytes(), body.as_bytes()),
            );
        }

        let response = request.body(body.to_string()).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(
                subscriber = %subscriber.id,
                event_id = %event.event_id,
                status = status.as_u16(),
                "Webhook delivered"
            );
            Ok(())
        } else {
            warn!(
                subscriber = %subscriber.id,
                event_id = %event.event_id,
                status = status.as_u16(),
                "Webhook rejected"
            );
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

#[async_trait::async_trait]
impl Deliver for SubscriberSink {
    async fn deliver(
        &self,
        subscriber: &Subscriber,
        event: &ChangeEvent,
        body: &str,
    ) -> Result<(), DeliveryError> {
        match subscriber.kind {
            SubscriberKind::Webhook => self.post_webhook(subscriber, event, body).await,
            SubscriberKind::Websocket => {
                // Fan out to connected stream clients; nobody listening is
                // still a successful hand-off.
                self.hub.publish(body);
                Ok(())
            }
            SubscriberKind::Email => {
                Err(DeliveryError::Unsupported("email".to_string()))
            }
        }
    }
}
