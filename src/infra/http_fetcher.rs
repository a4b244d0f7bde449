//! Reqwest-backed `Fetch` implementation for JSON listing indexes. Pages are
//! requested with a `page` query parameter; a short page ends the walk.
//! HTML extraction lives outside this process; this adapter only consumes
//! structured indexes.
use reqwest::header;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::listing::{FetchSnapshot, RawListing};
use crate::domain::target::PollingTarget;
use crate::ports::fetch::{Fetch, FetchError};

pub struct HttpFetcher {
    client: reqwest::Client,
    max_pages: u32,
}

/// Accepts either a bare array of listings or an envelope object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IndexPage {
    Bare(Vec<RawListing>),
    Envelope {
        listings: Vec<RawListing>,
        #[serde(default)]
        total: Option<usize>,
    },
}

impl IndexPage {
    fn into_parts(self) -> (Vec<RawListing>, Option<usize>) {
        match self {
            IndexPage::Bare(listings) => (listings, None),
            IndexPage::Envelope { listings, total } => (listings, total),
        }
    }
}

impl HttpFetcher {
    pub fn new(
        user_agent: String,
        timeout_secs: u64,
        max_pages: u32,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_idle_timeout(std::time::Duration::from_secs(120))
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, max_pages })
    }

    fn classify_error(e: &reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            let msg = e.to_string();
            if msg.contains("dns") {
                FetchError::Dns(msg)
            } else {
                FetchError::Connect(msg)
            }
        } else {
            FetchError::Other(e.to_string())
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        page: u32,
    ) -> Result<(Vec<RawListing>, Option<usize>, Option<String>, Option<String>), FetchError> {
        debug!(url, page, "Index page fetch start");
        let response = self
            .client
            .get(url)
            .query(&[("page", page)])
            .send()
            .await
            .map_err(|e| Self::classify_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify_error(&e))?;
        let parsed: IndexPage = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Parse(format!("page {page}: {e}")))?;
        let (listings, total) = parsed.into_parts();
        Ok((listings, total, etag, last_modified))
    }
}

#[async_trait::async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, target: &PollingTarget, full: bool) -> Result<FetchSnapshot, FetchError> {
        let scraped_at_ms = now_epoch_ms();
        let (first_page, total, etag, last_modified) = self.fetch_page(&target.url, 1).await?;
        let first_page_len = first_page.len();
        let first_page_ids: Vec<String> = first_page.iter().map(|l| l.id.clone()).collect();

        let mut listings = first_page;
        let mut pages_scraped = 1;

        if full && first_page_len > 0 {
            for page in 2..=self.max_pages {
                match self.fetch_page(&target.url, page).await {
                    Ok((batch, _, _, _)) => {
                        let len = batch.len();
                        listings.extend(batch);
                        pages_scraped = page;
                        // Short or empty page: the surface is exhausted.
                        if len < first_page_len {
                            break;
                        }
                        if let Some(t) = total {
                            if listings.len() >= t {
                                break;
                            }
                        }
                    }
                    Err(FetchError::Status(404)) => break,
                    Err(e) => {
                        warn!(target_id = %target.id, page, error = %e, "Page fetch failed");
                        return Err(e);
                    }
                }
            }
        }

        let total_listings = total.unwrap_or(listings.len());
        Ok(FetchSnapshot {
            source: target.url.clone(),
            listings,
            total_listings,
            pages_scraped,
            scraped_at_ms,
            full,
            first_page_ids,
            etag,
            last_modified,
        })
    }
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
