//! Rate-limited paginated access to the YouGile REST API, plus a fixture replay source.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use ygcdm_core::Resource;

pub const CRATE_NAME: &str = "ygcdm-storage";

/// Spacing that keeps a run under 50 requests per minute.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_millis(1500);
/// Spacing that keeps a run within 50 requests per minute.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub resource: Resource,
    pub offset: usize,
    pub limit: usize,
    pub include_deleted: bool,
    pub column_id: Option<String>,
}

impl PageRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("offset", self.offset.to_string()),
            ("limit", self.limit.to_string()),
            ("includeDeleted", self.include_deleted.to_string()),
        ];
        if let Some(column_id) = &self.column_id {
            pairs.push(("columnId", column_id.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paging {
    pub next: bool,
}

/// Response envelope shared by every list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEnvelope {
    pub content: Vec<JsonValue>,
    pub paging: Paging,
}

impl PageEnvelope {
    pub fn parse(url: &str, body: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(body).map_err(|err| TransportError::Envelope {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed page envelope from {url}: {message}")]
    Envelope { url: String, message: String },
}

/// One page of one resource listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get_page(&self, request: &PageRequest) -> Result<PageEnvelope, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_every: DEFAULT_REQUEST_INTERVAL,
        }
    }
}

/// Request budget shared by every fetch of a run.
///
/// With capacity 1 this is a minimum spacing between consecutive requests.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A bucket that never waits, for fixture replay.
    pub fn unthrottled() -> Self {
        Self::new(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::ZERO,
        })
    }

    /// Wait until a request may be sent, then consume one token.
    pub async fn acquire(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
            if refills > 0 {
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = if state.tokens == self.capacity {
                    now
                } else {
                    state.last_refill + self.refill_every * refills
                };
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self
                .refill_every
                .saturating_sub(now.saturating_duration_since(state.last_refill));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Live API transport. Never retries; a failed request fails the fetch.
#[derive(Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl HttpPageSource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
        })
    }

    pub fn resource_url(&self, resource: Resource) -> String {
        format!("{}/{}", self.base_url, resource.path())
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn get_page(&self, request: &PageRequest) -> Result<PageEnvelope, TransportError> {
        let url = self.resource_url(request.resource);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .header(CONTENT_TYPE, "application/json")
            .query(&request.query_pairs())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let final_url = resp.url().to_string();
        let body = resp.bytes().await?;
        PageEnvelope::parse(&final_url, &body)
    }
}

/// Serves recorded resource listings (`boards.json`, `columns.json`, `string-stickers.json`,
/// `tasks.json`) with the same paging and filtering rules as the live API.
#[derive(Debug, Default)]
pub struct FixturePageSource {
    records: HashMap<Resource, Vec<JsonValue>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl FixturePageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, resource: Resource, records: Vec<JsonValue>) -> Self {
        self.records.insert(resource, records);
        self
    }

    pub fn load_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new();
        for resource in [
            Resource::Boards,
            Resource::Columns,
            Resource::StringStickers,
            Resource::Tasks,
        ] {
            let path = dir.join(format!("{}.json", resource.path()));
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let records: Vec<JsonValue> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            source.records.insert(resource, records);
        }
        Ok(source)
    }

    /// Every request served so far, in order.
    pub async fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().await.clone()
    }
}

fn record_matches(record: &JsonValue, request: &PageRequest) -> bool {
    if !request.include_deleted && record.get("deleted").and_then(JsonValue::as_bool) == Some(true) {
        return false;
    }
    match &request.column_id {
        Some(column_id) => {
            record.get("columnId").and_then(JsonValue::as_str) == Some(column_id.as_str())
        }
        None => true,
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn get_page(&self, request: &PageRequest) -> Result<PageEnvelope, TransportError> {
        self.requests.lock().await.push(request.clone());

        let matching = self
            .records
            .get(&request.resource)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record_matches(record, request))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let start = request.offset.min(matching.len());
        let end = request.offset.saturating_add(request.limit).min(matching.len());
        Ok(PageEnvelope {
            content: matching[start..end].iter().map(|r| (*r).clone()).collect(),
            paging: Paging {
                next: end < matching.len(),
            },
        })
    }
}

/// Walks a resource listing page by page until the envelope reports no next page.
#[derive(Clone)]
pub struct PaginatedFetcher {
    source: Arc<dyn PageSource>,
    limiter: Arc<TokenBucket>,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn PageSource>, limiter: Arc<TokenBucket>) -> Self {
        Self { source, limiter }
    }

    pub async fn fetch(
        &self,
        resource: Resource,
        column_id: Option<&str>,
        page_size: usize,
        include_deleted: bool,
    ) -> Result<Vec<JsonValue>, TransportError> {
        let span = info_span!("fetch_resource", %resource, column_id, page_size, include_deleted);
        self.fetch_pages(resource, column_id, page_size.max(1), include_deleted)
            .instrument(span)
            .await
    }

    async fn fetch_pages(
        &self,
        resource: Resource,
        column_id: Option<&str>,
        page_size: usize,
        include_deleted: bool,
    ) -> Result<Vec<JsonValue>, TransportError> {
        let mut records = Vec::new();
        let mut request = PageRequest {
            resource,
            offset: 0,
            limit: page_size,
            include_deleted,
            column_id: column_id.map(ToString::to_string),
        };
        let mut pages = 0usize;

        loop {
            self.limiter.acquire().await;
            let page = self.source.get_page(&request).await?;
            pages += 1;
            debug!(offset = request.offset, count = page.content.len(), next = page.paging.next, "page fetched");
            records.extend(page.content);

            if !page.paging.next {
                break;
            }
            request.offset += page_size;
        }

        info!(pages, records = records.len(), "resource fetched");
        Ok(records)
    }
}
