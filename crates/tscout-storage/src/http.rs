//! Outbound HTTP for scrapers and the classifier endpoint.
//!
//! Every request runs in a named lane (a source id, or `classifier`). Lanes
//! share one global in-flight cap and each has its own smaller cap, so a slow
//! site cannot starve the others. Transient failures are retried; a
//! `Retry-After` header on 429/503 replaces the computed backoff delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a server-requested `Retry-After` wait.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay for the zero-based `retry`, capped at `max_delay`.
    pub fn backoff(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Whether a failed status is worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Delay-seconds form of `Retry-After`; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub per_lane_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            per_lane_in_flight: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request body cannot be replayed for a retry")]
    NotCloneable,
    #[error("http fetcher is shut down")]
    Closed,
}

/// What to do after one attempt.
enum Step {
    Done(FetchedResponse),
    Retry(Duration),
    Fail(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_lane_in_flight: usize,
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
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
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_lane_in_flight: config.per_lane_in_flight.max(1),
            lanes: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn lane(&self, name: &str) -> Arc<Semaphore> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_lane_in_flight)))
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        lane: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, lane, self.client.get(url)).await
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        lane: &str,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, lane, self.client.post(url).json(body)).await
    }

    /// Send `request` in `lane`. Only 2xx responses are returned as `Ok`.
    pub async fn send(
        &self,
        run_id: Uuid,
        lane: &str,
        request: RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let lane_limit = self.lane(lane).await;
        let _lane = lane_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, lane);
        self.send_with_retry(request).instrument(span).await
    }

    async fn send_with_retry(&self, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let attempt = request.try_clone().ok_or(FetchError::NotCloneable)?;
            match self.attempt(attempt, retry).await {
                Step::Done(response) => return Ok(response),
                Step::Fail(err) => return Err(err),
                Step::Retry(delay) => {
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn attempt(&self, request: RequestBuilder, retry: usize) -> Step {
        let retries_left = retry < self.retry.max_retries;
        match request.send().await {
            Ok(resp) if resp.status().is_success() => match collect(resp).await {
                Ok(fetched) => Step::Done(fetched),
                Err(err) => Step::Fail(err),
            },
            Ok(resp) => {
                let status = resp.status();
                if !(retries_left && is_transient_status(status)) {
                    return Step::Fail(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                let delay = match retry_after(resp.headers()) {
                    Some(requested) => requested.min(self.retry.max_retry_after),
                    None => self.retry.backoff(retry),
                };
                debug!(%status, retry, delay_ms = delay.as_millis() as u64, "transient status");
                Step::Retry(delay)
            }
            Err(err) if retries_left && is_transient_error(&err) => {
                debug!(error = %err, retry, "transient request error");
                Step::Retry(self.retry.backoff(retry))
            }
            Err(err) => Step::Fail(FetchError::Request(err)),
        }
    }
}

async fn collect(resp: Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}
