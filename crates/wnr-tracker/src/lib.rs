//! Tracker client contract + REST implementation for the work-note relay.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use wnr_core::Issue;

pub const CRATE_NAME: &str = "wnr-tracker";

/// Raised when the tracker is unreachable, answers outside 2xx, or returns a
/// body the relay cannot read. The poll loop logs it and treats the cycle as
/// having no data; it never terminates the loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed tracker response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// Read-side contract the relay needs from the bug tracker.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Full snapshot of issues with nested notes, fetched fresh each cycle.
    async fn fetch_all_issues(&self) -> Result<Vec<Issue>, TransportError>;

    /// Single-issue fetch, for discovery paths that list ids elsewhere.
    async fn fetch_issue(&self, issue_id: u64) -> Result<Issue, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Connection settings for the tracker's REST API.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub project_id: u64,
    pub page_size: usize,
    pub filter_id: Option<u64>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// REST implementation over `GET {base}/api/rest/issues`, paging until the
/// tracker returns an empty page.
pub struct RestTrackerClient {
    config: RestClientConfig,
    client: reqwest::Client,
}

impl RestTrackerClient {
    pub fn new(config: RestClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building tracker http client")?;
        Ok(Self { config, client })
    }

    fn issues_url(&self) -> String {
        format!(
            "{}/api/rest/issues",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, TransportError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let response = self
                .client
                .get(url)
                .query(query)
                .header("Authorization", &self.config.api_token)
                .header("Content-Type", "application/json")
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp.json::<Value>().await.map_err(TransportError::Request);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }

        Err(TransportError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    async fn fetch_page_entries(&self, page: usize) -> Result<Vec<Value>, TransportError> {
        let url = self.issues_url();
        let mut query = vec![
            ("project_id", self.config.project_id.to_string()),
            ("page_size", self.config.page_size.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(filter_id) = self.config.filter_id {
            query.push(("filter_id", filter_id.to_string()));
        }

        let body = self.get_json(&url, &query).await?;
        body.get("issues")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| TransportError::Malformed {
                url,
                reason: "missing `issues` array".to_string(),
            })
    }
}

/// Parses raw issue records, dropping malformed entries with a warning
/// rather than failing the page.
fn parse_issue_entries(entries: Vec<Value>) -> Vec<Issue> {
    let mut issues = Vec::with_capacity(entries.len());
    for entry in entries {
        match Issue::from_value(entry) {
            Ok(issue) => issues.push(issue),
            Err(err) => warn!("skipping malformed issue record: {err}"),
        }
    }
    issues
}

#[async_trait]
impl TrackerClient for RestTrackerClient {
    async fn fetch_all_issues(&self) -> Result<Vec<Issue>, TransportError> {
        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            // Termination is on the raw page being empty, not on the parsed
            // count, so a page of malformed records does not end the walk.
            let entries = self.fetch_page_entries(page).await?;
            if entries.is_empty() {
                break;
            }
            all.extend(parse_issue_entries(entries));
            page += 1;
        }
        Ok(all)
    }

    async fn fetch_issue(&self, issue_id: u64) -> Result<Issue, TransportError> {
        let url = format!("{}/{}", self.issues_url(), issue_id);
        let body = self.get_json(&url, &[]).await?;
        let entry = body
            .get("issues")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .cloned()
            .ok_or_else(|| TransportError::Malformed {
                url: url.clone(),
                reason: "missing issue record".to_string(),
            })?;
        Issue::from_value(entry).map_err(|err| TransportError::Malformed {
            url,
            reason: err.to_string(),
        })
    }
}
