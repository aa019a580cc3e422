//! HTTP client for the Mistral OCR API

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ocr::{OcrEngine, OcrRequest, OcrResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// OCR engine backed by `POST {api_base}/ocr`
pub struct MistralOcrClient {
    http: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

/// Outcome of a single attempt
enum Attempt {
    Done(OcrResponse),
    Retry { reason: String, wait: Option<Duration> },
}

impl MistralOcrClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(Error::HttpRequest)?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/ocr", config.api_base.trim_end_matches('/')),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        })
    }

    /// Backoff before retry number `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    async fn attempt(&self, api_key: &str, request: &OcrRequest) -> Result<Attempt> {
        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(Attempt::Retry {
                    reason: e.to_string(),
                    wait: None,
                })
            }
            Err(e) => return Err(Error::HttpRequest(e)),
        };

        let status = response.status();
        if status.is_success() {
            let body = response.json::<OcrResponse>().await?;
            return Ok(Attempt::Done(body));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();

        if is_retryable(status) {
            return Ok(Attempt::Retry {
                reason: format!("status {}: {}", status.as_u16(), truncate(&message, 200)),
                wait: retry_after,
            });
        }

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(Error::OcrAuth {
                status: status.as_u16(),
                message,
            });
        }

        Err(Error::OcrApi {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl OcrEngine for MistralOcrClient {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse> {
        let api_key = self.api_key.as_deref().ok_or(Error::MissingApiKey)?;
        let start = Instant::now();
        let mut last_reason = String::new();
        let mut pending_wait = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let wait = pending_wait.take().unwrap_or_else(|| self.backoff(attempt));
                tracing::warn!(
                    attempt,
                    max_retries = self.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    reason = %last_reason,
                    "retrying OCR request"
                );
                sleep(wait).await;
            }

            match self.attempt(api_key, request).await? {
                Attempt::Done(response) => {
                    tracing::debug!(
                        pages = response.pages.len(),
                        model = %response.model,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        retries = attempt,
                        "OCR request completed"
                    );
                    return Ok(response);
                }
                Attempt::Retry { reason, wait } => {
                    last_reason = reason;
                    pending_wait = wait;
                }
            }
        }

        tracing::warn!(reason = %last_reason, "OCR request failed after all retries");
        if last_reason.starts_with("status 429") {
            Err(Error::RateLimited {
                attempts: self.max_retries + 1,
            })
        } else {
            Err(Error::OcrApi {
                status: 503,
                message: last_reason,
            })
        }
    }
}

/// Statuses worth retrying: rate limiting and server-side failures
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
