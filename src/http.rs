//! JSON-over-HTTP with retry and exponential backoff.
//!
//! Shared by the OpenAI and Ollama embedding providers, the synthesis
//! backends and the MyScale store:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use std::time::Duration;

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

/// 429 and 5xx responses are worth retrying; other failures are not.
pub fn is_transient(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Send the request produced by `build` until it succeeds, retrying
/// transient statuses and network errors up to `max_retries` times.
///
/// `service` names the remote in error messages (e.g. `"OpenAI API"`).
pub async fn send_with_retry<F>(
    build: F,
    url: &str,
    max_retries: u32,
    service: &str,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            tracing::debug!(service, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                if is_transient(status) {
                    tracing::warn!(service, %status, "transient error from remote");
                    last_err = Some(anyhow::anyhow!("{} error {}: {}", service, status, body_text));
                    continue;
                }
                bail!("{} error {}: {}", service, status, body_text.trim());
            }
            Err(e) => {
                tracing::warn!(service, error = %e, "request failed");
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", service, url, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", service)))
}

/// POST `body` to `url` and return the parsed JSON response.
pub async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let build = || {
        let request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        match bearer {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    };
    let response = send_with_retry(build, url, max_retries, service).await?;
    Ok(response.json().await?)
}
