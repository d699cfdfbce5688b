// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Submission of one batch to an open channel.
//!
//! A batch is serialized once and sent with the channel's current continuation token
//! and the next offset token. Transient failures (transport errors, timeouts, 408, 429
//! and 5xx) are retried according to the [`RetryStrategy`]; a 409 means the service
//! disagrees about the channel position and is surfaced as a channel fault; any other
//! 4xx rejects the batch for good.

use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::channel::{parse_offset, ChannelHandle, ContinuationToken, OffsetToken};
use crate::client::{classify_status, IngestClient, StatusClass};
use crate::errors::{AppendError, AuthError};
use crate::record::{Batch, Record};
use crate::retry::RetryStrategy;

#[derive(Serialize)]
struct AppendRequest<'a> {
    rows: &'a [Record],
    continuation_token: &'a str,
    offset_token: String,
}

#[derive(Deserialize)]
struct AppendResponse {
    continuation_token: Option<String>,
    #[serde(default)]
    offset_token: Option<Value>,
    #[serde(default)]
    rejected_rows: Vec<Value>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "error_code")]
    code: Option<String>,
}

/// Server-confirmed outcome of one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// Token to echo on the next append, exactly as returned by the service.
    pub continuation_token: ContinuationToken,
    /// Offset the service reports as committed, when it reports one.
    pub reported_offset: Option<OffsetToken>,
    /// Rows in the submitted batch.
    pub rows: usize,
    /// Rows the service refused inside an otherwise successful append.
    pub rejected_rows: usize,
    /// Size of the serialized request body.
    pub bytes: usize,
    pub attempts: u32,
}

impl AppendResult {
    pub fn accepted_rows(&self) -> usize {
        self.rows.saturating_sub(self.rejected_rows)
    }
}

#[derive(Debug, Clone)]
pub struct AppendEngine {
    client: IngestClient,
    retry_strategy: RetryStrategy,
}

impl AppendEngine {
    pub fn new(client: IngestClient, retry_strategy: RetryStrategy) -> Self {
        Self {
            client,
            retry_strategy,
        }
    }

    pub fn client(&self) -> &IngestClient {
        &self.client
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    pub async fn submit(
        &self,
        channel: &ChannelHandle,
        continuation_token: &ContinuationToken,
        offset_token: OffsetToken,
        batch: &Batch,
    ) -> Result<AppendResult, AppendError> {
        let payload = serde_json::to_vec(&AppendRequest {
            rows: batch.records(),
            continuation_token: continuation_token.as_str(),
            offset_token: offset_token.to_string(),
        })?;
        let path = channel.append_path();
        let max_attempts = self.retry_strategy.max_attempts();
        debug!(
            "STREAMING | Appending {} rows ({} bytes) to {} at offset {offset_token}",
            batch.len(),
            payload.len(),
            channel.name()
        );

        let mut attempts = 0;
        let mut credential_refreshed = false;
        loop {
            attempts += 1;
            let time = Instant::now();
            let request = self
                .client
                .request(Method::POST, &path)
                .await?
                .header(CONTENT_TYPE, "application/json")
                .body(payload.clone());

            let (message, retry_after) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match classify_status(status) {
                        StatusClass::Success => {
                            let mut result = decode_success(response, batch.len()).await?;
                            result.bytes = payload.len();
                            result.attempts = attempts;
                            debug!(
                                "STREAMING | Append confirmed in {} ms after {attempts} attempt(s)",
                                time.elapsed().as_millis()
                            );
                            return Ok(result);
                        }
                        StatusClass::TokenMismatch => {
                            let code = error_code(response).await;
                            warn!(
                                "STREAMING | Continuation token rejected for {} ({code:?})",
                                channel.name()
                            );
                            return Err(AppendError::ChannelFaulted {
                                status: status.as_u16(),
                                code,
                            });
                        }
                        StatusClass::Rejected => {
                            let message = response.text().await.unwrap_or_default();
                            error!("STREAMING | Batch rejected with {status}: {message}");
                            return Err(AppendError::Rejected {
                                status: status.as_u16(),
                                message,
                            });
                        }
                        StatusClass::Unauthorized => {
                            let message = response.text().await.unwrap_or_default();
                            if credential_refreshed {
                                return Err(AppendError::Auth(AuthError::Rejected {
                                    status: status.as_u16(),
                                    message,
                                }));
                            }
                            warn!("STREAMING | Credential refused, refreshing before retry");
                            self.client.tokens().invalidate().await;
                            credential_refreshed = true;
                            (format!("{status}: {message}"), None)
                        }
                        StatusClass::Transient => {
                            let retry_after = retry_after_hint(response.headers());
                            let message = response.text().await.unwrap_or_default();
                            (format!("{status}: {message}"), retry_after)
                        }
                    }
                }
                Err(e) => (e.to_string(), None),
            };

            if attempts >= max_attempts {
                error!(
                    "STREAMING | Failed to append after {} ms and {attempts} attempts: {message}",
                    time.elapsed().as_millis()
                );
                return Err(AppendError::Transient { attempts, message });
            }

            let delay = match retry_after {
                Some(hint) => hint.min(self.retry_strategy.max_delay()),
                None => self.retry_strategy.delay_after(attempts),
            };
            warn!(
                "STREAMING | Append attempt {attempts} failed ({message}), retrying in {} ms",
                delay.as_millis()
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn decode_success(response: Response, rows: usize) -> Result<AppendResult, AppendError> {
    let status = response.status();
    let body: AppendResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            // Without the new continuation token the channel position is unknown.
            error!("STREAMING | Undecodable append response: {e}");
            return Err(AppendError::ChannelFaulted {
                status: status.as_u16(),
                code: None,
            });
        }
    };
    let Some(continuation_token) = body
        .continuation_token
        .filter(|token| !token.is_empty())
        .map(ContinuationToken::new)
    else {
        error!("STREAMING | Append response carried no continuation token");
        return Err(AppendError::ChannelFaulted {
            status: status.as_u16(),
            code: None,
        });
    };

    Ok(AppendResult {
        continuation_token,
        reported_offset: body.offset_token.as_ref().and_then(parse_offset),
        rows,
        rejected_rows: body.rejected_rows.len().min(rows),
        bytes: 0,
        attempts: 0,
    })
}

async fn error_code(response: Response) -> Option<String> {
    let body = response.text().await.ok()?;
    serde_json::from_str::<ErrorBody>(&body).ok()?.code
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
