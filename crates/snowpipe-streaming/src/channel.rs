// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of one logical delivery channel.
//!
//! ```text
//!   CLOSED ──open──> OPENING ──ok──> OPEN ──close──> CLOSING ──> CLOSED
//!      ^                │             │
//!      └────error───────┘             └──token mismatch──> FAULTED ──open──> OPENING
//! ```
//!
//! The session is the only owner of the continuation token. It is replaced only with the
//! value the service returned for a confirmed append and is dropped the moment the
//! service reports a mismatch, so a faulted channel never holds a stale token.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

use crate::append::{AppendEngine, AppendResult};
use crate::client::IngestClient;
use crate::constants::{CHANNELS_PATH, CHANNEL_NAME_TIMESTAMP_FORMAT};
use crate::errors::{AppendError, OpenError};
use crate::record::Batch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
    Faulted,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ChannelState::Closed => "CLOSED",
            ChannelState::Opening => "OPENING",
            ChannelState::Open => "OPEN",
            ChannelState::Closing => "CLOSING",
            ChannelState::Faulted => "FAULTED",
        };
        f.write_str(state)
    }
}

/// Server-issued proof of position, echoed back unmodified on the next append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen, strictly increasing batch marker used for deduplication and resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OffsetToken(pub u64);

impl OffsetToken {
    pub fn next(self) -> Self {
        OffsetToken(self.0.saturating_add(1))
    }
}

impl fmt::Display for OffsetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offsets travel as strings on the wire; numbers are tolerated.
pub fn parse_offset(value: &Value) -> Option<OffsetToken> {
    match value {
        Value::String(s) => s.trim().parse().ok().map(OffsetToken),
        Value::Number(n) => n.as_u64().map(OffsetToken),
        _ => None,
    }
}

/// `<prefix>_<YYYYmmdd_HHMMSS>`; the timestamp tells restarted sessions apart.
pub fn channel_name(prefix: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{prefix}_{}",
        created_at.format(CHANNEL_NAME_TIMESTAMP_FORMAT)
    )
}

/// Identifies an opened append destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    name: String,
    id: String,
}

impl ChannelHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: name.to_string(),
        }
    }

    pub fn with_id(name: &str, id: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> String {
        format!("{CHANNELS_PATH}/{}", self.id)
    }

    pub fn append_path(&self) -> String {
        format!("{}/append", self.path())
    }
}

#[derive(Serialize)]
struct OpenRequest<'a> {
    channel_name: &'a str,
}

#[derive(Deserialize)]
struct OpenResponse {
    #[serde(default)]
    channel_id: Option<String>,
    continuation_token: Option<String>,
    #[serde(default)]
    offset_token: Option<Value>,
}

pub struct ChannelSession {
    engine: AppendEngine,
    name: String,
    state: ChannelState,
    handle: Option<ChannelHandle>,
    continuation_token: Option<ContinuationToken>,
    /// Highest offset confirmed by the service, locally or at open.
    last_committed: OffsetToken,
}

impl ChannelSession {
    pub fn new(engine: AppendEngine, name: String) -> Self {
        Self {
            engine,
            name,
            state: ChannelState::Closed,
            handle: None,
            continuation_token: None,
            last_committed: OffsetToken::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn handle(&self) -> Option<&ChannelHandle> {
        self.handle.as_ref()
    }

    pub fn continuation_token(&self) -> Option<&ContinuationToken> {
        self.continuation_token.as_ref()
    }

    pub fn last_committed_offset(&self) -> OffsetToken {
        self.last_committed
    }

    /// Opens the channel. Valid from CLOSED and FAULTED; on failure the session is CLOSED.
    pub async fn open(&mut self) -> Result<(), OpenError> {
        if !matches!(self.state, ChannelState::Closed | ChannelState::Faulted) {
            return Err(OpenError::InvalidState(self.state));
        }
        info!("STREAMING | Opening channel: {}", self.name);
        self.state = ChannelState::Opening;
        self.handle = None;
        self.continuation_token = None;

        match self.request_open().await {
            Ok((handle, continuation_token, reported_offset)) => {
                // Never step back behind an offset this process already saw confirmed.
                self.last_committed = self.last_committed.max(reported_offset);
                info!(
                    "STREAMING | Channel {} open, continuation token {continuation_token}, offset {}",
                    handle.name(),
                    self.last_committed
                );
                self.handle = Some(handle);
                self.continuation_token = Some(continuation_token);
                self.state = ChannelState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Closed;
                Err(e)
            }
        }
    }

    /// Drops the current handle and opens the channel again, resuming from the last
    /// confirmed offset.
    pub async fn reopen(&mut self) -> Result<(), OpenError> {
        warn!(
            "STREAMING | Reopening channel {} from {} (offset {})",
            self.name, self.state, self.last_committed
        );
        self.state = ChannelState::Closed;
        self.open().await
    }

    async fn request_open(
        &self,
    ) -> Result<(ChannelHandle, ContinuationToken, OffsetToken), OpenError> {
        let response = self
            .engine
            .client()
            .request(Method::POST, CHANNELS_PATH)
            .await?
            .json(&OpenRequest {
                channel_name: &self.name,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OpenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: OpenResponse = response
            .json()
            .await
            .map_err(|e| OpenError::Malformed(e.to_string()))?;
        let continuation_token = body
            .continuation_token
            .filter(|token| !token.is_empty())
            .map(ContinuationToken::new)
            .ok_or_else(|| OpenError::Malformed("missing continuation_token".to_string()))?;
        let offset = body
            .offset_token
            .as_ref()
            .and_then(parse_offset)
            .unwrap_or_default();
        let handle = match body.channel_id {
            Some(id) if !id.is_empty() => ChannelHandle::with_id(&self.name, &id),
            _ => ChannelHandle::new(&self.name),
        };
        Ok((handle, continuation_token, offset))
    }

    /// Appends one batch. Valid only while OPEN.
    ///
    /// On success the continuation token becomes exactly the one the service returned and
    /// the offset advances; on a token mismatch the session is FAULTED and the token is
    /// discarded. Other failures leave position untouched so the same offset is reused.
    pub async fn append(&mut self, batch: &Batch) -> Result<AppendResult, AppendError> {
        let (Some(handle), Some(continuation_token), ChannelState::Open) =
            (&self.handle, &self.continuation_token, self.state)
        else {
            return Err(AppendError::InvalidState(self.state));
        };
        let next_offset = self.last_committed.next();

        match self
            .engine
            .submit(handle, continuation_token, next_offset, batch)
            .await
        {
            Ok(result) => {
                self.continuation_token = Some(result.continuation_token.clone());
                self.last_committed = next_offset.max(result.reported_offset.unwrap_or_default());
                debug!(
                    "STREAMING | Channel {} advanced to offset {}",
                    self.name, self.last_committed
                );
                Ok(result)
            }
            Err(e @ AppendError::ChannelFaulted { .. }) => {
                self.state = ChannelState::Faulted;
                self.continuation_token = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort close. Failures are logged; the service expires idle channels itself.
    pub async fn close(&mut self) {
        let previous = self.state;
        if previous == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closing;
        info!("STREAMING | Closing channel: {}", self.name);

        if let Some(handle) = self.handle.take() {
            if previous == ChannelState::Open {
                match self.engine.client().request(Method::DELETE, &handle.path()).await {
                    Ok(request) => match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            debug!("STREAMING | Channel {} closed", handle.name());
                        }
                        Ok(response) => warn!(
                            "STREAMING | Close of {} returned {}; channel will expire after inactivity",
                            handle.name(),
                            response.status()
                        ),
                        Err(e) => warn!(
                            "STREAMING | Close of {} failed: {e}; channel will expire after inactivity",
                            handle.name()
                        ),
                    },
                    Err(e) => warn!("STREAMING | Skipping close request: {e}"),
                }
            }
        }

        self.continuation_token = None;
        self.state = ChannelState::Closed;
    }
}
