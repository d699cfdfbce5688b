// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::channel::ChannelState;
use thiserror::Error;

/// Failures producing a bearer credential. Fatal to the process.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential material: {0}")]
    InvalidMaterial(String),
    #[error("credential refresh rejected: status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("credential refresh failed: {0}")]
    Transport(String),
    #[error("credential refresh failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl AuthError {
    /// Rejections and bad key material cannot heal by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transport(_))
    }
}

/// Failures resolving the ingestion endpoint. Fatal to the process.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("discovery returned status {0}")]
    Status(u16),
    #[error("malformed discovery response: {0}")]
    Malformed(String),
    #[error("discovery request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failures opening a channel.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("channel open returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed channel open response: {0}")]
    Malformed(String),
    #[error("channel open request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cannot open channel while {0}")]
    InvalidState(ChannelState),
}

/// Failures appending a batch to an open channel.
#[derive(Debug, Error)]
pub enum AppendError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The service no longer agrees on the channel position; the channel must be reopened.
    #[error("channel faulted (status {status}, code {code:?})")]
    ChannelFaulted { status: u16, code: Option<String> },
    #[error("append failed after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    /// The payload will never be accepted; the batch is dropped.
    #[error("batch rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("cannot append while channel is {0}")]
    InvalidState(ChannelState),
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures in a best-effort secondary sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink rejected delivery: {0}")]
    Rejected(String),
    #[error("sink timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("sink task failed: {0}")]
    Task(String),
}

/// Failures polling the upstream record source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source returned status {0}")]
    Status(u16),
    #[error("failed to decode source payload: {0}")]
    Decode(String),
    #[error("source poll timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Unrecoverable outcome of the collection loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
}
