// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort destinations downstream of the primary channel.
//!
//! Sinks are driven by the orchestrator on their own tasks, bounded by a timeout. A sink
//! error is logged and counted; it never reaches the primary path.

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::record::{Batch, Record};

pub mod notification;
pub mod postgres;
pub mod slack;

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Stable name used for logs and per-sink counters.
    fn name(&self) -> &str;

    /// Delivers the batch, returning how many items were delivered in the sink's own
    /// unit: rows for stores, messages for notifiers.
    async fn write(&self, batch: &Batch) -> Result<usize, SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Text(String),
    /// Details of one camera, with its still image when the record carries one.
    CameraAlert(Record),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), SinkError>;
}
