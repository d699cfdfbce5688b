// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed-interval collection loop.
//!
//! Each tick polls the source, appends the batch to the channel and hands the same batch
//! to every secondary sink. Appends are strictly sequential; sinks run on their own tasks
//! and are waited for at most `sink_timeout` from the moment they were dispatched. Ticks
//! are never queued: an overrunning tick is followed immediately by the next one.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelSession, ChannelState, OffsetToken};
use crate::constants::{DEFAULT_BATCH_INTERVAL, DEFAULT_SINK_TIMEOUT, DEFAULT_SOURCE_TIMEOUT};
use crate::errors::{AppendError, OpenError, PipelineError, SinkError, SourceError};
use crate::record::Batch;
use crate::sinks::RecordSink;
use crate::source::RecordSource;
use crate::stats::{IngestionStats, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub interval: Duration,
    pub source_timeout: Duration,
    pub sink_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BATCH_INTERVAL,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }
}

/// What a single tick did on the primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The source produced no records; nothing was sent anywhere.
    Skipped,
    /// The source poll failed or timed out.
    SourceFailed,
    Appended { rows: usize, offset: OffsetToken },
    /// The batch could not be appended and was counted as an error.
    Dropped,
}

pub struct BatchOrchestrator {
    source: Arc<dyn RecordSource>,
    session: ChannelSession,
    sinks: Vec<Arc<dyn RecordSink>>,
    stats: Arc<IngestionStats>,
    config: OrchestratorConfig,
    sequence: u64,
}

impl BatchOrchestrator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        session: ChannelSession,
        stats: Arc<IngestionStats>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            source,
            session,
            sinks: Vec::new(),
            stats,
            config,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    pub fn stats(&self) -> &Arc<IngestionStats> {
        &self.stats
    }

    /// Runs ticks until `cancel` fires or a fatal error occurs, then closes the channel
    /// and reports statistics. An in-flight tick is always finished.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<StatsSnapshot, PipelineError> {
        info!(
            "Starting collection loop on channel {} every {}s with {} secondary sinks",
            self.session.name(),
            self.config.interval.as_secs_f64(),
            self.sinks.len()
        );

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let started = Instant::now();
            if let Err(e) = self.run_tick().await {
                error!("Stopping collection loop: {e}");
                break Err(e);
            }

            let delay = next_delay(self.config.interval, started.elapsed());
            if delay.is_zero() {
                warn!(
                    "Tick overran the {}s interval, starting the next one now",
                    self.config.interval.as_secs_f64()
                );
            }
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };

        info!("Shutting down collection loop");
        self.session.close().await;
        let snapshot = self.stats.log_summary();
        result.map(|()| snapshot)
    }

    /// One collection tick. Only authentication failures are fatal; every other failure
    /// is logged and counted.
    pub async fn run_tick(&mut self) -> Result<TickOutcome, PipelineError> {
        let polled = tokio::time::timeout(self.config.source_timeout, self.source.poll())
            .await
            .unwrap_or(Err(SourceError::Timeout(self.config.source_timeout)));
        self.stats.record_source_dropped(self.source.dropped_count());
        let records = match polled {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to poll source: {e}");
                self.stats.record_error();
                return Ok(TickOutcome::SourceFailed);
            }
        };
        if records.is_empty() {
            debug!("Source returned no records, skipping tick");
            return Ok(TickOutcome::Skipped);
        }

        self.sequence += 1;
        let batch = Batch::new(self.sequence, records);
        let deadline = Instant::now() + self.config.sink_timeout;
        let pending = self.dispatch_sinks(&batch);

        let outcome = self.append_primary(&batch).await;
        self.collect_sinks(pending, deadline).await;
        outcome
    }

    async fn append_primary(&mut self, batch: &Batch) -> Result<TickOutcome, PipelineError> {
        if self.session.state() != ChannelState::Open {
            if let Err(e) = self.session.open().await {
                return self.open_failed(e);
            }
        }

        let mut reopened = false;
        loop {
            match self.session.append(batch).await {
                Ok(result) => {
                    let offset = self.session.last_committed_offset();
                    self.stats.record_append(&result, offset);
                    return Ok(TickOutcome::Appended {
                        rows: result.accepted_rows(),
                        offset,
                    });
                }
                Err(AppendError::Auth(e)) => return Err(e.into()),
                Err(AppendError::ChannelFaulted { status, code }) if !reopened => {
                    warn!(
                        "Channel {} faulted (status {status}, code {code:?}), reopening from offset {}",
                        self.session.name(),
                        self.session.last_committed_offset()
                    );
                    reopened = true;
                    if let Err(e) = self.session.reopen().await {
                        return self.open_failed(e);
                    }
                }
                Err(e) => {
                    error!("Dropping batch {} ({} rows): {e}", batch.sequence(), batch.len());
                    self.stats.record_error();
                    return Ok(TickOutcome::Dropped);
                }
            }
        }
    }

    // The open is retried on the next tick.
    fn open_failed(&self, e: OpenError) -> Result<TickOutcome, PipelineError> {
        match e {
            OpenError::Auth(e) => Err(e.into()),
            e => {
                error!("Failed to open channel {}: {e}", self.session.name());
                self.stats.record_error();
                Ok(TickOutcome::Dropped)
            }
        }
    }

    fn dispatch_sinks(
        &self,
        batch: &Batch,
    ) -> Vec<(String, JoinHandle<Result<usize, SinkError>>)> {
        self.sinks
            .iter()
            .map(|sink| {
                let sink = Arc::clone(sink);
                let batch = batch.clone();
                let name = sink.name().to_string();
                let handle = tokio::spawn(async move { sink.write(&batch).await });
                (name, handle)
            })
            .collect()
    }

    async fn collect_sinks(
        &self,
        pending: Vec<(String, JoinHandle<Result<usize, SinkError>>)>,
        deadline: Instant,
    ) {
        for (name, handle) in pending {
            // On timeout the task is left to finish on its own.
            let result = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(SinkError::Task(e.to_string())),
                Err(_) => Err(SinkError::Timeout(self.config.sink_timeout)),
            };
            match result {
                Ok(delivered) => {
                    debug!("Sink {name} delivered {delivered} items");
                    self.stats.record_sink_success(&name, delivered);
                }
                Err(e) => {
                    warn!("Sink {name} failed: {e}");
                    self.stats.record_sink_failure(&name);
                }
            }
        }
    }
}

/// Time left in the interval after a tick; zero when the tick overran.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}
