// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide ingestion counters.
//!
//! Updates never fail: a poisoned lock is recovered rather than propagated, so recording
//! statistics can never abort a tick.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::append::AppendResult;
use crate::channel::OffsetToken;

/// Per-sink totals. `delivered` is in the sink's own unit: rows for stores, messages
/// for notifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkCounters {
    pub delivered: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rows_sent: u64,
    rows_rejected: u64,
    bytes_sent: u64,
    batches: u64,
    errors: u64,
    records_dropped: u64,
    sinks: BTreeMap<String, SinkCounters>,
    last_offset: Option<OffsetToken>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub rows_sent: u64,
    pub rows_rejected: u64,
    pub bytes_sent: u64,
    pub batches: u64,
    pub errors: u64,
    /// Malformed source entries dropped before batching.
    pub records_dropped: u64,
    pub sinks: BTreeMap<String, SinkCounters>,
    pub elapsed: Duration,
    pub last_offset: Option<OffsetToken>,
}

impl StatsSnapshot {
    /// Rows per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows_sent as f64 / secs
        } else {
            0.0
        }
    }

    pub fn sink(&self, name: &str) -> SinkCounters {
        self.sinks.get(name).copied().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct IngestionStats {
    started_at: Instant,
    counters: Mutex<Counters>,
}

impl Default for IngestionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a confirmed append. Rows the service refused, duplicates included, are
    /// counted as rejected and not as sent.
    pub fn record_append(&self, result: &AppendResult, offset: OffsetToken) {
        let mut counters = self.counters();
        counters.rows_sent += result.accepted_rows() as u64;
        counters.rows_rejected += result.rejected_rows as u64;
        counters.bytes_sent += result.bytes as u64;
        counters.batches += 1;
        counters.last_offset = Some(offset);
        debug!(
            "STATS | batch {} confirmed: {} rows, {} rejected, {} bytes, offset {offset}",
            counters.batches,
            result.accepted_rows(),
            result.rejected_rows,
            result.bytes
        );
    }

    /// Counts a primary-path failure (dropped batch, failed source poll, failed reopen).
    pub fn record_error(&self) {
        self.counters().errors += 1;
    }

    /// Stores the source's running total of dropped malformed entries.
    pub fn record_source_dropped(&self, total: u64) {
        self.counters().records_dropped = total;
    }

    pub fn record_sink_success(&self, sink: &str, delivered: usize) {
        self.counters()
            .sinks
            .entry(sink.to_string())
            .or_default()
            .delivered += delivered as u64;
    }

    pub fn record_sink_failure(&self, sink: &str) {
        let mut counters = self.counters();
        counters.errors += 1;
        counters.sinks.entry(sink.to_string()).or_default().errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters();
        StatsSnapshot {
            rows_sent: counters.rows_sent,
            rows_rejected: counters.rows_rejected,
            bytes_sent: counters.bytes_sent,
            batches: counters.batches,
            errors: counters.errors,
            records_dropped: counters.records_dropped,
            sinks: counters.sinks.clone(),
            elapsed: self.started_at.elapsed(),
            last_offset: counters.last_offset,
        }
    }

    pub fn log_summary(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        info!(
            "STATS | {} rows sent ({} rejected), {} bytes, {} batches, {} errors in {:.1}s ({:.2} rows/s)",
            snapshot.rows_sent,
            snapshot.rows_rejected,
            snapshot.bytes_sent,
            snapshot.batches,
            snapshot.errors,
            snapshot.elapsed.as_secs_f64(),
            snapshot.throughput()
        );
        if let Some(offset) = snapshot.last_offset {
            info!("STATS | last confirmed offset: {offset}");
        }
        if snapshot.records_dropped > 0 {
            info!(
                "STATS | {} malformed source entries dropped",
                snapshot.records_dropped
            );
        }
        for (name, sink) in &snapshot.sinks {
            info!(
                "STATS | sink {name}: {} delivered, {} errors",
                sink.delivered, sink.errors
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ContinuationToken;
    use std::sync::Arc;

    fn result(rows: usize, rejected_rows: usize, bytes: usize) -> AppendResult {
        AppendResult {
            continuation_token: ContinuationToken::new("0_1"),
            reported_offset: None,
            rows,
            rejected_rows,
            bytes,
            attempts: 1,
        }
    }

    #[test]
    fn test_record_append() {
        let stats = IngestionStats::new();
        stats.record_append(&result(3, 0, 120), OffsetToken(1));
        stats.record_append(&result(4, 1, 200), OffsetToken(2));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rows_sent, 6);
        assert_eq!(snapshot.rows_rejected, 1);
        assert_eq!(snapshot.bytes_sent, 320);
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.last_offset, Some(OffsetToken(2)));
    }

    #[test]
    fn test_sink_counters_are_isolated() {
        let stats = IngestionStats::new();
        stats.record_sink_success("postgres", 3);
        stats.record_sink_failure("slack");
        stats.record_sink_failure("slack");

        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot.sink("postgres"),
            SinkCounters {
                delivered: 3,
                errors: 0
            }
        );
        assert_eq!(snapshot.sink("slack").errors, 2);
        assert_eq!(snapshot.sink("unknown"), SinkCounters::default());
        assert_eq!(snapshot.errors, 2);
    }

    #[test]
    fn test_source_drops_reach_the_summary() {
        let stats = IngestionStats::new();
        stats.record_source_dropped(2);
        stats.record_source_dropped(5);

        // The source reports a running total, so the latest value wins.
        assert_eq!(stats.log_summary().records_dropped, 5);
        assert_eq!(stats.snapshot().errors, 0);
    }

    #[test]
    fn test_throughput_without_elapsed_time() {
        let snapshot = StatsSnapshot {
            rows_sent: 10,
            rows_rejected: 0,
            bytes_sent: 0,
            batches: 1,
            errors: 0,
            records_dropped: 0,
            sinks: BTreeMap::new(),
            elapsed: Duration::ZERO,
            last_offset: None,
        };
        assert_eq!(snapshot.throughput(), 0.0);

        let snapshot = StatsSnapshot {
            elapsed: Duration::from_secs(4),
            ..snapshot
        };
        assert_eq!(snapshot.throughput(), 2.5);
    }

    #[test]
    fn test_poisoned_lock_still_records() {
        let stats = Arc::new(IngestionStats::new());
        let poisoner = Arc::clone(&stats);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.counters.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        stats.record_error();
        assert_eq!(stats.snapshot().errors, 1);
    }
}
