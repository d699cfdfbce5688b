// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry policy for append requests.
//!
//! Delay computation is kept pure so the policy can be checked without any network I/O;
//! the append engine owns the bounded loop that consumes it.

use std::time::Duration;

use crate::constants::{
    DEFAULT_APPEND_ATTEMPTS, DEFAULT_APPEND_BACKOFF_BASE_MS, DEFAULT_APPEND_BACKOFF_MAX_MS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry right away, up to the given number of attempts.
    Immediate(u32),
    /// Attempts, fixed delay in milliseconds between them.
    LinearBackoff(u32, u64),
    /// Doubling delay from `base_ms`, capped at `max_ms`, with jitter.
    ExponentialBackoff {
        attempts: u32,
        base_ms: u64,
        max_ms: u64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            attempts: DEFAULT_APPEND_ATTEMPTS,
            base_ms: DEFAULT_APPEND_BACKOFF_BASE_MS,
            max_ms: DEFAULT_APPEND_BACKOFF_MAX_MS,
        }
    }
}

impl RetryStrategy {
    /// Total attempts including the first one. Never less than one.
    pub fn max_attempts(&self) -> u32 {
        let attempts = match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                *attempts
            }
            RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            RetryStrategy::ExponentialBackoff {
                base_ms, max_ms, ..
            } => with_jitter(backoff_delay(
                attempt,
                Duration::from_millis(*base_ms),
                Duration::from_millis(*max_ms),
            )),
        }
    }

    /// Upper bound for any delay, used to cap server-provided `Retry-After` hints.
    pub fn max_delay(&self) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            RetryStrategy::ExponentialBackoff { max_ms, .. } => Duration::from_millis(*max_ms),
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Uniform jitter in `[delay / 2, delay]`.
pub fn with_jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return delay;
    }
    let half = millis.div_ceil(2);
    Duration::from_millis(half + fastrand::u64(0..=millis - half))
}
