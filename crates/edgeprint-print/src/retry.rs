// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy with exponential backoff + jitter for dispatch failures.
//
// Errors are classified as Transient (print subsystem unreachable, retry
// automatically) or Permanent (retrying the same payload and options cannot
// succeed).  Only transient errors are retried, and only up to `max_attempts`.

use std::time::Duration;

use tracing::{debug, info, warn};

use edgeprint_core::ServiceConfig;
use edgeprint_core::error::EdgePrintError;
use edgeprint_core::types::ErrorClass;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum dispatch attempts per job, the first one included.
    pub max_attempts: u32,
    /// Base delay between retries (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue and retry after this delay.
    RetryAfter(Duration),
    /// Do not retry: the error is permanent.
    GiveUp(ErrorClass),
    /// Transient error, but every attempt has been used.
    Exhausted,
}

/// Classify an `EdgePrintError` for retry decisions.
pub fn classify_error(err: &EdgePrintError) -> ErrorClass {
    match err {
        EdgePrintError::BackendUnavailable(_) => ErrorClass::Transient,
        EdgePrintError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },

        // A dispatch timeout may already have printed; resubmitting risks a
        // duplicate page.
        EdgePrintError::DispatchTimeout { .. } => ErrorClass::Permanent,
        EdgePrintError::UnsupportedOption(_)
        | EdgePrintError::PayloadRejected(_)
        | EdgePrintError::PayloadStorage(_)
        | EdgePrintError::UnsupportedPayloadKind(_)
        | EdgePrintError::PayloadTooLarge { .. }
        | EdgePrintError::PrinterNotFound(_)
        | EdgePrintError::JobNotFound(_)
        | EdgePrintError::RemoteJobNotFound { .. }
        | EdgePrintError::AlreadyTerminal(_)
        | EdgePrintError::InvalidTransition { .. }
        | EdgePrintError::Database(_)
        | EdgePrintError::Serialization(_)
        | EdgePrintError::Discovery(_)
        | EdgePrintError::Config(_)
        | EdgePrintError::ControlServer(_)
        | EdgePrintError::ShuttingDown => ErrorClass::Permanent,
    }
}

/// Decide whether to retry after the `attempts`-th dispatch attempt failed.
pub fn should_retry(err: &EdgePrintError, attempts: u32, policy: &RetryPolicy) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!(error = %err, "permanent error, not retrying");
            RetryDecision::GiveUp(ErrorClass::Permanent)
        }
        ErrorClass::Transient if attempts >= policy.max_attempts => {
            warn!(attempts, max = policy.max_attempts, "retry limit exhausted");
            RetryDecision::Exhausted
        }
        ErrorClass::Transient => {
            let delay = compute_delay(attempts.saturating_sub(1), policy);
            debug!(attempts, delay_ms = delay.as_millis() as u64, "scheduling retry");
            RetryDecision::RetryAfter(delay)
        }
    }
}

/// delay = min(base * 2^retry + jitter, max_delay), jitter in [0, base).
pub fn compute_delay(retry: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << retry.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, retry));
    Duration::from_millis(total_ms.min(policy.max_delay.as_millis() as u64))
}

/// Deterministic spread in [0, base): attempt number times a large odd constant.
fn jitter(base_ms: u64, retry: u32) -> u64 {
    let hash = u64::from(retry).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}
