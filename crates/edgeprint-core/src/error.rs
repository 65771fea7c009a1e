// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Edgeprint.

use thiserror::Error;

use crate::types::JobId;

/// Top-level error type for all Edgeprint operations.
#[derive(Debug, Error)]
pub enum EdgePrintError {
    // -- Validation (surfaced synchronously at submit time) --
    #[error("printer not found: {0}")]
    PrinterNotFound(String),

    #[error("unsupported payload kind: {0}")]
    UnsupportedPayloadKind(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("job {id} is not in the queue of {printer}")]
    RemoteJobNotFound { printer: String, id: String },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: &'static str,
        to: &'static str,
    },

    // -- Backend (print subsystem) --
    #[error("print subsystem unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unsupported print option: {0}")]
    UnsupportedOption(String),

    #[error("document rejected: {0}")]
    PayloadRejected(String),

    #[error("print subsystem did not finish the job within {secs}s")]
    DispatchTimeout { secs: u64 },

    // -- Resources --
    #[error("payload storage error: {0}")]
    PayloadStorage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- Service infrastructure --
    #[error("printer discovery failed: {0}")]
    Discovery(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control server error: {0}")]
    ControlServer(String),

    #[error("service is shutting down")]
    ShuttingDown,
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EdgePrintError>;
