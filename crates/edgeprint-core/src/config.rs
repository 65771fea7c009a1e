// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service configuration.
//
// Retry limits, staleness thresholds and timeouts are product decisions, so
// they all live here rather than as constants in the engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EdgePrintError, Result};

/// Which host print subsystem the dispatcher talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Detect from the host platform at start-up.
    Auto,
    /// CUPS command-line tools (`lp`, `lpq`, `cancel`, `lpstat`).
    Cups,
    /// Windows print spooler (via PowerShell).
    Spooler,
    /// Direct IPP to each printer's advertised URI.
    Ipp,
}

/// Persistent service settings.
///
/// Missing fields in the config file fall back to [`ServiceConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Print subsystem backend.
    pub backend: BackendKind,
    /// Maximum dispatch attempts per job (the first attempt counts).
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay_ms: u64,
    /// Upper bound for retry backoff.
    pub retry_max_delay_ms: u64,
    /// Dispatch loop period.
    pub dispatch_tick_ms: u64,
    /// Jobs handed to the print subsystem at the same time (1 = sequential).
    pub max_in_flight: usize,
    /// A dispatched job not finished after this long is failed.
    pub dispatch_timeout_secs: u64,
    /// Printers silent for longer than this are removed by the sweep.
    pub stale_after_secs: u64,
    /// Registry sweep period.
    pub sweep_interval_secs: u64,
    /// Browse the LAN for IPP printers over mDNS.
    pub mdns_enabled: bool,
    /// Period of the local print-queue scan (0 disables it).
    pub local_scan_interval_secs: u64,
    /// Spooled payloads older than this are orphans from a previous run.
    pub max_job_lifetime_secs: u64,
    /// How long a graceful stop waits for in-flight jobs.
    pub shutdown_grace_secs: u64,
    /// Terminal jobs kept in memory for status queries.
    pub retain_terminal_jobs: usize,
    /// Largest accepted document.
    pub max_payload_bytes: u64,
    /// Spool directory; defaults to `<data dir>/spool`.
    pub spool_dir: Option<PathBuf>,
    /// Persist terminal job records to SQLite.
    pub history_enabled: bool,
    /// Listen address of the HTTP control surface.
    pub control_bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            max_attempts: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            dispatch_tick_ms: 500,
            max_in_flight: 1,
            dispatch_timeout_secs: 300,
            stale_after_secs: 300,
            sweep_interval_secs: 30,
            mdns_enabled: true,
            local_scan_interval_secs: 15,
            max_job_lifetime_secs: 3_600,
            shutdown_grace_secs: 10,
            retain_terminal_jobs: 500,
            max_payload_bytes: 64 * 1024 * 1024,
            spool_dir: None,
            history_enabled: true,
            control_bind: "127.0.0.1:7860".into(),
        }
    }
}

impl ServiceConfig {
    /// Load the config from a JSON file, or defaults if the file is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EdgePrintError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(EdgePrintError::Config("max_in_flight must be at least 1".into()));
        }
        if self.dispatch_tick_ms == 0 {
            return Err(EdgePrintError::Config("dispatch_tick_ms must be positive".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(EdgePrintError::Config(
                "retry_max_delay_ms must not be below retry_base_delay_ms".into(),
            ));
        }
        if self.control_bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(EdgePrintError::Config(format!(
                "control_bind '{}' is not a socket address",
                self.control_bind
            )));
        }
        Ok(())
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_job_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_job_lifetime_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backend, BackendKind::Auto);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "max_attempts": 5, "backend": "ipp" }"#).expect("write");

        let config = ServiceConfig::load(&path).expect("load");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backend, BackendKind::Ipp);
        assert_eq!(config.stale_after_secs, 300);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServiceConfig::load(dir.path().join("absent.json")).expect("load");
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn zero_attempts_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "max_attempts": 0 }"#).expect("write");
        assert!(matches!(ServiceConfig::load(&path), Err(EdgePrintError::Config(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = ServiceConfig::default();
        config.control_bind = "0.0.0.0:9000".into();
        config.save(&path).expect("save");
        assert_eq!(ServiceConfig::load(&path).expect("load"), config);
    }
}
