// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print backend adapter.
//
// The dispatcher talks to the host print subsystem only through
// `PrintBackend`: submit a spooled payload, poll the returned ticket, cancel
// it, list installed queues, and manage a printer's own queue (list, pause,
// resume, clear, remove one job).  `HostBackend` picks one implementation at
// start-up and is handed to the dispatcher; there is no runtime switching.

pub mod cups;
pub mod ipp;
pub mod spooler;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use edgeprint_core::config::BackendKind;
use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{
    BackendTicket, JobId, MetaValue, PayloadKind, PrintJob, PrintOptions, Printer,
    PrinterCapabilities, PrinterMetadata, PrinterState,
};

pub use self::cups::CupsBackend;
pub use self::ipp::IppBackend;
pub use self::spooler::SpoolerBackend;

use crate::capabilities::capabilities_to_metadata;

/// Everything a backend needs to print one job.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub job_id: JobId,
    /// Target queue name (CUPS / spooler) or printer identity.
    pub printer: String,
    /// Direct IPP URI from the capability snapshot, if any.
    pub uri: Option<String>,
    pub payload_path: PathBuf,
    pub kind: PayloadKind,
    pub document_name: String,
    pub options: PrintOptions,
}

impl DispatchRequest {
    pub fn for_job(job: &PrintJob) -> Self {
        Self {
            job_id: job.id,
            printer: job.printer.clone(),
            uri: job.snapshot.uri.clone(),
            payload_path: job.payload.path.clone(),
            kind: job.payload_kind,
            document_name: job.document_name.clone(),
            options: job.options.clone(),
        }
    }
}

/// A printer addressed by a queue-management call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterTarget {
    /// Queue name (CUPS / spooler) or printer identity.
    pub name: String,
    pub uri: Option<String>,
}

impl PrinterTarget {
    pub fn of(printer: &Printer) -> Self {
        Self {
            name: printer.identity.clone(),
            uri: printer.uri.clone(),
        }
    }
}

/// A job held in a printer's own queue, whoever submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteJob {
    /// Subsystem job id, as accepted by `remove_job`.
    pub id: String,
    pub owner: Option<String>,
    pub document: Option<String>,
    pub size_bytes: Option<u64>,
    /// The printer is processing it now.
    pub printing: bool,
}

/// Remote status of a submitted job.
#[derive(Debug)]
pub enum PollStatus {
    /// Accepted and waiting in the subsystem's own queue.
    Pending,
    Printing,
    Completed,
    Failed(EdgePrintError),
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The subsystem is already printing the job, or refused.
    NotCancellable,
    /// Recorded while the job was being submitted; applied to the ticket
    /// once the submission returns.  Backends never report this.
    Requested,
}

/// A queue installed in the host print subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPrinter {
    pub name: String,
    pub display_name: String,
    pub state: PrinterState,
    pub location: Option<String>,
    pub make_and_model: Option<String>,
    pub uri: Option<String>,
    pub capabilities: PrinterCapabilities,
}

impl LocalPrinter {
    /// Metadata announcement for the registry.
    pub fn to_metadata(&self) -> PrinterMetadata {
        let mut meta = capabilities_to_metadata(&self.capabilities);
        meta.insert("display-name".into(), MetaValue::from(self.display_name.as_str()));
        meta.insert("source".into(), MetaValue::from("local"));
        meta.insert("state".into(), MetaValue::from(state_hint(self.state)));
        for (key, value) in [
            ("location", &self.location),
            ("make-and-model", &self.make_and_model),
            ("uri", &self.uri),
        ] {
            if let Some(v) = value {
                meta.insert(key.into(), MetaValue::from(v.as_str()));
            }
        }
        meta
    }
}

fn state_hint(state: PrinterState) -> &'static str {
    match state {
        PrinterState::Online => "idle",
        PrinterState::Busy => "printing",
        PrinterState::Offline => "offline",
        PrinterState::Error => "error",
    }
}

/// Capability set of a host print subsystem.
///
/// Every call is bounded: one subprocess or one request with a timeout.
pub trait PrintBackend: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Hand a payload to the subsystem.  Errors: `BackendUnavailable`
    /// (retryable), `UnsupportedOption`, `PayloadRejected`.
    fn submit(&self, request: &DispatchRequest) -> impl Future<Output = Result<BackendTicket>> + Send;

    fn poll(&self, ticket: &BackendTicket) -> impl Future<Output = Result<PollStatus>> + Send;

    fn cancel(&self, ticket: &BackendTicket) -> impl Future<Output = Result<CancelOutcome>> + Send;

    /// Queues installed locally.
    fn list_printers(&self) -> impl Future<Output = Result<Vec<LocalPrinter>>> + Send;

    /// Jobs the subsystem holds for `target`, in print order.
    fn queue(&self, target: &PrinterTarget) -> impl Future<Output = Result<Vec<RemoteJob>>> + Send;

    /// Resume (`true`) or pause (`false`) a printer.  A paused printer keeps
    /// accepting jobs but prints none.
    fn set_enabled(&self, target: &PrinterTarget, enabled: bool) -> impl Future<Output = Result<()>> + Send;

    /// Remove every job from the printer's queue.
    fn clear_queue(&self, target: &PrinterTarget) -> impl Future<Output = Result<()>> + Send;

    /// Remove one job from the printer's queue.  Errors with
    /// `RemoteJobNotFound` if the subsystem no longer holds it.
    fn remove_job(&self, target: &PrinterTarget, remote_id: &str) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// Host selection
// ---------------------------------------------------------------------------

/// The backend chosen for this host.
pub enum HostBackend {
    Cups(CupsBackend),
    Spooler(SpoolerBackend),
    Ipp(IppBackend),
}

impl HostBackend {
    /// Resolve `Auto` from the target platform and build the backend.
    pub fn select(kind: BackendKind) -> Self {
        let resolved = match kind {
            BackendKind::Auto if cfg!(windows) => BackendKind::Spooler,
            BackendKind::Auto => BackendKind::Cups,
            other => other,
        };
        let backend = match resolved {
            BackendKind::Spooler => Self::Spooler(SpoolerBackend::new()),
            BackendKind::Ipp => Self::Ipp(IppBackend::new()),
            _ => Self::Cups(CupsBackend::new()),
        };
        info!(backend = backend.name(), "print backend selected");
        backend
    }
}

impl PrintBackend for HostBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Cups(b) => b.name(),
            Self::Spooler(b) => b.name(),
            Self::Ipp(b) => b.name(),
        }
    }

    async fn submit(&self, request: &DispatchRequest) -> Result<BackendTicket> {
        match self {
            Self::Cups(b) => b.submit(request).await,
            Self::Spooler(b) => b.submit(request).await,
            Self::Ipp(b) => b.submit(request).await,
        }
    }

    async fn poll(&self, ticket: &BackendTicket) -> Result<PollStatus> {
        match self {
            Self::Cups(b) => b.poll(ticket).await,
            Self::Spooler(b) => b.poll(ticket).await,
            Self::Ipp(b) => b.poll(ticket).await,
        }
    }

    async fn cancel(&self, ticket: &BackendTicket) -> Result<CancelOutcome> {
        match self {
            Self::Cups(b) => b.cancel(ticket).await,
            Self::Spooler(b) => b.cancel(ticket).await,
            Self::Ipp(b) => b.cancel(ticket).await,
        }
    }

    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        match self {
            Self::Cups(b) => b.list_printers().await,
            Self::Spooler(b) => b.list_printers().await,
            Self::Ipp(b) => b.list_printers().await,
        }
    }

    async fn queue(&self, target: &PrinterTarget) -> Result<Vec<RemoteJob>> {
        match self {
            Self::Cups(b) => b.queue(target).await,
            Self::Spooler(b) => b.queue(target).await,
            Self::Ipp(b) => b.queue(target).await,
        }
    }

    async fn set_enabled(&self, target: &PrinterTarget, enabled: bool) -> Result<()> {
        match self {
            Self::Cups(b) => b.set_enabled(target, enabled).await,
            Self::Spooler(b) => b.set_enabled(target, enabled).await,
            Self::Ipp(b) => b.set_enabled(target, enabled).await,
        }
    }

    async fn clear_queue(&self, target: &PrinterTarget) -> Result<()> {
        match self {
            Self::Cups(b) => b.clear_queue(target).await,
            Self::Spooler(b) => b.clear_queue(target).await,
            Self::Ipp(b) => b.clear_queue(target).await,
        }
    }

    async fn remove_job(&self, target: &PrinterTarget, remote_id: &str) -> Result<()> {
        match self {
            Self::Cups(b) => b.remove_job(target, remote_id).await,
            Self::Spooler(b) => b.remove_job(target, remote_id).await,
            Self::Ipp(b) => b.remove_job(target, remote_id).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess helper
// ---------------------------------------------------------------------------

/// Default bound on a single print-subsystem command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a print-subsystem tool with `LC_ALL=C` and a timeout.
///
/// A missing binary, a spawn failure or a timeout is `BackendUnavailable`;
/// a non-zero exit is returned to the caller for classification.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!(program, ?args, "running print subsystem command");
    let child = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EdgePrintError::BackendUnavailable(format!(
                "{program} is not installed"
            )));
        }
        Ok(Err(e)) => {
            return Err(EdgePrintError::BackendUnavailable(format!("{program}: {e}")));
        }
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(EdgePrintError::BackendUnavailable(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use edgeprint_core::types::MetadataExt;

    #[test]
    fn auto_selection_matches_platform() {
        let backend = HostBackend::select(BackendKind::Auto);
        if cfg!(windows) {
            assert_eq!(backend.name(), "spooler");
        } else {
            assert_eq!(backend.name(), "cups");
        }
        assert_eq!(HostBackend::select(BackendKind::Ipp).name(), "ipp");
    }

    #[test]
    fn local_printer_metadata_feeds_the_registry() {
        let printer = LocalPrinter {
            name: "Office_Laser".into(),
            display_name: "Office Laser".into(),
            state: PrinterState::Offline,
            location: Some("2nd floor".into()),
            make_and_model: None,
            uri: None,
            capabilities: PrinterCapabilities {
                duplex: Some(true),
                ..PrinterCapabilities::default()
            },
        };
        let meta = printer.to_metadata();
        assert_eq!(meta.text("source").as_deref(), Some("local"));
        assert_eq!(PrinterState::from_hint(&meta.text("state").unwrap_or_default()), PrinterState::Offline);
        assert_eq!(meta.text("location").as_deref(), Some("2nd floor"));
        assert_eq!(meta.flag("duplex"), Some(true));
        assert!(meta.text("make-and-model").is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let result = run_command("edgeprint-no-such-tool", &[], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(EdgePrintError::BackendUnavailable(_))));
    }
}
