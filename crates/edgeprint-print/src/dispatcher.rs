// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job dispatcher.
//
// Accepts submissions (validate, snapshot, spool, enqueue), and runs the
// dispatch loop: each tick polls the jobs already with the print subsystem,
// then hands eligible queued jobs to the backend up to `max_in_flight`.
// Transient failures are requeued with backoff; everything terminal releases
// its payload and is written to job history.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use edgeprint_core::ServiceConfig;
use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{
    BackendTicket, CapabilitySnapshot, ErrorClass, JobId, JobState, PayloadKind, PrintJob, PrintOptions,
    Printer,
};

use crate::backend::{
    CancelOutcome, DispatchRequest, PollStatus, PrintBackend, PrinterTarget, RemoteJob,
};
use crate::capabilities::validate_options;
use crate::document;
use crate::history::JobHistory;
use crate::payload::PayloadStore;
use crate::queue::{CancelPlan, InFlight, JobQueue};
use crate::registry::PrinterRegistry;
use crate::retry::{RetryDecision, RetryPolicy, should_retry};

/// A document submitted for printing.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Registry identity of the target printer.
    pub printer: String,
    pub document_name: String,
    /// Detected from the bytes (then the name's extension) when `None`.
    pub kind: Option<PayloadKind>,
    pub bytes: Vec<u8>,
    pub options: PrintOptions,
}

/// The dispatch engine; share it behind an `Arc`.
pub struct Dispatcher<B: PrintBackend> {
    config: ServiceConfig,
    registry: Arc<PrinterRegistry>,
    queue: JobQueue,
    payloads: PayloadStore,
    history: Option<Arc<JobHistory>>,
    backend: Arc<B>,
    retry: RetryPolicy,
    wake: Notify,
    accepting: AtomicBool,
}

impl<B: PrintBackend> Dispatcher<B> {
    /// Build a dispatcher.  Job ids continue after the highest id in history.
    pub fn new(
        config: ServiceConfig,
        registry: Arc<PrinterRegistry>,
        backend: Arc<B>,
        payloads: PayloadStore,
        history: Option<Arc<JobHistory>>,
    ) -> Result<Self> {
        let last_id = match &history {
            Some(h) => h.max_job_id()?,
            None => 0,
        };
        info!(backend = backend.name(), next_job = last_id + 1, "dispatcher ready");
        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            config,
            registry,
            queue: JobQueue::new(last_id),
            payloads,
            history,
            backend,
            wake: Notify::new(),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &PrinterRegistry {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Submission and queries
    // -----------------------------------------------------------------------

    /// Validate and enqueue a document.  Nothing is recorded on failure.
    #[instrument(skip(self, request), fields(printer = %request.printer, size = request.bytes.len()))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        if !self.is_accepting() {
            return Err(EdgePrintError::ShuttingDown);
        }

        let SubmitRequest {
            printer,
            document_name,
            kind,
            bytes,
            options,
        } = request;

        let kind = resolve_kind(kind, &bytes, &document_name)?;
        let size = bytes.len() as u64;
        if size > self.config.max_payload_bytes {
            return Err(EdgePrintError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }
        if size == 0 {
            return Err(EdgePrintError::PayloadRejected("empty document".into()));
        }

        let printer: Printer = self.registry.get(&printer)?;
        let snapshot = CapabilitySnapshot::of(&printer);
        validate_options(&options, &snapshot)?;

        let store = self.payloads.clone();
        let handle = tokio::task::spawn_blocking(move || store.store(kind, &bytes))
            .await
            .map_err(|e| EdgePrintError::PayloadStorage(format!("spool task: {e}")))??;

        let id = self.queue.allocate_id();
        let document_name = if document_name.trim().is_empty() {
            format!("job-{id}.{}", kind.spool_extension())
        } else {
            document_name
        };
        let job = PrintJob::new(
            id,
            document_name,
            kind,
            handle.reference().clone(),
            options,
            snapshot,
        );
        self.queue.enqueue(job, handle)?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a job.  Queued jobs are cancelled at once; jobs already with
    /// the print subsystem are cancelled there if it still allows it.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        match self.queue.cancel(id)? {
            CancelPlan::Cancelled(job) => {
                self.finished(job).await;
                Ok(CancelOutcome::Cancelled)
            }
            CancelPlan::Deferred => Ok(CancelOutcome::Requested),
            CancelPlan::Remote(ticket) => match self.backend.cancel(&ticket).await? {
                CancelOutcome::Cancelled => match self.queue.mark_cancelled(id) {
                    Ok(job) => {
                        self.finished(job).await;
                        Ok(CancelOutcome::Cancelled)
                    }
                    // Finished by a poll while the cancel was in flight.
                    Err(EdgePrintError::AlreadyTerminal(_)) => Ok(CancelOutcome::NotCancellable),
                    Err(e) => Err(e),
                },
                other => {
                    info!(outcome = ?other, "print subsystem kept the job");
                    Ok(other)
                }
            },
        }
    }

    /// Current record of a job; pruned jobs are read from history.
    pub async fn status(&self, id: JobId) -> Result<PrintJob> {
        match self.queue.get(id) {
            Err(EdgePrintError::JobNotFound(_)) => {
                let Some(history) = self.history.clone() else {
                    return Err(EdgePrintError::JobNotFound(id));
                };
                tokio::task::spawn_blocking(move || history.get(id))
                    .await
                    .map_err(|e| EdgePrintError::Database(format!("history task: {e}")))??
                    .ok_or(EdgePrintError::JobNotFound(id))
            }
            other => other,
        }
    }

    /// Jobs held in memory, oldest first.
    pub fn jobs(&self) -> Vec<PrintJob> {
        self.queue.list()
    }

    pub fn list_printers(&self) -> Vec<Printer> {
        self.registry.list()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.queued_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.queue.in_flight().len()
    }

    // -----------------------------------------------------------------------
    // Printer queue management
    // -----------------------------------------------------------------------

    /// Jobs the print subsystem holds for a registered printer, including
    /// jobs submitted by other clients.
    pub async fn printer_queue(&self, printer: &str) -> Result<Vec<RemoteJob>> {
        let target = self.target(printer)?;
        self.backend.queue(&target).await
    }

    /// Resume or pause a registered printer in the print subsystem.
    #[instrument(skip(self))]
    pub async fn set_printer_enabled(&self, printer: &str, enabled: bool) -> Result<()> {
        let target = self.target(printer)?;
        self.backend.set_enabled(&target, enabled).await?;
        info!("printer {}", if enabled { "resumed" } else { "paused" });
        Ok(())
    }

    /// Empty a printer's queue.  Jobs of ours that were waiting there are
    /// finished as `Cancelled`.
    #[instrument(skip(self))]
    pub async fn clear_printer_queue(&self, printer: &str) -> Result<()> {
        let target = self.target(printer)?;
        self.backend.clear_queue(&target).await?;
        self.cancel_dispatched(printer, |_| true).await;
        Ok(())
    }

    /// Remove one job from a printer's queue by its subsystem id.  If it is
    /// one of ours, that job is finished as `Cancelled`.
    #[instrument(skip(self))]
    pub async fn remove_printer_job(&self, printer: &str, remote_id: &str) -> Result<()> {
        let target = self.target(printer)?;
        self.backend.remove_job(&target, remote_id).await?;
        self.cancel_dispatched(printer, |ticket| ticket_names(ticket, remote_id))
            .await;
        Ok(())
    }

    fn target(&self, printer: &str) -> Result<PrinterTarget> {
        Ok(PrinterTarget::of(&self.registry.get(printer)?))
    }

    async fn cancel_dispatched(&self, printer: &str, matches: impl Fn(&BackendTicket) -> bool) {
        for flight in self.queue.in_flight() {
            let Some(ticket) = &flight.ticket else { continue };
            if flight.printer != printer || !matches(ticket) {
                continue;
            }
            match self.queue.mark_cancelled(flight.id) {
                Ok(job) => self.finished(job).await,
                Err(e) => debug!(job_id = %flight.id, error = %e, "removal raced with another transition"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    /// One dispatch cycle.  Per-job errors are logged, never returned.
    pub async fn tick(&self) {
        self.poll_in_flight().await;
        if !self.is_accepting() {
            return;
        }

        let reachability = self.registry.reachability();
        for job in self
            .queue
            .expire_queued(&reachability, self.config.max_job_lifetime(), Utc::now())
        {
            self.finished(job).await;
        }

        // One attempt per free slot, so a requeued job waits for the next tick.
        let free = self.config.max_in_flight.saturating_sub(self.in_flight_len());
        for _ in 0..free {
            // Registry snapshot first: never read it with the queue locked.
            let reachability = self.registry.reachability();
            let Some(job) = self.queue.next_dispatchable(&reachability, Instant::now()) else {
                break;
            };
            self.dispatch(job).await;
        }
    }

    async fn poll_in_flight(&self) {
        let timeout = self.config.dispatch_timeout();
        for flight in self.queue.in_flight() {
            let InFlight {
                id,
                ticket,
                dispatched_at,
                ..
            } = flight;
            // Still being submitted.
            let Some(ticket) = ticket else { continue };

            let timed_out = dispatched_at.elapsed() >= timeout;
            match self.backend.poll(&ticket).await {
                Ok(PollStatus::Completed) => match self.queue.complete(id) {
                    Ok(job) => self.finished(job).await,
                    Err(e) => debug!(job_id = %id, error = %e, "completion raced with cancel"),
                },
                Ok(PollStatus::Failed(err)) => self.handle_failure(id, err).await,
                Ok(status) if timed_out => {
                    warn!(job_id = %id, ticket = %ticket, status = ?status, "dispatch timed out");
                    self.time_out(id).await;
                }
                Ok(status) => debug!(job_id = %id, status = ?status, "job still with print subsystem"),
                Err(e) if timed_out => {
                    warn!(job_id = %id, error = %e, "dispatch timed out while the backend was unreachable");
                    self.time_out(id).await;
                }
                Err(e) => warn!(job_id = %id, error = %e, "poll failed, retrying next tick"),
            }
        }
    }

    async fn time_out(&self, id: JobId) {
        let err = EdgePrintError::DispatchTimeout {
            secs: self.config.dispatch_timeout_secs,
        };
        match self.queue.fail(id, &err, ErrorClass::Permanent) {
            Ok(job) => self.finished(job).await,
            Err(e) => debug!(job_id = %id, error = %e, "timeout raced with another transition"),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, printer = %job.printer, attempt = job.attempts))]
    async fn dispatch(&self, job: PrintJob) {
        let store = self.payloads.clone();
        let reference = job.payload.clone();
        let kind = job.payload_kind;
        let checked = tokio::task::spawn_blocking(move || {
            store.verify(&reference)?;
            document::inspect(kind, &reference.path)
        })
        .await
        .map_err(|e| EdgePrintError::PayloadStorage(format!("inspect task: {e}")))
        .and_then(|r| r);

        if let Err(e) = checked {
            self.handle_failure(job.id, e).await;
            return;
        }

        let request = DispatchRequest::for_job(&job);
        let ticket = match self.backend.submit(&request).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.handle_failure(job.id, e).await;
                return;
            }
        };

        match self.queue.mark_submitted(job.id, ticket.clone()) {
            Ok(false) => {}
            Ok(true) => self.apply_deferred_cancel(job.id, &ticket).await,
            Err(e) => error!(error = %e, "could not record backend ticket"),
        }
    }

    async fn apply_deferred_cancel(&self, id: JobId, ticket: &BackendTicket) {
        match self.backend.cancel(ticket).await {
            Ok(CancelOutcome::Cancelled) => {
                if let Ok(job) = self.queue.mark_cancelled(id) {
                    self.finished(job).await;
                }
            }
            Ok(outcome) => info!(job_id = %id, ?outcome, "deferred cancel not applied"),
            Err(e) => warn!(job_id = %id, error = %e, "deferred cancel failed"),
        }
    }

    /// Retry or fail a job after a dispatch error.
    async fn handle_failure(&self, id: JobId, err: EdgePrintError) {
        let attempts = match self.queue.get(id) {
            Ok(job) => job.attempts,
            Err(e) => {
                warn!(job_id = %id, error = %e, "failed job vanished");
                return;
            }
        };

        let outcome = match should_retry(&err, attempts, &self.retry) {
            RetryDecision::RetryAfter(delay) => {
                warn!(job_id = %id, attempts, error = %err, "transient dispatch failure");
                self.queue.requeue(id, &err, delay)
            }
            RetryDecision::GiveUp(class) => self.queue.fail(id, &err, class).map(Some),
            RetryDecision::Exhausted => self.queue.fail(id, &err, ErrorClass::Transient).map(Some),
        };

        match outcome {
            Ok(Some(job)) => {
                if job.state == JobState::Failed {
                    warn!(job_id = %id, attempts, error = %err, "job failed");
                }
                self.finished(job).await;
            }
            Ok(None) => {}
            Err(e) => debug!(job_id = %id, error = %e, "failure raced with another transition"),
        }
    }

    /// Bookkeeping for a job that just became terminal.
    async fn finished(&self, job: PrintJob) {
        if let Some(history) = self.history.clone() {
            let id = job.id;
            let written = tokio::task::spawn_blocking(move || history.record(&job)).await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %id, error = %e, "failed to record job history"),
                Err(e) => warn!(job_id = %id, error = %e, "history task failed"),
            }
        }
        self.queue.prune_terminal(self.config.retain_terminal_jobs);
    }

    /// Tick on the configured interval or whenever a job is submitted, until
    /// `shutdown` turns true; then drain.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.dispatch_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_ms = self.config.dispatch_tick_ms, "dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            self.tick().await;
        }

        self.drain().await;
    }

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    /// Stop taking new work and poll in-flight jobs until they finish or the
    /// shutdown grace period runs out.  Queued jobs are left queued.
    pub async fn drain(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.shutdown_grace();
        info!(
            in_flight = self.in_flight_len(),
            queued = self.queued_len(),
            "draining dispatcher"
        );

        loop {
            self.poll_in_flight().await;
            let remaining = self.in_flight_len();
            if remaining == 0 {
                info!("dispatcher drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "shutdown grace elapsed with jobs still printing");
                return;
            }
            tokio::time::sleep(self.config.dispatch_tick()).await;
        }
    }
}

/// Explicit kind, else magic bytes, else the document name's extension.
fn resolve_kind(explicit: Option<PayloadKind>, bytes: &[u8], name: &str) -> Result<PayloadKind> {
    explicit
        .or_else(|| PayloadKind::sniff(bytes))
        .or_else(|| {
            std::path::Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .and_then(PayloadKind::from_extension)
        })
        .ok_or_else(|| {
            EdgePrintError::UnsupportedPayloadKind(if name.is_empty() {
                "unrecognised document".into()
            } else {
                name.to_string()
            })
        })
}

/// Whether a ticket refers to the subsystem job `remote_id`.  CUPS tickets
/// carry `<queue>-<n>`, spooler tickets one id per copy.
fn ticket_names(ticket: &BackendTicket, remote_id: &str) -> bool {
    let remote_id = remote_id.trim();
    ticket.remote_id == remote_id
        || ticket.remote_id.split(',').any(|id| id.trim() == remote_id)
        || ticket
            .remote_id
            .rsplit_once('-')
            .is_some_and(|(_, n)| n == remote_id)
}
