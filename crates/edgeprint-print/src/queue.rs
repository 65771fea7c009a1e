// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory print job queue.
//
// The queue is the exclusive owner of job records and their spooled payloads.
// Queued jobs wait in a FIFO; the dispatcher takes the oldest job whose
// printer is reachable.  Every state change goes through `JobState`'s
// transition table, and a job's payload handle is dropped the moment the job
// becomes terminal.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{BackendTicket, ErrorClass, JobId, JobState, PrintJob, PrinterState};

use crate::payload::PayloadHandle;

/// What the dispatcher must do to honour a cancel request.
#[derive(Debug, Clone)]
pub enum CancelPlan {
    /// The job was still queued and is now `Cancelled`.
    Cancelled(PrintJob),
    /// The job is with the print subsystem; cancel it there.
    Remote(BackendTicket),
    /// The job is being submitted right now; the cancel is applied once the
    /// submission returns a ticket.
    Deferred,
}

/// A job currently handed to the print subsystem.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub id: JobId,
    pub printer: String,
    pub ticket: Option<BackendTicket>,
    pub dispatched_at: Instant,
}

#[derive(Debug)]
struct JobEntry {
    job: PrintJob,
    payload: Option<PayloadHandle>,
    /// Earliest time a requeued job may be dispatched again.
    not_before: Option<Instant>,
    dispatched_at: Option<Instant>,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    next_id: u64,
    jobs: HashMap<JobId, JobEntry>,
    fifo: VecDeque<JobId>,
    /// Terminal jobs in the order they finished, for pruning.
    finished: VecDeque<JobId>,
}

/// Thread-safe job queue.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(0)
    }
}

impl JobQueue {
    /// Create an empty queue whose first job id is `last_id + 1`.
    pub fn new(last_id: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_id: last_id + 1,
                ..QueueInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next job id.
    pub fn allocate_id(&self) -> JobId {
        let mut inner = self.lock();
        let id = JobId(inner.next_id);
        inner.next_id += 1;
        id
    }

    /// Add a freshly accepted job to the back of the FIFO.
    #[instrument(skip(self, job, payload), fields(job_id = %job.id, printer = %job.printer))]
    pub fn enqueue(&self, job: PrintJob, payload: PayloadHandle) -> Result<()> {
        if job.state != JobState::Queued {
            return Err(EdgePrintError::InvalidTransition {
                id: job.id,
                from: job.state.as_str(),
                to: JobState::Queued.as_str(),
            });
        }
        let id = job.id;
        let mut inner = self.lock();
        inner.jobs.insert(
            id,
            JobEntry {
                job,
                payload: Some(payload),
                not_before: None,
                dispatched_at: None,
                cancel_requested: false,
            },
        );
        inner.fifo.push_back(id);
        info!(queued = inner.fifo.len(), "job queued");
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<PrintJob> {
        self.lock()
            .jobs
            .get(&id)
            .map(|e| e.job.clone())
            .ok_or(EdgePrintError::JobNotFound(id))
    }

    /// All retained jobs, oldest first.
    pub fn list(&self) -> Vec<PrintJob> {
        let mut jobs: Vec<PrintJob> = self.lock().jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Work out how to cancel a job; queued jobs are cancelled on the spot.
    pub fn cancel(&self, id: JobId) -> Result<CancelPlan> {
        let mut inner = self.lock();
        let entry = inner.jobs.get_mut(&id).ok_or(EdgePrintError::JobNotFound(id))?;

        match entry.job.state {
            JobState::Queued => {
                let job = finish(entry, JobState::Cancelled, None, None)?;
                inner.fifo.retain(|queued| *queued != id);
                inner.finished.push_back(id);
                info!(job_id = %id, "queued job cancelled");
                Ok(CancelPlan::Cancelled(job))
            }
            JobState::Dispatching => match &entry.job.ticket {
                Some(ticket) => Ok(CancelPlan::Remote(ticket.clone())),
                None => {
                    entry.cancel_requested = true;
                    debug!(job_id = %id, "cancel deferred until submission returns");
                    Ok(CancelPlan::Deferred)
                }
            },
            _ => Err(EdgePrintError::AlreadyTerminal(id)),
        }
    }

    /// Take the oldest queued job whose printer is reachable and whose retry
    /// backoff has elapsed, and mark it `Dispatching`.
    pub fn next_dispatchable(
        &self,
        reachability: &HashMap<String, PrinterState>,
        now: Instant,
    ) -> Option<PrintJob> {
        let mut inner = self.lock();
        let QueueInner { jobs, fifo, .. } = &mut *inner;

        let position = fifo.iter().position(|id| {
            jobs.get(id).is_some_and(|entry| {
                let reachable = reachability
                    .get(&entry.job.printer)
                    .is_some_and(PrinterState::is_reachable);
                let ready = entry.not_before.is_none_or(|t| t <= now);
                reachable && ready
            })
        })?;
        let id = fifo.remove(position)?;
        let entry = jobs.get_mut(&id)?;

        entry.job.state = JobState::Dispatching;
        entry.job.attempts += 1;
        entry.job.updated_at = Utc::now();
        entry.not_before = None;
        entry.dispatched_at = Some(now);
        debug!(job_id = %id, attempt = entry.job.attempts, "job taken for dispatch");
        Some(entry.job.clone())
    }

    /// Record the backend ticket.  Returns `true` when a cancel arrived while
    /// the job was being submitted.
    pub fn mark_submitted(&self, id: JobId, ticket: BackendTicket) -> Result<bool> {
        let mut inner = self.lock();
        let entry = inner.jobs.get_mut(&id).ok_or(EdgePrintError::JobNotFound(id))?;
        expect_state(&entry.job, JobState::Dispatching)?;
        info!(job_id = %id, ticket = %ticket, "job submitted to print subsystem");
        entry.job.ticket = Some(ticket);
        entry.job.updated_at = Utc::now();
        Ok(entry.cancel_requested)
    }

    pub fn complete(&self, id: JobId) -> Result<PrintJob> {
        self.terminate(id, JobState::Completed, None, None)
    }

    pub fn fail(&self, id: JobId, error: &EdgePrintError, class: ErrorClass) -> Result<PrintJob> {
        self.terminate(id, JobState::Failed, Some(error.to_string()), Some(class))
    }

    pub fn mark_cancelled(&self, id: JobId) -> Result<PrintJob> {
        self.terminate(id, JobState::Cancelled, None, None)
    }

    fn terminate(
        &self,
        id: JobId,
        state: JobState,
        error: Option<String>,
        class: Option<ErrorClass>,
    ) -> Result<PrintJob> {
        let mut inner = self.lock();
        let entry = inner.jobs.get_mut(&id).ok_or(EdgePrintError::JobNotFound(id))?;
        let job = finish(entry, state, error, class)?;
        inner.fifo.retain(|queued| *queued != id);
        inner.finished.push_back(id);
        info!(job_id = %id, state = state.as_str(), attempts = job.attempts, "job finished");
        Ok(job)
    }

    /// Put a dispatching job back at the end of the FIFO after a transient
    /// failure.  It becomes eligible again after `delay`.
    ///
    /// A job cancelled while it was being submitted is not requeued: it is
    /// finished as `Cancelled` and returned.
    pub fn requeue(&self, id: JobId, error: &EdgePrintError, delay: Duration) -> Result<Option<PrintJob>> {
        let mut inner = self.lock();
        let entry = inner.jobs.get_mut(&id).ok_or(EdgePrintError::JobNotFound(id))?;
        check_transition(&entry.job, JobState::Queued)?;

        if entry.cancel_requested {
            let job = finish(entry, JobState::Cancelled, Some(error.to_string()), Some(ErrorClass::Transient))?;
            inner.finished.push_back(id);
            info!(job_id = %id, "cancel requested during submission; not requeued");
            return Ok(Some(job));
        }

        entry.job.state = JobState::Queued;
        entry.job.last_error = Some(error.to_string());
        entry.job.error_class = Some(ErrorClass::Transient);
        entry.job.ticket = None;
        entry.job.updated_at = Utc::now();
        entry.not_before = Some(Instant::now() + delay);
        entry.dispatched_at = None;
        inner.fifo.push_back(id);
        info!(job_id = %id, delay_ms = delay.as_millis() as u64, "job requeued");
        Ok(None)
    }

    /// Fail queued jobs that can no longer be dispatched: their printer has
    /// left the registry, or they have waited longer than `max_age`.
    pub fn expire_queued(
        &self,
        reachability: &HashMap<String, PrinterState>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<PrintJob> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.lock();
        let QueueInner { jobs, fifo, finished, .. } = &mut *inner;

        let mut expired = Vec::new();
        fifo.retain(|id| {
            let Some(entry) = jobs.get_mut(id) else {
                return false;
            };
            let error = if !reachability.contains_key(&entry.job.printer) {
                EdgePrintError::PrinterNotFound(entry.job.printer.clone())
            } else if now.signed_duration_since(entry.job.submitted_at) > max_age {
                EdgePrintError::DispatchTimeout {
                    secs: max_age.num_seconds().max(0) as u64,
                }
            } else {
                return true;
            };
            match finish(entry, JobState::Failed, Some(error.to_string()), Some(ErrorClass::Permanent)) {
                Ok(job) => {
                    warn!(job_id = %id, printer = %job.printer, error = %error, "queued job expired");
                    finished.push_back(*id);
                    expired.push(job);
                    false
                }
                Err(_) => true,
            }
        });
        expired
    }

    /// Jobs currently with the print subsystem.
    pub fn in_flight(&self) -> Vec<InFlight> {
        let inner = self.lock();
        let mut flights: Vec<InFlight> = inner
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Dispatching)
            .filter_map(|e| {
                Some(InFlight {
                    id: e.job.id,
                    printer: e.job.printer.clone(),
                    ticket: e.job.ticket.clone(),
                    dispatched_at: e.dispatched_at?,
                })
            })
            .collect();
        flights.sort_by_key(|f| f.id);
        flights
    }

    /// Number of jobs waiting in the FIFO.
    pub fn queued_len(&self) -> usize {
        self.lock().fifo.len()
    }

    /// Drop the oldest terminal records beyond `retain`.
    pub fn prune_terminal(&self, retain: usize) -> usize {
        let mut inner = self.lock();
        let mut pruned = 0;
        while inner.finished.len() > retain {
            if let Some(id) = inner.finished.pop_front() {
                inner.jobs.remove(&id);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "terminal jobs pruned from memory");
        }
        pruned
    }
}

fn check_transition(job: &PrintJob, next: JobState) -> Result<()> {
    if job.state.can_transition_to(next) {
        return Ok(());
    }
    if job.state.is_terminal() {
        return Err(EdgePrintError::AlreadyTerminal(job.id));
    }
    Err(EdgePrintError::InvalidTransition {
        id: job.id,
        from: job.state.as_str(),
        to: next.as_str(),
    })
}

fn expect_state(job: &PrintJob, state: JobState) -> Result<()> {
    if job.state == state {
        return Ok(());
    }
    if job.state.is_terminal() {
        return Err(EdgePrintError::AlreadyTerminal(job.id));
    }
    Err(EdgePrintError::InvalidTransition {
        id: job.id,
        from: job.state.as_str(),
        to: state.as_str(),
    })
}

/// Move an entry to a terminal state and release its payload.
fn finish(
    entry: &mut JobEntry,
    state: JobState,
    error: Option<String>,
    class: Option<ErrorClass>,
) -> Result<PrintJob> {
    check_transition(&entry.job, state)?;
    let now = Utc::now();
    entry.job.state = state;
    if error.is_some() {
        entry.job.last_error = error;
        entry.job.error_class = class;
    }
    entry.job.updated_at = now;
    entry.job.finished_at = Some(now);
    entry.not_before = None;
    entry.dispatched_at = None;

    if let Some(payload) = entry.payload.take()
        && let Err(e) = payload.release()
    {
        warn!(job_id = %entry.job.id, error = %e, "failed to release payload");
    }
    Ok(entry.job.clone())
}
