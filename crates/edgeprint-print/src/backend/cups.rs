// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// CUPS backend driven through the command-line tools.
//
//   - `lp`        submit, ticket from "request id is <queue>-<n>"
//   - `lpq -P`    poll; the `active` rank is printing, absent means done
//   - `cancel`    cancel a job that has not started printing
//   - `lpstat`    list queues and their state
//   - `lpoptions` per-queue capabilities
//   - `cupsenable` / `cupsdisable` resume or pause a queue
//   - `lprm`      clear a queue or remove one job from it

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{BackendTicket, PrinterState};

use super::{
    COMMAND_TIMEOUT, CancelOutcome, DispatchRequest, LocalPrinter, PollStatus, PrintBackend,
    PrinterTarget, RemoteJob, run_command,
};
use crate::capabilities::parse_lpoptions;

/// CUPS command-line backend.
#[derive(Debug, Clone)]
pub struct CupsBackend {
    timeout: Duration,
}

impl Default for CupsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CupsBackend {
    pub fn new() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn lpq(&self, queue: &str) -> Result<Vec<QueueEntry>> {
        let output = run_command("lpq", &["-P", queue], self.timeout).await?;
        if !output.success {
            return Err(classify_lp_error(&output.stderr));
        }
        Ok(parse_lpq(&output.stdout))
    }

    /// Where a ticket sits in `lpq`, if anywhere.
    async fn queue_position(&self, ticket: &BackendTicket) -> Result<Option<QueueEntry>> {
        let job_number = remote_job_number(&ticket.remote_id);
        Ok(self
            .lpq(&ticket.target)
            .await?
            .into_iter()
            .find(|entry| Some(entry.job) == job_number))
    }

    /// Run a queue-management tool; a non-zero exit is classified.
    async fn manage(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = run_command(program, args, self.timeout).await?;
        if output.success {
            info!(program, ?args, "CUPS queue updated");
            Ok(())
        } else {
            warn!(program, stderr = %output.stderr, "CUPS refused the queue change");
            Err(classify_lp_error(&output.stderr))
        }
    }
}

impl PrintBackend for CupsBackend {
    fn name(&self) -> &'static str {
        "cups"
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id, printer = %request.printer))]
    async fn submit(&self, request: &DispatchRequest) -> Result<BackendTicket> {
        let args = lp_args(request);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command("lp", &arg_refs, self.timeout).await?;

        if !output.success {
            warn!(stderr = %output.stderr, code = ?output.code, "lp refused the job");
            return Err(classify_lp_error(&output.stderr));
        }

        let remote_id = parse_lp_request_id(&output.stdout).ok_or_else(|| {
            EdgePrintError::BackendUnavailable(format!(
                "lp gave no request id: {}",
                output.stdout.trim()
            ))
        })?;
        info!(remote_id = %remote_id, "job accepted by CUPS");
        Ok(BackendTicket {
            target: request.printer.clone(),
            remote_id,
        })
    }

    async fn poll(&self, ticket: &BackendTicket) -> Result<PollStatus> {
        let status = match self.queue_position(ticket).await? {
            Some(entry) if entry.active => PollStatus::Printing,
            Some(_) => PollStatus::Pending,
            None => PollStatus::Completed,
        };
        debug!(ticket = %ticket, status = ?status, "CUPS job polled");
        Ok(status)
    }

    #[instrument(skip(self), fields(ticket = %ticket))]
    async fn cancel(&self, ticket: &BackendTicket) -> Result<CancelOutcome> {
        match self.queue_position(ticket).await? {
            Some(entry) if entry.active => {
                info!("job already printing, not cancelling");
                return Ok(CancelOutcome::NotCancellable);
            }
            None => return Ok(CancelOutcome::NotCancellable),
            Some(_) => {}
        }

        let output = run_command("cancel", &[&ticket.remote_id], self.timeout).await?;
        if output.success {
            info!("job cancelled in CUPS");
            return Ok(CancelOutcome::Cancelled);
        }
        match classify_lp_error(&output.stderr) {
            err @ EdgePrintError::BackendUnavailable(_) if is_scheduler_down(&output.stderr) => Err(err),
            _ => {
                warn!(stderr = %output.stderr, "cancel refused");
                Ok(CancelOutcome::NotCancellable)
            }
        }
    }

    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        let accepting = run_command("lpstat", &["-a"], self.timeout).await?;
        if !accepting.success {
            // "lpstat: No destinations added." exits non-zero on some versions.
            if accepting.stderr.to_ascii_lowercase().contains("no destinations") {
                return Ok(Vec::new());
            }
            return Err(classify_lp_error(&accepting.stderr));
        }
        let queues = parse_lpstat_accepting(&accepting.stdout);

        let status = run_command("lpstat", &["-p"], self.timeout).await?;
        let states = if status.success {
            parse_lpstat_printers(&status.stdout)
        } else {
            Vec::new()
        };

        let mut printers = Vec::with_capacity(queues.len());
        for (name, is_accepting) in queues {
            let state = match states.iter().find(|(n, _)| *n == name) {
                _ if !is_accepting => PrinterState::Offline,
                Some((_, state)) => *state,
                None => PrinterState::Online,
            };
            let options = run_command("lpoptions", &["-p", &name, "-l"], self.timeout).await;
            let capabilities = match options {
                Ok(out) if out.success => parse_lpoptions(&name, &out.stdout),
                _ => parse_lpoptions(&name, ""),
            };
            printers.push(LocalPrinter {
                display_name: name.replace('_', " "),
                name,
                state,
                location: None,
                make_and_model: None,
                uri: None,
                capabilities,
            });
        }
        debug!(count = printers.len(), "CUPS queues listed");
        Ok(printers)
    }

    async fn queue(&self, target: &PrinterTarget) -> Result<Vec<RemoteJob>> {
        Ok(self
            .lpq(&target.name)
            .await?
            .into_iter()
            .map(QueueEntry::into_remote)
            .collect())
    }

    async fn set_enabled(&self, target: &PrinterTarget, enabled: bool) -> Result<()> {
        if enabled {
            self.manage("cupsenable", &[&target.name]).await
        } else {
            self.manage("cupsdisable", &["-r", "paused from edgeprint", &target.name])
                .await
        }
    }

    async fn clear_queue(&self, target: &PrinterTarget) -> Result<()> {
        self.manage("lprm", &["-P", &target.name, "-"]).await
    }

    async fn remove_job(&self, target: &PrinterTarget, remote_id: &str) -> Result<()> {
        let job = remote_id
            .parse::<u32>()
            .ok()
            .or_else(|| remote_job_number(remote_id))
            .ok_or_else(|| EdgePrintError::RemoteJobNotFound {
                printer: target.name.clone(),
                id: remote_id.to_string(),
            })?;
        let queued = self.lpq(&target.name).await?;
        if !queued.iter().any(|entry| entry.job == job) {
            return Err(EdgePrintError::RemoteJobNotFound {
                printer: target.name.clone(),
                id: remote_id.to_string(),
            });
        }
        self.manage("lprm", &["-P", &target.name, &job.to_string()]).await
    }
}

// ---------------------------------------------------------------------------
// Command construction and output parsing
// ---------------------------------------------------------------------------

/// Arguments for `lp` (everything after the program name).
pub fn lp_args(request: &DispatchRequest) -> Vec<String> {
    let opts = &request.options;
    let mut args = vec![
        "-d".to_string(),
        request.printer.clone(),
        "-t".to_string(),
        request.document_name.clone(),
        "-n".to_string(),
        opts.copies.max(1).to_string(),
    ];
    let mut option = |value: String| {
        args.push("-o".to_string());
        args.push(value);
    };

    if let Some(duplex) = opts.duplex {
        option(format!("sides={}", duplex.sides_keyword()));
    }
    if let Some(color) = opts.color {
        option(format!(
            "print-color-mode={}",
            if color { "color" } else { "monochrome" }
        ));
    }
    if let Some(paper) = &opts.paper_size {
        option(format!("media={paper}"));
    }
    if let Some(media) = &opts.media_type {
        option(format!("MediaType={media}"));
    }
    if let Some(resolution) = &opts.resolution {
        option(format!("Resolution={resolution}"));
    }
    for (key, value) in &opts.extra {
        if !value.trim().is_empty() && value != "None" {
            option(format!("{key}={value}"));
        }
    }

    args.push("--".to_string());
    args.push(request.payload_path.display().to_string());
    args
}

/// Extract `Office-42` from "request id is Office-42 (1 file(s))".
pub fn parse_lp_request_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("request id is ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Numeric job id from a CUPS request id (`Office-42` → 42).
pub fn remote_job_number(remote_id: &str) -> Option<u32> {
    remote_id.rsplit_once('-')?.1.parse().ok()
}

/// One row of `lpq` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job: u32,
    pub owner: String,
    /// Rank is `active`: the printer is processing the job.
    pub active: bool,
    pub file: String,
    pub size_bytes: Option<u64>,
}

impl QueueEntry {
    fn into_remote(self) -> RemoteJob {
        RemoteJob {
            id: self.job.to_string(),
            owner: Some(self.owner),
            document: (!self.file.is_empty()).then_some(self.file),
            size_bytes: self.size_bytes,
            printing: self.active,
        }
    }
}

/// Parse the job table printed by `lpq -P <queue>`.
pub fn parse_lpq(stdout: &str) -> Vec<QueueEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let [rank, owner, job, rest @ ..] = cols.as_slice() else {
                return None;
            };
            let job = job.parse().ok()?;
            // File names may contain spaces; the size is always "<n> bytes".
            let (file, size_bytes) = match rest {
                [file @ .., size, unit] if unit.eq_ignore_ascii_case("bytes") => {
                    (file.join(" "), size.parse().ok())
                }
                file => (file.join(" "), None),
            };
            Some(QueueEntry {
                job,
                owner: owner.to_string(),
                active: rank.eq_ignore_ascii_case("active"),
                file,
                size_bytes,
            })
        })
        .collect()
}

/// `lpstat -a`: queue names and whether they accept requests.
pub fn parse_lpstat_accepting(stdout: &str) -> Vec<(String, bool)> {
    stdout
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with(char::is_whitespace))
        .filter_map(|line| {
            let (name, rest) = line.split_once(' ')?;
            Some((name.to_string(), !rest.trim_start().starts_with("not accepting")))
        })
        .collect()
}

/// `lpstat -p`: queue names and their state.
pub fn parse_lpstat_printers(stdout: &str) -> Vec<(String, PrinterState)> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("printer ")?;
            let (name, status) = rest.split_once(' ')?;
            let status = status.to_ascii_lowercase();
            let state = if status.starts_with("disabled") || status.contains(" disabled since") {
                PrinterState::Offline
            } else if status.contains("now printing") {
                PrinterState::Busy
            } else {
                PrinterState::Online
            };
            Some((name.to_string(), state))
        })
        .collect()
}

fn is_scheduler_down(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("scheduler is not running")
        || lower.contains("unable to connect")
        || lower.contains("connection refused")
}

fn is_unknown_destination(lower: &str) -> bool {
    lower.contains("does not exist")
        || lower.contains("unknown destination")
        || lower.contains("invalid destination")
        || lower.contains("no such destination")
}

/// Map `lp` / `cancel` / `lpq` stderr to the backend error taxonomy.
pub fn classify_lp_error(stderr: &str) -> EdgePrintError {
    let lower = stderr.to_ascii_lowercase();
    let detail = if stderr.is_empty() { "no error output".to_string() } else { stderr.to_string() };

    if is_unknown_destination(&lower) {
        EdgePrintError::PrinterNotFound(detail)
    } else if lower.contains("document-format")
        || lower.contains("unsupported format")
        || lower.contains("unable to print file")
        || lower.contains("unable to access")
        || lower.contains("no such file")
    {
        EdgePrintError::PayloadRejected(detail)
    } else if lower.contains("unsupported")
        || lower.contains("not supported")
        || lower.contains("bad option")
        || lower.contains("invalid option")
        || lower.contains("bad value")
    {
        EdgePrintError::UnsupportedOption(detail)
    } else {
        EdgePrintError::BackendUnavailable(detail)
    }
}
