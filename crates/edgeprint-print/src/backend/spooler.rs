// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Windows print spooler backend, driven through PowerShell.
//
// Submission hands the spooled file to its registered handler with the
// `PrintTo` verb and then looks the new job up in `Get-PrintJob` by file
// name.  Each copy is a separate spooler job; the ticket carries all of
// their ids, comma separated.  Pausing and resuming a printer goes through
// the `Win32_Printer` CIM methods.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{BackendTicket, DuplexMode, PrinterCapabilities, PrinterState};

use super::{
    COMMAND_TIMEOUT, CancelOutcome, CommandOutput, DispatchRequest, LocalPrinter, PollStatus,
    PrintBackend, PrinterTarget, RemoteJob, run_command,
};

/// Remote id used when the job left the spooler before it could be looked up.
pub const UNTRACKED: &str = "untracked";

// Win32 JOB_STATUS_* flags.
pub const JOB_PAUSED: u32 = 0x0001;
pub const JOB_ERROR: u32 = 0x0002;
pub const JOB_DELETING: u32 = 0x0004;
pub const JOB_SPOOLING: u32 = 0x0008;
pub const JOB_PRINTING: u32 = 0x0010;
pub const JOB_OFFLINE: u32 = 0x0020;
pub const JOB_PAPEROUT: u32 = 0x0040;
pub const JOB_PRINTED: u32 = 0x0080;
pub const JOB_DELETED: u32 = 0x0100;
pub const JOB_BLOCKED: u32 = 0x0200;
pub const JOB_USER_INTERVENTION: u32 = 0x0400;
pub const JOB_RESTART: u32 = 0x0800;

/// PRINTER_ATTRIBUTE_WORK_OFFLINE
const ATTRIBUTE_WORK_OFFLINE: u32 = 0x0004;

/// Windows spooler backend.
#[derive(Debug, Clone)]
pub struct SpoolerBackend {
    timeout: Duration,
}

impl Default for SpoolerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoolerBackend {
    pub fn new() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }

    async fn powershell(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        run_command(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", script],
            timeout,
        )
        .await
    }

    /// Spooler jobs on the ticket's printer: `(id, status flags)`.
    async fn jobs(&self, printer: &str) -> Result<Vec<(u32, u32)>> {
        let script = format!(
            "Get-PrintJob -PrinterName {} | ForEach-Object {{ '{{0}} {{1}}' -f $_.Id, [uint32]$_.JobStatus }}",
            ps_quote(printer)
        );
        let output = self.powershell(&script, self.timeout).await?;
        if !output.success {
            return Err(classify_spooler_error(&output.stderr));
        }
        Ok(parse_job_lines(&output.stdout))
    }

    async fn manage(&self, script: &str) -> Result<()> {
        let output = self.powershell(script, self.timeout).await?;
        if output.success {
            info!("spooler queue updated");
            Ok(())
        } else {
            warn!(code = ?output.code, stderr = %output.stderr, "spooler refused the queue change");
            Err(classify_spooler_error(&output.stderr))
        }
    }
}

impl PrintBackend for SpoolerBackend {
    fn name(&self) -> &'static str {
        "spooler"
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id, printer = %request.printer))]
    async fn submit(&self, request: &DispatchRequest) -> Result<BackendTicket> {
        let script = submit_script(request);
        // The script waits for each copy to appear in the queue.
        let timeout = self.timeout * (request.options.copies.max(1) + 1);
        let output = self.powershell(&script, timeout).await?;

        if !output.success {
            warn!(code = ?output.code, stderr = %output.stderr, "spooler refused the job");
            return Err(classify_submit_error(output.code, &output.stderr));
        }

        let ids = parse_submitted_ids(&output.stdout);
        let remote_id = if ids.is_empty() {
            UNTRACKED.to_string()
        } else {
            ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        };
        info!(remote_id = %remote_id, "job handed to the spooler");
        Ok(BackendTicket {
            target: request.printer.clone(),
            remote_id,
        })
    }

    async fn poll(&self, ticket: &BackendTicket) -> Result<PollStatus> {
        let ours = ticket_ids(&ticket.remote_id);
        if ours.is_empty() {
            return Ok(PollStatus::Completed);
        }
        let jobs = self.jobs(&ticket.target).await?;
        let flags: Vec<u32> = jobs
            .iter()
            .filter(|(id, _)| ours.contains(id))
            .map(|(_, flags)| *flags)
            .collect();
        for f in &flags {
            let conditions = describe_job_flags(*f);
            if !conditions.is_empty() {
                debug!(ticket = %ticket, ?conditions, "spooler job conditions");
            }
        }
        Ok(combine_status(&flags))
    }

    #[instrument(skip(self), fields(ticket = %ticket))]
    async fn cancel(&self, ticket: &BackendTicket) -> Result<CancelOutcome> {
        let ours = ticket_ids(&ticket.remote_id);
        let jobs = self.jobs(&ticket.target).await?;
        let present: Vec<(u32, u32)> = jobs.into_iter().filter(|(id, _)| ours.contains(id)).collect();

        if present.is_empty()
            || present
                .iter()
                .any(|(_, flags)| flags & (JOB_PRINTING | JOB_PRINTED) != 0)
        {
            return Ok(CancelOutcome::NotCancellable);
        }

        let script = present
            .iter()
            .map(|(id, _)| format!("Remove-PrintJob -PrinterName {} -ID {id}", ps_quote(&ticket.target)))
            .collect::<Vec<_>>()
            .join("; ");
        let output = self.powershell(&script, self.timeout).await?;
        if output.success {
            info!("job removed from the spooler");
            Ok(CancelOutcome::Cancelled)
        } else {
            warn!(stderr = %output.stderr, "Remove-PrintJob failed");
            Ok(CancelOutcome::NotCancellable)
        }
    }

    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        let script = "Get-CimInstance Win32_Printer | \
            Select-Object Name,Location,DriverName,PrinterStatus,WorkOffline,Attributes,Capabilities,PrinterPaperNames | \
            ConvertTo-Json -Compress -Depth 3";
        let output = self.powershell(script, self.timeout).await?;
        if !output.success {
            return Err(classify_spooler_error(&output.stderr));
        }
        let printers = parse_printer_json(&output.stdout)?;
        debug!(count = printers.len(), "spooler printers listed");
        Ok(printers)
    }

    async fn queue(&self, target: &PrinterTarget) -> Result<Vec<RemoteJob>> {
        let script = format!(
            "Get-PrintJob -PrinterName {} | \
             Select-Object Id,@{{n='JobStatus';e={{[uint32]$_.JobStatus}}}},UserName,DocumentName,Size | \
             ConvertTo-Json -Compress",
            ps_quote(&target.name)
        );
        let output = self.powershell(&script, self.timeout).await?;
        if !output.success {
            return Err(classify_spooler_error(&output.stderr));
        }
        parse_job_json(&output.stdout)
    }

    async fn set_enabled(&self, target: &PrinterTarget, enabled: bool) -> Result<()> {
        let method = if enabled { "Resume" } else { "Pause" };
        self.manage(&printer_method_script(&target.name, method)).await
    }

    async fn clear_queue(&self, target: &PrinterTarget) -> Result<()> {
        let script = format!(
            "$ErrorActionPreference = 'Stop'; Get-PrintJob -PrinterName {} | Remove-PrintJob",
            ps_quote(&target.name)
        );
        self.manage(&script).await
    }

    async fn remove_job(&self, target: &PrinterTarget, remote_id: &str) -> Result<()> {
        let not_found = || EdgePrintError::RemoteJobNotFound {
            printer: target.name.clone(),
            id: remote_id.to_string(),
        };
        let id: u32 = remote_id.trim().parse().map_err(|_| not_found())?;
        if !self.jobs(&target.name).await?.iter().any(|(job, _)| *job == id) {
            return Err(not_found());
        }
        let script = format!(
            "$ErrorActionPreference = 'Stop'; Remove-PrintJob -PrinterName {} -ID {id}",
            ps_quote(&target.name)
        );
        self.manage(&script).await
    }
}

// ---------------------------------------------------------------------------
// Scripts and parsing
// ---------------------------------------------------------------------------

/// Single-quote a value for PowerShell.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `Set-PrintConfiguration` arguments for the requested options.
pub fn print_configuration_args(request: &DispatchRequest) -> Vec<String> {
    let opts = &request.options;
    let mut args = Vec::new();
    if let Some(color) = opts.color {
        args.push(format!("-Color ${color}"));
    }
    if let Some(duplex) = opts.duplex {
        let mode = match duplex {
            DuplexMode::Simplex => "OneSided",
            DuplexMode::LongEdge => "TwoSidedLongEdge",
            DuplexMode::ShortEdge => "TwoSidedShortEdge",
        };
        args.push(format!("-DuplexingMode {mode}"));
    }
    if let Some(paper) = &opts.paper_size {
        args.push(format!("-PaperSize {}", ps_quote(paper)));
    }
    args
}

/// Script for one submission.
///
/// Exit codes: 2 options rejected, 3 no print handler, 0 success with one
/// job id per line on stdout.
pub fn submit_script(request: &DispatchRequest) -> String {
    let printer = ps_quote(&request.printer);
    let file = ps_quote(&request.payload_path.display().to_string());
    let copies = request.options.copies.max(1);

    let mut script = String::from("$ErrorActionPreference = 'Stop'\n");
    script.push_str(&format!("$printer = {printer}\n$file = {file}\n"));
    script.push_str("$leaf = Split-Path $file -Leaf\n");

    let config = print_configuration_args(request);
    if !config.is_empty() {
        script.push_str(&format!(
            "try {{ Set-PrintConfiguration -PrinterName $printer {} }} catch {{ [Console]::Error.WriteLine($_); exit 2 }}\n",
            config.join(" ")
        ));
    }

    script.push_str(&format!(
        "$seen = @()\n\
         for ($c = 0; $c -lt {copies}; $c++) {{\n\
         \x20 try {{ Start-Process -FilePath $file -Verb PrintTo -ArgumentList ('\"' + $printer + '\"') -WindowStyle Hidden }} catch {{ [Console]::Error.WriteLine($_); exit 3 }}\n\
         \x20 for ($i = 0; $i -lt 20; $i++) {{\n\
         \x20   $job = Get-PrintJob -PrinterName $printer | Where-Object {{ $_.DocumentName -like \"*$leaf*\" -and $seen -notcontains $_.Id }} | Select-Object -Last 1\n\
         \x20   if ($job) {{ $seen += $job.Id; $job.Id; break }}\n\
         \x20   Start-Sleep -Milliseconds 250\n\
         \x20 }}\n\
         }}\n"
    ));
    script
}

/// Map a failed submission to the error taxonomy.
pub fn classify_submit_error(code: Option<i32>, stderr: &str) -> EdgePrintError {
    let lower = stderr.to_ascii_lowercase();
    match code {
        Some(2) => EdgePrintError::UnsupportedOption(stderr.to_string()),
        Some(3) if lower.contains("no application is associated") => {
            EdgePrintError::PayloadRejected(stderr.to_string())
        }
        _ => classify_spooler_error(stderr),
    }
}

/// Map spooler cmdlet stderr to the error taxonomy.
pub fn classify_spooler_error(stderr: &str) -> EdgePrintError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("printer was not found")
        || lower.contains("no printer found")
        || lower.contains("printer name is invalid")
    {
        EdgePrintError::PrinterNotFound(stderr.to_string())
    } else {
        EdgePrintError::BackendUnavailable(stderr.to_string())
    }
}

/// Script calling a `Win32_Printer` method (`Pause`, `Resume`) on one printer.
///
/// Exit codes: 4 no such printer, 5 the method returned non-zero.
pub fn printer_method_script(printer: &str, method: &str) -> String {
    format!(
        "$p = Get-CimInstance Win32_Printer | Where-Object {{ $_.Name -eq {} }}\n\
         if (-not $p) {{ [Console]::Error.WriteLine('The specified printer was not found.'); exit 4 }}\n\
         $r = Invoke-CimMethod -InputObject $p -MethodName {method}\n\
         if ($r.ReturnValue -ne 0) {{ [Console]::Error.WriteLine('{method} returned ' + $r.ReturnValue); exit 5 }}\n",
        ps_quote(printer)
    )
}

/// Job ids printed by the submit script.
pub fn parse_submitted_ids(stdout: &str) -> Vec<u32> {
    stdout.lines().filter_map(|l| l.trim().parse().ok()).collect()
}

fn ticket_ids(remote_id: &str) -> Vec<u32> {
    remote_id
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

/// `"<id> <flags>"` lines from `Get-PrintJob`.
pub fn parse_job_lines(stdout: &str) -> Vec<(u32, u32)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?.parse().ok()?;
            let flags = parts.next().and_then(|f| f.parse().ok()).unwrap_or(0);
            Some((id, flags))
        })
        .collect()
}

/// Status of one spooler job from its flags.
pub fn job_status_from_flags(flags: u32) -> PollStatus {
    if flags & (JOB_DELETED | JOB_DELETING) != 0 {
        PollStatus::Failed(EdgePrintError::PayloadRejected(
            "job was removed from the spooler queue".into(),
        ))
    } else if flags & JOB_PRINTED != 0 {
        PollStatus::Completed
    } else if flags & (JOB_PRINTING | JOB_SPOOLING) != 0 {
        PollStatus::Printing
    } else {
        PollStatus::Pending
    }
}

/// Combined status of every copy still in the queue; none left means done.
fn combine_status(flags: &[u32]) -> PollStatus {
    let mut combined = PollStatus::Completed;
    for f in flags {
        match job_status_from_flags(*f) {
            failed @ PollStatus::Failed(_) => return failed,
            PollStatus::Printing => combined = PollStatus::Printing,
            PollStatus::Pending if matches!(combined, PollStatus::Completed) => {
                combined = PollStatus::Pending;
            }
            _ => {}
        }
    }
    combined
}

/// Human-readable conditions set on a job, for logs.
pub fn describe_job_flags(flags: u32) -> Vec<&'static str> {
    [
        (JOB_PAUSED, "paused"),
        (JOB_ERROR, "error"),
        (JOB_OFFLINE, "offline"),
        (JOB_PAPEROUT, "paper out"),
        (JOB_BLOCKED, "blocked"),
        (JOB_USER_INTERVENTION, "user intervention"),
        (JOB_RESTART, "restarting"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags & flag != 0)
    .map(|(_, text)| text)
    .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WinPrinter {
    name: String,
    location: Option<String>,
    driver_name: Option<String>,
    printer_status: Option<u32>,
    work_offline: Option<bool>,
    attributes: Option<u32>,
    capabilities: Option<Vec<u16>>,
    printer_paper_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WinJob {
    id: u32,
    job_status: Option<u32>,
    user_name: Option<String>,
    document_name: Option<String>,
    size: Option<u64>,
}

impl WinJob {
    fn into_remote(self) -> RemoteJob {
        let flags = self.job_status.unwrap_or(0);
        RemoteJob {
            id: self.id.to_string(),
            owner: self.user_name.filter(|u| !u.is_empty()),
            document: self.document_name.filter(|d| !d.is_empty()),
            size_bytes: self.size,
            printing: flags & (JOB_PRINTING | JOB_SPOOLING) != 0,
        }
    }
}

/// `ConvertTo-Json` emits a bare object for a single result.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn parse_json_list<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<OneOrMany<T>>(trimmed)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(one) => vec![one],
    })
}

impl WinPrinter {
    fn state(&self) -> PrinterState {
        let offline = self.work_offline.unwrap_or(false)
            || self.attributes.unwrap_or(0) & ATTRIBUTE_WORK_OFFLINE != 0;
        match self.printer_status {
            _ if offline => PrinterState::Offline,
            Some(4) => PrinterState::Busy,
            Some(6) => PrinterState::Error,
            Some(7) => PrinterState::Offline,
            _ => PrinterState::Online,
        }
    }

    fn into_local(self) -> LocalPrinter {
        let caps = self.capabilities.as_deref().unwrap_or(&[]);
        let capabilities = PrinterCapabilities {
            // Win32_Printer.Capabilities: 2 = color, 3 = duplex.
            color: Some(caps.contains(&2)),
            duplex: Some(caps.contains(&3)),
            paper_sizes: self.printer_paper_names.clone().unwrap_or_default(),
            ..PrinterCapabilities::default()
        };
        LocalPrinter {
            state: self.state(),
            display_name: self.name.clone(),
            name: self.name,
            location: self.location.filter(|l| !l.is_empty()),
            make_and_model: self.driver_name,
            uri: None,
            capabilities,
        }
    }
}

/// Parse `Get-CimInstance Win32_Printer | ConvertTo-Json`.
pub fn parse_printer_json(stdout: &str) -> Result<Vec<LocalPrinter>> {
    let printers = parse_json_list::<WinPrinter>(stdout)?;
    Ok(printers.into_iter().map(WinPrinter::into_local).collect())
}

/// Parse the `Get-PrintJob | ConvertTo-Json` listing.
pub fn parse_job_json(stdout: &str) -> Result<Vec<RemoteJob>> {
    let jobs = parse_json_list::<WinJob>(stdout)?;
    Ok(jobs.into_iter().map(WinJob::into_remote).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprint_core::types::{JobId, PayloadKind, PrintOptions};

    fn request(options: PrintOptions) -> DispatchRequest {
        DispatchRequest {
            job_id: JobId(3),
            printer: "Bob's Printer".into(),
            uri: None,
            payload_path: r"C:\spool\edgeprint-job-3.pdf".into(),
            kind: PayloadKind::Pdf,
            document_name: "invoice.pdf".into(),
            options,
        }
    }

    #[test]
    fn quoting_doubles_single_quotes() {
        assert_eq!(ps_quote("Bob's Printer"), "'Bob''s Printer'");
    }

    #[test]
    fn flags_map_to_poll_status() {
        assert!(matches!(job_status_from_flags(0), PollStatus::Pending));
        assert!(matches!(job_status_from_flags(JOB_PAUSED), PollStatus::Pending));
        assert!(matches!(job_status_from_flags(JOB_SPOOLING | JOB_PRINTING), PollStatus::Printing));
        assert!(matches!(job_status_from_flags(JOB_PRINTED), PollStatus::Completed));
        assert!(matches!(
            job_status_from_flags(JOB_DELETING | JOB_PRINTING),
            PollStatus::Failed(EdgePrintError::PayloadRejected(_))
        ));
        assert_eq!(describe_job_flags(JOB_ERROR | JOB_PAPEROUT), vec!["error", "paper out"]);
    }

    #[test]
    fn copies_combine_to_the_least_finished_state() {
        assert!(matches!(combine_status(&[]), PollStatus::Completed));
        assert!(matches!(combine_status(&[JOB_PRINTED, 0]), PollStatus::Pending));
        assert!(matches!(combine_status(&[0, JOB_PRINTING]), PollStatus::Printing));
        assert_eq!(ticket_ids("12,13"), vec![12, 13]);
        assert!(ticket_ids(UNTRACKED).is_empty());
    }

    #[test]
    fn job_lines_parsed() {
        assert_eq!(parse_job_lines("12 16\r\n13 0\r\n\r\n"), vec![(12, 16), (13, 0)]);
        assert_eq!(parse_submitted_ids("41\r\n42\r\n"), vec![41, 42]);
    }

    #[test]
    fn submit_script_sets_requested_options() {
        let options = PrintOptions {
            copies: 2,
            color: Some(false),
            duplex: Some(DuplexMode::ShortEdge),
            ..PrintOptions::default()
        };
        let script = submit_script(&request(options));
        assert!(script.contains("$printer = 'Bob''s Printer'"));
        assert!(script.contains("-Color $false -DuplexingMode TwoSidedShortEdge"));
        assert!(script.contains("$c -lt 2"));

        let plain = submit_script(&request(PrintOptions::default()));
        assert!(!plain.contains("Set-PrintConfiguration"));
    }

    #[test]
    fn submit_errors_classified_by_exit_code() {
        assert!(matches!(
            classify_submit_error(Some(2), "PaperSize 'Tabloid' is not valid"),
            EdgePrintError::UnsupportedOption(_)
        ));
        assert!(matches!(
            classify_submit_error(Some(3), "No application is associated with the specified file"),
            EdgePrintError::PayloadRejected(_)
        ));
        assert!(matches!(
            classify_submit_error(Some(1), "The spooler service is not reachable"),
            EdgePrintError::BackendUnavailable(_)
        ));
        assert!(matches!(
            classify_submit_error(Some(1), "Get-PrintJob : The specified printer was not found."),
            EdgePrintError::PrinterNotFound(_)
        ));
    }

    #[test]
    fn job_json_lists_the_queue() {
        let many = r#"[{"Id":7,"JobStatus":16,"UserName":"alice","DocumentName":"report.pdf","Size":2048},
            {"Id":8,"JobStatus":0,"UserName":"","DocumentName":"photo.png","Size":null}]"#;
        let jobs = parse_job_json(many).expect("parse");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "7");
        assert!(jobs[0].printing);
        assert_eq!(jobs[0].size_bytes, Some(2048));
        assert!(!jobs[1].printing);
        assert!(jobs[1].owner.is_none());

        let one = parse_job_json(r#"{"Id":9,"DocumentName":"x.pdf"}"#).expect("parse");
        assert_eq!(one[0].document.as_deref(), Some("x.pdf"));
        assert!(parse_job_json("  ").expect("parse").is_empty());
    }

    #[test]
    fn printer_method_script_targets_one_printer() {
        let script = printer_method_script("Bob's Printer", "Pause");
        assert!(script.contains("$_.Name -eq 'Bob''s Printer'"));
        assert!(script.contains("-MethodName Pause"));
        assert!(script.contains("exit 4"));
    }

    #[test]
    fn printer_json_single_and_many() {
        let one = r#"{"Name":"Office","Location":"","DriverName":"HP Universal","PrinterStatus":3,
            "WorkOffline":false,"Attributes":0,"Capabilities":[4,2,3],"PrinterPaperNames":["A4","Letter"]}"#;
        let printers = parse_printer_json(one).expect("parse");
        assert_eq!(printers.len(), 1);
        assert_eq!(printers[0].state, PrinterState::Online);
        assert_eq!(printers[0].capabilities.color, Some(true));
        assert_eq!(printers[0].capabilities.paper_sizes, vec!["A4", "Letter"]);
        assert!(printers[0].location.is_none());

        let many = r#"[{"Name":"A","Attributes":4},{"Name":"B","PrinterStatus":4}]"#;
        let printers = parse_printer_json(many).expect("parse");
        assert_eq!(printers[0].state, PrinterState::Offline);
        assert_eq!(printers[1].state, PrinterState::Busy);
        assert_eq!(printers[1].capabilities.duplex, Some(false));

        assert!(parse_printer_json("").expect("parse").is_empty());
    }
}
