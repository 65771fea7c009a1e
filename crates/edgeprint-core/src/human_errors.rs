// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for the control panel.
//
// Every technical error is mapped to plain English with a clear suggestion.
// The control surface shows these next to a job's raw `last_error`.

use serde::Serialize;

use crate::error::EdgePrintError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Print subsystem blip; the service retries automatically.
    Transient,
    /// Someone must do something (pick another printer, fix settings, add paper).
    ActionRequired,
    /// Cannot be fixed by retrying: wrong format, damaged file.
    Permanent,
    /// A consumable must be replaced (ink, toner).
    BuyRequired,
}

/// A human-readable error with a plain message and an actionable suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct HumanError {
    /// Plain English summary.
    pub message: String,
    /// What the operator should try.
    pub suggestion: String,
    /// Whether the service retries on its own.
    pub retriable: bool,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: &str, suggestion: impl Into<String>, retriable: bool, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            retriable,
            severity,
        }
    }
}

/// Convert an `EdgePrintError` into a `HumanError`.
pub fn humanize_error(err: &EdgePrintError) -> HumanError {
    match err {
        // -- Validation --
        EdgePrintError::PrinterNotFound(name) => HumanError::new(
            "That printer isn't known to the service.",
            format!("Refresh the printer list and pick a printer that is shown there. (Printer: {name})"),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::UnsupportedPayloadKind(detail) => HumanError::new(
            "This type of document can't be printed.",
            format!("Only PDF files and images (PNG, JPEG, BMP, GIF, TIFF) are supported. Save the file as a PDF first. (File type: {detail})"),
            false,
            Severity::Permanent,
        ),

        EdgePrintError::PayloadTooLarge { limit, .. } => HumanError::new(
            "The document is too large.",
            format!("Documents up to {} MB are accepted. Try splitting or compressing the file.", limit / (1024 * 1024)),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::JobNotFound(id) => HumanError::new(
            "That print job doesn't exist.",
            format!("Job {id} may have finished a long time ago. Refresh the job list."),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::RemoteJobNotFound { printer, id } => HumanError::new(
            "That job is no longer waiting at the printer.",
            format!("Job {id} has already printed or was removed. Refresh the queue of {printer}."),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::AlreadyTerminal(id) => HumanError::new(
            "That print job has already finished.",
            format!("Job {id} can no longer be changed."),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::InvalidTransition { id, .. } => HumanError::new(
            "That print job is busy changing state.",
            format!("Refresh the job list and check job {id} again."),
            true,
            Severity::Transient,
        ),

        // -- Backend --
        EdgePrintError::BackendUnavailable(detail) => humanize_message(detail),

        EdgePrintError::UnsupportedOption(_) => HumanError::new(
            "The printer can't handle those settings.",
            "Change the print settings (paper size, duplex, colour, copies) and print again.",
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::PayloadRejected(_) => HumanError::new(
            "The printer couldn't read this document.",
            "The file may be damaged. Open it on a computer to check it, or export it again as a PDF.",
            false,
            Severity::Permanent,
        ),

        EdgePrintError::DispatchTimeout { .. } => HumanError::new(
            "The printer never confirmed this job.",
            "Check whether the page came out before printing again, so nothing is printed twice.",
            false,
            Severity::ActionRequired,
        ),

        // -- Resources --
        EdgePrintError::PayloadStorage(_) => HumanError::new(
            "The stored copy of this document was lost or damaged.",
            "Submit the document again.",
            false,
            Severity::Permanent,
        ),

        EdgePrintError::Database(_) => HumanError::new(
            "The job history store had a problem.",
            "Printing continues; older job records may be missing. Restart the service if this keeps happening.",
            true,
            Severity::Transient,
        ),

        EdgePrintError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => HumanError::new(
                "A file the service needed couldn't be found.",
                "Submit the document again.",
                false,
                Severity::ActionRequired,
            ),
            std::io::ErrorKind::PermissionDenied => HumanError::new(
                "The service doesn't have permission to use a file.",
                "Check the permissions of the service's data directory.",
                false,
                Severity::ActionRequired,
            ),
            _ => HumanError::new(
                "There was a problem reading or writing a file.",
                "Try again. If this keeps happening, the disk may be full.",
                true,
                Severity::Transient,
            ),
        },

        EdgePrintError::Serialization(_) => HumanError::new(
            "The service had an internal data problem.",
            "Try again. If this keeps happening, please report it.",
            true,
            Severity::Transient,
        ),

        // -- Infrastructure --
        EdgePrintError::Discovery(_) => HumanError::new(
            "We can't search for network printers right now.",
            "Check the network connection. Printers installed on this computer still work.",
            true,
            Severity::Transient,
        ),

        EdgePrintError::Config(detail) => HumanError::new(
            "The service configuration is invalid.",
            format!("Fix the configuration file and restart the service. ({detail})"),
            false,
            Severity::ActionRequired,
        ),

        EdgePrintError::ControlServer(_) => HumanError::new(
            "The control panel had a problem.",
            "Reload the page. Restart the service if this keeps happening.",
            true,
            Severity::Transient,
        ),

        EdgePrintError::ShuttingDown => HumanError::new(
            "The print service is shutting down.",
            "Wait for it to restart, then submit the document again.",
            true,
            Severity::Transient,
        ),
    }
}

/// Interpret a stored error string (e.g. a job's `last_error`) or a print
/// subsystem detail message.
pub fn humanize_message(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out") || lower.contains("timeout") {
        HumanError::new(
            "The printer didn't respond in time.",
            "The printer might be busy or turned off. We'll try again automatically.",
            true,
            Severity::Transient,
        )
    } else if lower.contains("not running") || lower.contains("scheduler") || lower.contains("not installed") {
        HumanError::new(
            "The computer's print system isn't running.",
            "Start the print service (CUPS or the Windows spooler). Queued jobs will print once it is back.",
            true,
            Severity::Transient,
        )
    } else if lower.contains("connection refused") || lower.contains("unable to connect") {
        HumanError::new(
            "The printer refused our connection.",
            "The printer may be off or busy. Try turning it off and on again.",
            true,
            Severity::Transient,
        )
    } else if lower.contains("media-empty") || lower.contains("out of paper") || lower.contains("paper out") {
        HumanError::new(
            "The printer is out of paper.",
            "Add paper to the printer's tray.",
            false,
            Severity::ActionRequired,
        )
    } else if lower.contains("toner") || lower.contains("ink") || lower.contains("marker-supply") {
        HumanError::new(
            "The printer needs new ink or toner.",
            "Replace the cartridge. Check the printer's model number to find the right one.",
            false,
            Severity::BuyRequired,
        )
    } else if lower.contains("jam") {
        HumanError::new(
            "Paper is stuck in the printer.",
            "Gently pull the stuck paper out, then close all doors.",
            false,
            Severity::ActionRequired,
        )
    } else if lower.contains("unsupported print option") || lower.contains("not supported") {
        HumanError::new(
            "The printer can't handle those settings.",
            "Change the print settings and print again.",
            false,
            Severity::ActionRequired,
        )
    } else if lower.contains("document rejected") || lower.contains("document-format") {
        HumanError::new(
            "The printer couldn't read this document.",
            "Export the document again as a PDF and resubmit it.",
            false,
            Severity::Permanent,
        )
    } else {
        HumanError::new(
            "The printer had a problem.",
            format!("Try again. If this keeps happening, restart the printer. (Detail: {detail})"),
            true,
            Severity::Transient,
        )
    }
}
