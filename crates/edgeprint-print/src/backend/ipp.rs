// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Direct IPP backend for network printers.
//
// Uses the `ipp` crate's async API:
//   - Print-Job   (RFC 8011 §4.2.1)
//   - Get-Jobs    (RFC 8011 §4.2.6)
//   - Cancel-Job  (RFC 8011 §4.2.8)
//   - Pause-Printer / Resume-Printer / Purge-Jobs  (RFC 8011 §4.3.2)
//
// The target is the `uri` from the job's capability snapshot, normally the
// `rp` path announced over mDNS.  Queues are not listed here; network
// printers arrive through discovery.

use std::io::Cursor;

use ::ipp::prelude::*;
use tracing::{debug, error, info, instrument, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{BackendTicket, PayloadKind};

use super::{
    CancelOutcome, DispatchRequest, LocalPrinter, PollStatus, PrintBackend, PrinterTarget, RemoteJob,
};

// RFC 8011 §5.3.7 job-state values.
const JOB_PENDING: i32 = 3;
const JOB_PENDING_HELD: i32 = 4;
const JOB_PROCESSING: i32 = 5;
const JOB_PROCESSING_STOPPED: i32 = 6;
const JOB_CANCELED: i32 = 7;
const JOB_ABORTED: i32 = 8;
const JOB_COMPLETED: i32 = 9;

/// Job attributes asked for in Get-Jobs.
const JOB_ATTRIBUTES: [&str; 5] = [
    "job-id",
    "job-state",
    "job-name",
    "job-originating-user-name",
    "job-k-octets",
];

/// IPP backend; stateless, one client per request.
#[derive(Debug, Clone, Default)]
pub struct IppBackend;

impl IppBackend {
    pub fn new() -> Self {
        Self
    }

    fn parse_uri(uri: &str) -> Result<Uri> {
        uri.parse()
            .map_err(|e| EdgePrintError::PrinterNotFound(format!("invalid printer URI '{uri}': {e}")))
    }

    fn target_uri(target: &PrinterTarget) -> Result<Uri> {
        let uri = target.uri.as_deref().ok_or_else(|| {
            EdgePrintError::PrinterNotFound(format!("{} has no IPP URI", target.name))
        })?;
        Self::parse_uri(uri)
    }

    /// Active jobs on the printer.
    async fn jobs(&self, uri: Uri) -> Result<Vec<IppJob>> {
        let mut request = IppRequestResponse::new(IppVersion::v1_1(), Operation::GetJobs, Some(uri.clone()));
        let requested = JOB_ATTRIBUTES
            .iter()
            .map(|name| IppValue::Keyword((*name).to_string()))
            .collect();
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(IppAttribute::REQUESTED_ATTRIBUTES, IppValue::Array(requested)),
        );

        let response = AsyncIppClient::new(uri)
            .send(request)
            .await
            .map_err(|e| EdgePrintError::BackendUnavailable(format!("Get-Jobs: {e}")))?;

        let code = response.header().status_code();
        if !code.is_success() {
            error!(status = ?code, "Get-Jobs failed");
            return Err(EdgePrintError::BackendUnavailable(format!(
                "Get-Jobs returned status {code:?}"
            )));
        }
        Ok(parse_jobs(response.attributes()))
    }

    /// `job-state` of a remote job, or `None` once the printer no longer
    /// lists it among its active jobs.
    async fn job_state(&self, ticket: &BackendTicket) -> Result<Option<Option<i32>>> {
        let uri = Self::parse_uri(&ticket.target)?;
        let job_id: i32 = ticket.remote_id.parse().map_err(|_| {
            EdgePrintError::BackendUnavailable(format!("bad IPP job id '{}'", ticket.remote_id))
        })?;
        Ok(self
            .jobs(uri)
            .await?
            .into_iter()
            .find(|job| job.id == job_id)
            .map(|job| job.state))
    }

    /// Send a printer-level operation; any non-success status is an error.
    async fn printer_operation(&self, uri: Uri, request: IppRequestResponse, name: &str) -> Result<()> {
        let response = AsyncIppClient::new(uri)
            .send(request)
            .await
            .map_err(|e| EdgePrintError::BackendUnavailable(format!("{name}: {e}")))?;
        let code = response.header().status_code();
        if code.is_success() {
            info!(operation = name, "printer accepted the request");
            Ok(())
        } else {
            warn!(operation = name, status = ?code, "printer refused the request");
            Err(classify_status(&format!("{code:?}")))
        }
    }
}

impl PrintBackend for IppBackend {
    fn name(&self) -> &'static str {
        "ipp"
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id, printer = %request.printer))]
    async fn submit(&self, request: &DispatchRequest) -> Result<BackendTicket> {
        let target = request.uri.clone().ok_or_else(|| {
            EdgePrintError::PrinterNotFound(format!("{} has no IPP URI", request.printer))
        })?;
        let uri = Self::parse_uri(&target)?;

        let bytes = tokio::fs::read(&request.payload_path)
            .await
            .map_err(|e| EdgePrintError::PayloadStorage(format!("read spooled payload: {e}")))?;
        let mime = document_format(request.kind, &bytes);

        let mut builder = IppOperationBuilder::print_job(uri.clone(), IppPayload::new(Cursor::new(bytes)))
            .job_title(request.document_name.as_str())
            .document_format(mime);
        for attribute in job_attributes(request) {
            builder = builder.attribute(attribute);
        }

        info!(mime, "sending Print-Job");
        let response = AsyncIppClient::new(uri)
            .send(builder.build())
            .await
            .map_err(|e| EdgePrintError::BackendUnavailable(format!("Print-Job: {e}")))?;

        let code = response.header().status_code();
        if !code.is_success() {
            error!(status = ?code, "Print-Job failed");
            return Err(classify_status(&format!("{code:?}")));
        }

        let job_id = extract_job_id(response.attributes()).ok_or_else(|| {
            EdgePrintError::BackendUnavailable("Print-Job response missing job-id attribute".into())
        })?;
        info!(remote_job = job_id, "print job accepted by printer");
        Ok(BackendTicket {
            target,
            remote_id: job_id.to_string(),
        })
    }

    async fn poll(&self, ticket: &BackendTicket) -> Result<PollStatus> {
        let status = match self.job_state(ticket).await? {
            None => PollStatus::Completed,
            Some(state) => status_from_job_state(state),
        };
        debug!(ticket = %ticket, status = ?status, "IPP job polled");
        Ok(status)
    }

    #[instrument(skip(self), fields(ticket = %ticket))]
    async fn cancel(&self, ticket: &BackendTicket) -> Result<CancelOutcome> {
        match self.job_state(ticket).await? {
            None | Some(Some(JOB_PROCESSING)) => return Ok(CancelOutcome::NotCancellable),
            Some(Some(state)) if state >= JOB_CANCELED => return Ok(CancelOutcome::NotCancellable),
            Some(_) => {}
        }

        let uri = Self::parse_uri(&ticket.target)?;
        let job_id: i32 = ticket.remote_id.parse().map_err(|_| {
            EdgePrintError::BackendUnavailable(format!("bad IPP job id '{}'", ticket.remote_id))
        })?;
        let operation = IppOperationBuilder::cancel_job(uri.clone(), job_id).build();
        let response = AsyncIppClient::new(uri)
            .send(operation)
            .await
            .map_err(|e| EdgePrintError::BackendUnavailable(format!("Cancel-Job({job_id}): {e}")))?;

        let code = response.header().status_code();
        if code.is_success() {
            info!(remote_job = job_id, "job cancelled");
            Ok(CancelOutcome::Cancelled)
        } else {
            info!(status = ?code, remote_job = job_id, "printer refused Cancel-Job");
            Ok(CancelOutcome::NotCancellable)
        }
    }

    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        Ok(Vec::new())
    }

    async fn queue(&self, target: &PrinterTarget) -> Result<Vec<RemoteJob>> {
        let uri = Self::target_uri(target)?;
        Ok(self.jobs(uri).await?.into_iter().map(IppJob::into_remote).collect())
    }

    async fn set_enabled(&self, target: &PrinterTarget, enabled: bool) -> Result<()> {
        let uri = Self::target_uri(target)?;
        let (operation, name) = if enabled {
            (Operation::ResumePrinter, "Resume-Printer")
        } else {
            (Operation::PausePrinter, "Pause-Printer")
        };
        let request = IppRequestResponse::new(IppVersion::v1_1(), operation, Some(uri.clone()));
        self.printer_operation(uri, request, name).await
    }

    async fn clear_queue(&self, target: &PrinterTarget) -> Result<()> {
        let uri = Self::target_uri(target)?;
        let request = IppOperationBuilder::purge_jobs(uri.clone()).build().into();
        self.printer_operation(uri, request, "Purge-Jobs").await
    }

    async fn remove_job(&self, target: &PrinterTarget, remote_id: &str) -> Result<()> {
        let uri = Self::target_uri(target)?;
        let not_found = || EdgePrintError::RemoteJobNotFound {
            printer: target.name.clone(),
            id: remote_id.to_string(),
        };
        let job_id: i32 = remote_id.trim().parse().map_err(|_| not_found())?;
        if !self.jobs(uri.clone()).await?.iter().any(|job| job.id == job_id) {
            return Err(not_found());
        }
        let request = IppOperationBuilder::cancel_job(uri.clone(), job_id).build().into();
        self.printer_operation(uri, request, "Cancel-Job").await
    }
}

// ---------------------------------------------------------------------------
// Request building and response parsing
// ---------------------------------------------------------------------------

/// `document-format` for a payload.
pub fn document_format(kind: PayloadKind, bytes: &[u8]) -> &'static str {
    match kind {
        PayloadKind::Pdf => "application/pdf",
        PayloadKind::Image => image::guess_format(bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream"),
    }
}

fn keyword(name: &str, value: &str) -> IppAttribute {
    IppAttribute::new(name, IppValue::Keyword(value.to_string().into()))
}

/// Job template attributes for the requested options.
pub fn job_attributes(request: &DispatchRequest) -> Vec<IppAttribute> {
    let opts = &request.options;
    let mut attrs = Vec::new();
    if opts.copies > 1 {
        attrs.push(IppAttribute::new(
            "copies",
            IppValue::Integer(i32::try_from(opts.copies).unwrap_or(i32::MAX)),
        ));
    }
    if let Some(duplex) = opts.duplex {
        attrs.push(keyword("sides", duplex.sides_keyword()));
    }
    if let Some(color) = opts.color {
        attrs.push(keyword(
            "print-color-mode",
            if color { "color" } else { "monochrome" },
        ));
    }
    if let Some(paper) = &opts.paper_size {
        attrs.push(keyword("media", &ipp_media_name(paper)));
    }
    attrs
}

/// PWG media name for common paper size labels; others pass through.
pub fn ipp_media_name(paper: &str) -> String {
    match paper.to_ascii_lowercase().as_str() {
        "a4" => "iso_a4_210x297mm".into(),
        "a5" => "iso_a5_148x210mm".into(),
        "a3" => "iso_a3_297x420mm".into(),
        "letter" => "na_letter_8.5x11in".into(),
        "legal" => "na_legal_8.5x14in".into(),
        "4x6" => "na_index-4x6_4x6in".into(),
        _ => paper.to_string(),
    }
}

/// Map a non-success IPP status (its `Debug` name) to the error taxonomy.
pub fn classify_status(status: &str) -> EdgePrintError {
    let lower = status.to_ascii_lowercase();
    let detail = format!("printer returned status {status}");
    if lower.contains("documentformat")
        || lower.contains("documentunprintable")
        || lower.contains("compression")
    {
        EdgePrintError::PayloadRejected(detail)
    } else if lower.contains("attributesorvalues") || lower.contains("conflicting") {
        EdgePrintError::UnsupportedOption(detail)
    } else if lower.starts_with("clienterror") {
        EdgePrintError::PayloadRejected(detail)
    } else {
        EdgePrintError::BackendUnavailable(detail)
    }
}

/// Poll status for an IPP `job-state`; a missing state is still pending.
pub fn status_from_job_state(state: Option<i32>) -> PollStatus {
    match state {
        Some(JOB_PROCESSING) | Some(JOB_PROCESSING_STOPPED) => PollStatus::Printing,
        Some(JOB_COMPLETED) => PollStatus::Completed,
        Some(JOB_CANCELED) => PollStatus::Failed(EdgePrintError::PayloadRejected(
            "job was cancelled at the printer".into(),
        )),
        Some(JOB_ABORTED) => PollStatus::Failed(EdgePrintError::PayloadRejected(
            "printer aborted the job".into(),
        )),
        Some(JOB_PENDING) | Some(JOB_PENDING_HELD) | Some(_) | None => PollStatus::Pending,
    }
}

fn int_value(value: &IppValue) -> Option<i32> {
    match value {
        IppValue::Integer(v) | IppValue::Enum(v) => Some(*v),
        _ => None,
    }
}

/// Extract the `job-id` integer from a response's Job Attributes group.
fn extract_job_id(attrs: &IppAttributes) -> Option<i32> {
    for group in attrs.groups_of(DelimiterTag::JobAttributes) {
        if let Some(attr) = group.attributes().get("job-id")
            && let IppValue::Integer(id) = attr.value()
        {
            return Some(*id);
        }
    }
    None
}

fn text_value(value: &IppValue) -> Option<String> {
    match value {
        IppValue::NameWithoutLanguage(s) | IppValue::TextWithoutLanguage(s) | IppValue::Keyword(s) => {
            Some(s.clone())
        }
        IppValue::NameWithLanguage { name, .. } => Some(name.clone()),
        IppValue::TextWithLanguage { text, .. } => Some(text.clone()),
        _ => None,
    }
}

/// One job from a Get-Jobs response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IppJob {
    id: i32,
    state: Option<i32>,
    name: Option<String>,
    owner: Option<String>,
    k_octets: Option<i32>,
}

impl IppJob {
    fn into_remote(self) -> RemoteJob {
        RemoteJob {
            id: self.id.to_string(),
            owner: self.owner,
            document: self.name,
            size_bytes: self
                .k_octets
                .and_then(|k| u64::try_from(k).ok())
                .map(|k| k * 1024),
            printing: matches!(self.state, Some(JOB_PROCESSING) | Some(JOB_PROCESSING_STOPPED)),
        }
    }
}

/// Every job in a Get-Jobs response, in response order.
fn parse_jobs(attrs: &IppAttributes) -> Vec<IppJob> {
    attrs
        .groups_of(DelimiterTag::JobAttributes)
        .filter_map(|group| {
            let attributes = group.attributes();
            let int = |name: &str| attributes.get(name).and_then(|a| int_value(a.value()));
            let text = |name: &str| attributes.get(name).and_then(|a| text_value(a.value()));
            Some(IppJob {
                id: int("job-id")?,
                state: int("job-state"),
                name: text("job-name"),
                owner: text("job-originating-user-name"),
                k_octets: int("job-k-octets"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprint_core::types::{DuplexMode, JobId, PrintOptions};

    #[test]
    fn invalid_uri_is_rejected() {
        assert!(IppBackend::parse_uri("not a valid uri %%%").is_err());
        assert!(IppBackend::parse_uri("ipp://192.168.1.100:631/ipp/print").is_ok());
    }

    #[test]
    fn job_states_map_to_poll_status() {
        assert!(matches!(status_from_job_state(Some(JOB_PENDING)), PollStatus::Pending));
        assert!(matches!(status_from_job_state(None), PollStatus::Pending));
        assert!(matches!(status_from_job_state(Some(JOB_PROCESSING)), PollStatus::Printing));
        assert!(matches!(status_from_job_state(Some(JOB_COMPLETED)), PollStatus::Completed));
        assert!(matches!(
            status_from_job_state(Some(JOB_ABORTED)),
            PollStatus::Failed(EdgePrintError::PayloadRejected(_))
        ));
    }

    #[test]
    fn status_codes_classified() {
        assert!(matches!(
            classify_status("ClientErrorDocumentFormatNotSupported"),
            EdgePrintError::PayloadRejected(_)
        ));
        assert!(matches!(
            classify_status("ClientErrorAttributesOrValuesNotSupported"),
            EdgePrintError::UnsupportedOption(_)
        ));
        assert!(matches!(
            classify_status("ServerErrorBusy"),
            EdgePrintError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn options_become_job_attributes() {
        let request = DispatchRequest {
            job_id: JobId(9),
            printer: "Lobby".into(),
            uri: Some("ipp://10.0.0.5/ipp/print".into()),
            payload_path: "/tmp/x.pdf".into(),
            kind: PayloadKind::Pdf,
            document_name: "x.pdf".into(),
            options: PrintOptions {
                copies: 3,
                duplex: Some(DuplexMode::LongEdge),
                paper_size: Some("A4".into()),
                ..PrintOptions::default()
            },
        };
        let names: Vec<String> = job_attributes(&request)
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["copies", "sides", "media"]);
        assert_eq!(ipp_media_name("Letter"), "na_letter_8.5x11in");
        assert_eq!(ipp_media_name("custom_100x100mm"), "custom_100x100mm");
    }

    fn job_group(attributes: Vec<IppAttribute>) -> IppAttributeGroup {
        let mut group = IppAttributeGroup::new(DelimiterTag::JobAttributes);
        for attribute in attributes {
            group
                .attributes_mut()
                .insert(attribute.name().to_string(), attribute);
        }
        group
    }

    #[test]
    fn get_jobs_response_lists_the_queue() {
        let mut attrs = IppAttributes::new();
        attrs.groups_mut().push(job_group(vec![
            IppAttribute::new("job-id", IppValue::Integer(12)),
            IppAttribute::new("job-state", IppValue::Enum(JOB_PROCESSING)),
            IppAttribute::new("job-name", IppValue::NameWithoutLanguage("report.pdf".into())),
            IppAttribute::new(
                "job-originating-user-name",
                IppValue::NameWithoutLanguage("alice".into()),
            ),
            IppAttribute::new("job-k-octets", IppValue::Integer(3)),
        ]));
        attrs.groups_mut().push(job_group(vec![
            IppAttribute::new("job-id", IppValue::Integer(13)),
            IppAttribute::new("job-state", IppValue::Enum(JOB_PENDING)),
        ]));
        attrs
            .groups_mut()
            .push(job_group(vec![IppAttribute::new("job-state", IppValue::Enum(JOB_PENDING))]));

        let jobs: Vec<RemoteJob> = parse_jobs(&attrs).into_iter().map(IppJob::into_remote).collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            jobs[0],
            RemoteJob {
                id: "12".into(),
                owner: Some("alice".into()),
                document: Some("report.pdf".into()),
                size_bytes: Some(3 * 1024),
                printing: true,
            }
        );
        assert!(!jobs[1].printing);
        assert!(jobs[1].document.is_none());
    }

    #[tokio::test]
    async fn queue_management_needs_a_uri() {
        let target = PrinterTarget {
            name: "Lobby".into(),
            uri: None,
        };
        assert!(matches!(
            IppBackend::new().clear_queue(&target).await,
            Err(EdgePrintError::PrinterNotFound(_))
        ));
        assert!(matches!(
            IppBackend::new().remove_job(&target, "12").await,
            Err(EdgePrintError::PrinterNotFound(_))
        ));
    }

    #[test]
    fn image_mime_is_sniffed() {
        let png = crate::document::samples::small_png();
        assert_eq!(document_format(PayloadKind::Image, &png), "image/png");
        assert_eq!(document_format(PayloadKind::Image, b"??"), "application/octet-stream");
        assert_eq!(document_format(PayloadKind::Pdf, b""), "application/pdf");
    }
}
