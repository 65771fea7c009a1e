// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Edgeprint print service.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a print job.
///
/// Assigned by the job queue at acceptance; strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// Reachability state of a known printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Online,
    Offline,
    Busy,
    Error,
}

impl PrinterState {
    /// Whether jobs may be handed to this printer. Only `Offline` holds work back.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Map a free-form state hint (`lpstat`, spooler, TXT record) to a state.
    ///
    /// Unknown hints count as `Online`: the printer was just announced.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "printing" | "processing" | "busy" => Self::Busy,
            "offline" | "disabled" | "unreachable" => Self::Offline,
            "error" | "stopped" => Self::Error,
            _ => Self::Online,
        }
    }
}

/// Where a printer entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterSource {
    /// A queue installed in the host print subsystem (CUPS, Windows spooler).
    Local,
    /// Announced on the LAN via mDNS.
    Network,
}

/// A single loosely-typed metadata value from a printer advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Text(String),
}

impl MetaValue {
    /// String form of the value; integral numbers print without a fraction.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

/// Open mapping of capability hints announced by a discovery source.
pub type PrinterMetadata = BTreeMap<String, MetaValue>;

/// Case-insensitive typed lookups over [`PrinterMetadata`].
///
/// Absent or unparsable keys yield `None` / an empty list ("unknown"), never
/// an error.
pub trait MetadataExt {
    fn value(&self, key: &str) -> Option<&MetaValue>;

    fn text(&self, key: &str) -> Option<String> {
        self.value(key)
            .map(MetaValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(MetaValue::as_number)
    }

    /// IPP Everywhere TXT records use "T"/"F"; also accept true/false/1/0.
    fn flag(&self, key: &str) -> Option<bool> {
        let text = self.text(key)?;
        match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" => Some(true),
            "f" | "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }

    /// Comma- or semicolon-separated list.
    fn list(&self, key: &str) -> Vec<String> {
        self.text(key)
            .map(|v| {
                v.split([',', ';'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MetadataExt for PrinterMetadata {
    fn value(&self, key: &str) -> Option<&MetaValue> {
        self.get(key).or_else(|| {
            self.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }
}

/// Sparse capability set. `None` or an empty list means "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    pub color: Option<bool>,
    pub duplex: Option<bool>,
    pub paper_sizes: Vec<String>,
    pub media_types: Vec<String>,
    pub resolutions: Vec<String>,
    pub max_copies: Option<u32>,
}

/// A printer known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
    /// Stable identity (mDNS instance name or local queue name).
    pub identity: String,
    pub display_name: String,
    /// Direct IPP URI, when the printer announced one.
    pub uri: Option<String>,
    pub location: Option<String>,
    pub make_and_model: Option<String>,
    pub source: PrinterSource,
    pub capabilities: PrinterCapabilities,
    /// Raw metadata as last announced.
    pub metadata: PrinterMetadata,
    pub state: PrinterState,
    pub last_seen: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Immutable copy of a printer's capabilities taken when a job is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub printer: String,
    pub uri: Option<String>,
    pub capabilities: PrinterCapabilities,
    pub taken_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    pub fn of(printer: &Printer) -> Self {
        Self {
            printer: printer.identity.clone(),
            uri: printer.uri.clone(),
            capabilities: printer.capabilities.clone(),
            taken_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Supported payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Pdf,
    Image,
}

impl PayloadKind {
    /// Infer the kind from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "png" | "jpg" | "jpeg" | "bmp" | "gif" | "tif" | "tiff" | "webp" => Some(Self::Image),
            _ => None,
        }
    }

    /// Detect the kind from the leading bytes of a document.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        // Some generators emit junk before the header; readers scan the
        // first kilobyte for it.
        let head = &bytes[..bytes.len().min(1024)];
        if head.windows(5).any(|w| w == b"%PDF-") {
            return Some(Self::Pdf);
        }

        let is_image = bytes.starts_with(b"\x89PNG\r\n\x1a\n")
            || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
            || bytes.starts_with(b"GIF87a")
            || bytes.starts_with(b"GIF89a")
            || bytes.starts_with(b"BM")
            || bytes.starts_with(b"II*\0")
            || bytes.starts_with(b"MM\0*")
            || (bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP");
        is_image.then_some(Self::Image)
    }

    /// Parse a user-supplied kind name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pdf" | "application/pdf" => Some(Self::Pdf),
            "image" | "img" => Some(Self::Image),
            other if other.starts_with("image/") => Some(Self::Image),
            other => Self::from_extension(other),
        }
    }

    /// File extension used for spooled payloads.
    pub fn spool_extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "img",
        }
    }
}

/// Duplex printing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplexMode {
    Simplex,
    LongEdge,
    ShortEdge,
}

impl DuplexMode {
    /// IPP / CUPS `sides` keyword (RFC 8011 §5.2.8).
    pub fn sides_keyword(&self) -> &'static str {
        match self {
            Self::Simplex => "one-sided",
            Self::LongEdge => "two-sided-long-edge",
            Self::ShortEdge => "two-sided-short-edge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simplex" | "none" | "one-sided" | "off" => Some(Self::Simplex),
            "long-edge" | "long_edge" | "longedge" | "duplexnotumble" | "two-sided-long-edge"
            | "on" => Some(Self::LongEdge),
            "short-edge" | "short_edge" | "shortedge" | "duplextumble"
            | "two-sided-short-edge" => Some(Self::ShortEdge),
            _ => None,
        }
    }
}

/// Print settings requested for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintOptions {
    pub copies: u32,
    /// `Some(true)` colour, `Some(false)` monochrome, `None` printer default.
    pub color: Option<bool>,
    pub duplex: Option<DuplexMode>,
    pub paper_size: Option<String>,
    pub media_type: Option<String>,
    pub resolution: Option<String>,
    /// Raw `key=value` options passed straight to the print subsystem.
    pub extra: BTreeMap<String, String>,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            copies: 1,
            color: None,
            duplex: None,
            paper_size: None,
            media_type: None,
            resolution: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the FIFO for its printer.
    Queued,
    /// Handed to the print subsystem; being polled.
    Dispatching,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed edges of the job state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Dispatching)
                | (Queued, Cancelled)
                | (Dispatching, Queued)
                | (Dispatching, Completed)
                | (Dispatching, Failed)
                | (Dispatching, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "dispatching" => Some(Self::Dispatching),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Subsystem down, printer unreachable; safe to retry automatically.
    Transient,
    /// Retrying with the same payload and options cannot succeed.
    Permanent,
}

/// Reference to a job's spooled payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 of the payload bytes, lowercase hex.
    pub sha256: String,
}

/// Opaque handle returned by a backend for status polling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendTicket {
    /// Queue name or printer URI the job was sent to.
    pub target: String,
    /// Identifier assigned by the print subsystem.
    pub remote_id: String,
}

impl std::fmt::Display for BackendTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.target, self.remote_id)
    }
}

/// A print job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    /// Target printer identity.
    pub printer: String,
    pub document_name: String,
    pub payload_kind: PayloadKind,
    pub payload: PayloadRef,
    pub options: PrintOptions,
    pub snapshot: CapabilitySnapshot,
    pub state: JobState,
    /// Number of dispatch attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub ticket: Option<BackendTicket>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrintJob {
    pub fn new(
        id: JobId,
        document_name: String,
        payload_kind: PayloadKind,
        payload: PayloadRef,
        options: PrintOptions,
        snapshot: CapabilitySnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            printer: snapshot.printer.clone(),
            document_name,
            payload_kind,
            payload,
            options,
            snapshot,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            error_class: None,
            ticket: None,
            submitted_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_detects_pdf_and_images() {
        assert_eq!(PayloadKind::sniff(b"%PDF-1.7\n..."), Some(PayloadKind::Pdf));
        assert_eq!(PayloadKind::sniff(b"\n\n%PDF-1.4"), Some(PayloadKind::Pdf));
        assert_eq!(
            PayloadKind::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(PayloadKind::Image)
        );
        assert_eq!(PayloadKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(PayloadKind::Image));
        assert_eq!(PayloadKind::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(PayloadKind::Image));
        assert_eq!(PayloadKind::sniff(b"PK\x03\x04 docx"), None);
        assert_eq!(PayloadKind::sniff(b""), None);
    }

    #[test]
    fn extension_and_name_parsing() {
        assert_eq!(PayloadKind::from_extension("PDF"), Some(PayloadKind::Pdf));
        assert_eq!(PayloadKind::from_extension(".jpeg"), Some(PayloadKind::Image));
        assert_eq!(PayloadKind::from_extension("docx"), None);
        assert_eq!(PayloadKind::parse("image/png"), Some(PayloadKind::Image));
        assert_eq!(PayloadKind::parse("application/pdf"), Some(PayloadKind::Pdf));
    }

    #[test]
    fn state_machine_edges() {
        use JobState::*;
        assert!(Queued.can_transition_to(Dispatching));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Dispatching.can_transition_to(Queued));
        assert!(Dispatching.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Dispatching, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn metadata_lookups_are_case_insensitive_and_lenient() {
        let mut meta = PrinterMetadata::new();
        meta.insert("Color".into(), "T".into());
        meta.insert("max-copies".into(), MetaValue::Number(99.0));
        meta.insert("paper-sizes".into(), "A4, Letter;;Legal".into());
        meta.insert("duplex".into(), "maybe".into());

        assert_eq!(meta.flag("color"), Some(true));
        assert_eq!(meta.number("MAX-COPIES"), Some(99.0));
        assert_eq!(meta.text("max-copies").as_deref(), Some("99"));
        assert_eq!(meta.list("paper-sizes"), vec!["A4", "Letter", "Legal"]);
        assert_eq!(meta.flag("duplex"), None);
        assert_eq!(meta.text("location"), None);
        assert!(meta.list("media-types").is_empty());
    }

    #[test]
    fn state_hints() {
        assert_eq!(PrinterState::from_hint("idle"), PrinterState::Online);
        assert_eq!(PrinterState::from_hint("Printing"), PrinterState::Busy);
        assert_eq!(PrinterState::from_hint("disabled"), PrinterState::Offline);
        assert_eq!(PrinterState::from_hint("stopped"), PrinterState::Error);
        assert!(PrinterState::Error.is_reachable());
        assert!(!PrinterState::Offline.is_reachable());
    }

    #[test]
    fn duplex_parsing_accepts_cups_names() {
        assert_eq!(DuplexMode::parse("DuplexNoTumble"), Some(DuplexMode::LongEdge));
        assert_eq!(DuplexMode::parse("DuplexTumble"), Some(DuplexMode::ShortEdge));
        assert_eq!(DuplexMode::parse("None"), Some(DuplexMode::Simplex));
        assert_eq!(DuplexMode::parse("sideways"), None);
    }
}
