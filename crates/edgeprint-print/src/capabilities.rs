// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer capability parsing and print option validation.
//
// Capabilities arrive in two shapes: loosely-typed discovery metadata (mDNS
// TXT records, spooler properties) and CUPS `lpoptions -l` listings.  Both are
// turned into a sparse `PrinterCapabilities`; anything absent stays unknown
// and unknown capabilities never block a job.

use tracing::debug;

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{
    CapabilitySnapshot, DuplexMode, MetaValue, MetadataExt, PrintOptions, PrinterCapabilities,
    PrinterMetadata,
};

/// Derive capabilities from announced metadata.
pub fn capabilities_from_metadata(meta: &PrinterMetadata) -> PrinterCapabilities {
    let max_copies = meta
        .number("max-copies")
        .or_else(|| {
            // IPP style "1-99" range.
            meta.text("copies-supported")
                .and_then(|v| v.split('-').next_back().and_then(|n| n.trim().parse().ok()))
        })
        .filter(|n| *n >= 1.0)
        .map(|n| n as u32);

    PrinterCapabilities {
        color: meta.flag("color"),
        duplex: meta.flag("duplex"),
        paper_sizes: meta.list("paper-sizes"),
        media_types: meta.list("media-types"),
        resolutions: meta.list("resolutions"),
        max_copies,
    }
}

/// Inverse of [`capabilities_from_metadata`]; only known fields are written.
pub fn capabilities_to_metadata(caps: &PrinterCapabilities) -> PrinterMetadata {
    let mut meta = PrinterMetadata::new();
    let flag = |b: bool| MetaValue::from(if b { "T" } else { "F" });

    if let Some(color) = caps.color {
        meta.insert("color".into(), flag(color));
    }
    if let Some(duplex) = caps.duplex {
        meta.insert("duplex".into(), flag(duplex));
    }
    for (key, list) in [
        ("paper-sizes", &caps.paper_sizes),
        ("media-types", &caps.media_types),
        ("resolutions", &caps.resolutions),
    ] {
        if !list.is_empty() {
            meta.insert(key.into(), MetaValue::from(list.join(",")));
        }
    }
    if let Some(max) = caps.max_copies {
        meta.insert("max-copies".into(), MetaValue::Number(f64::from(max)));
    }
    meta
}

// ---------------------------------------------------------------------------
// lpoptions
// ---------------------------------------------------------------------------

/// Option families reported by `lpoptions -l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionField {
    Resolution,
    PageSize,
    Duplex,
    ColorModel,
    MediaType,
}

/// Vendor-specific readers for `lpoptions -l` output, tried in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorParser {
    /// HiTi dye-sublimation photo printers (e.g. P525L).
    Hiti,
    /// HP LaserJet PPDs.
    HpLaserJet,
    /// Any other CUPS queue.
    GenericCups,
}

impl VendorParser {
    const BY_PRIORITY: [VendorParser; 3] = [Self::Hiti, Self::HpLaserJet, Self::GenericCups];

    /// Pick the first parser that recognises the printer.
    pub fn select(printer: &str) -> Self {
        Self::BY_PRIORITY
            .into_iter()
            .find(|p| p.can_handle(printer))
            .unwrap_or(Self::GenericCups)
    }

    fn can_handle(&self, printer: &str) -> bool {
        let lower = printer.to_ascii_lowercase();
        match self {
            Self::Hiti => printer.contains("P525L") || lower.contains("hiti"),
            Self::HpLaserJet => lower.contains("hp") && lower.contains("laserjet"),
            Self::GenericCups => true,
        }
    }

    /// Values assumed when the listing lacks an option family.
    fn defaults(&self, field: OptionField) -> &'static [&'static str] {
        use OptionField::*;
        match (self, field) {
            (Self::Hiti, Resolution) => &["Fast", "Normal", "Best"],
            (Self::Hiti, Duplex) => &["None"],
            (Self::Hiti, ColorModel) => &["Color", "Grayscale", "BlackAndWhite"],
            (Self::Hiti, MediaType) => &["Plain", "Photo"],
            (_, Resolution) => &["300dpi", "600dpi", "1200dpi"],
            (_, PageSize) => &["A4", "Letter", "Legal"],
            (_, Duplex) => &["None", "DuplexNoTumble", "DuplexTumble"],
            (_, ColorModel) => &["Gray", "RGB"],
            (_, MediaType) => &["Plain", "Cardstock", "Transparency"],
        }
    }

    /// Which family an option label belongs to, if any.
    fn field_for(&self, label: &str) -> Option<OptionField> {
        let has = |needle: &str| label.contains(needle);
        match self {
            Self::Hiti => {
                if has("hpoutputquality") || has("printquality") {
                    Some(OptionField::Resolution)
                } else if has("pagesize") || has("media size") {
                    Some(OptionField::PageSize)
                } else if has("hpcoloroutput") || has("colormode") {
                    Some(OptionField::ColorModel)
                } else if has("mediatype") || has("papertype") {
                    Some(OptionField::MediaType)
                } else {
                    None
                }
            }
            Self::HpLaserJet => {
                if has("resolution") {
                    Some(OptionField::Resolution)
                } else if has("pagesize") || has("papersize") {
                    Some(OptionField::PageSize)
                } else if has("duplex") {
                    Some(OptionField::Duplex)
                } else if has("colormodel") {
                    Some(OptionField::ColorModel)
                } else if has("mediatype") {
                    Some(OptionField::MediaType)
                } else {
                    None
                }
            }
            Self::GenericCups => {
                if has("resolution") || has("printquality") {
                    Some(OptionField::Resolution)
                } else if has("pagesize") || has("papersize") || has("media size") {
                    Some(OptionField::PageSize)
                } else if has("duplex") {
                    Some(OptionField::Duplex)
                } else if has("colormodel") || has("colormode") || has("output mode") {
                    Some(OptionField::ColorModel)
                } else if has("mediatype") || has("media type") {
                    Some(OptionField::MediaType)
                } else {
                    None
                }
            }
        }
    }
}

/// Split one `Name/Label: *Default Other` line into its label and values.
fn parse_line(line: &str) -> Option<(String, Vec<String>)> {
    let (label, values) = line.split_once(':')?;
    let values: Vec<String> = values
        .split_whitespace()
        .map(|v| v.trim_start_matches('*').to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some((label.trim().to_ascii_lowercase(), values))
}

/// Parse `lpoptions -p <printer> -l` output into capabilities.
pub fn parse_lpoptions(printer: &str, output: &str) -> PrinterCapabilities {
    let parser = VendorParser::select(printer);
    debug!(printer, parser = ?parser, "parsing lpoptions listing");

    let mut found: Vec<(OptionField, Vec<String>)> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((label, values)) = parse_line(line) else {
            continue;
        };
        if let Some(field) = parser.field_for(&label) {
            found.retain(|(f, _)| *f != field);
            found.push((field, values));
        }
    }

    let values = |field: OptionField| -> Vec<String> {
        found
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| parser.defaults(field).iter().map(|s| s.to_string()).collect())
    };

    let duplex_values = values(OptionField::Duplex);
    let color_values = values(OptionField::ColorModel);

    PrinterCapabilities {
        color: Some(color_values.iter().any(|v| !is_mono_keyword(v))),
        duplex: Some(
            duplex_values
                .iter()
                .any(|v| !matches!(DuplexMode::parse(v), Some(DuplexMode::Simplex) | None)),
        ),
        paper_sizes: values(OptionField::PageSize),
        media_types: values(OptionField::MediaType),
        resolutions: values(OptionField::Resolution),
        max_copies: None,
    }
}

fn is_mono_keyword(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "gray" | "grey" | "grayscale" | "greyscale" | "blackandwhite" | "mono" | "monochrome"
            | "kgray" | "black"
    )
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn listed(list: &[String], wanted: &str) -> bool {
    list.is_empty() || list.iter().any(|s| s.eq_ignore_ascii_case(wanted))
}

/// Check requested options against the capabilities captured at acceptance.
///
/// Only options that contradict a *known* capability are rejected.
pub fn validate_options(options: &PrintOptions, snapshot: &CapabilitySnapshot) -> Result<()> {
    let caps = &snapshot.capabilities;
    let reject = |msg: String| Err(EdgePrintError::UnsupportedOption(msg));

    if options.copies == 0 {
        return reject("copies must be at least 1".into());
    }
    if let Some(max) = caps.max_copies
        && options.copies > max
    {
        return reject(format!(
            "{} copies requested, {} supports at most {max}",
            options.copies, snapshot.printer
        ));
    }
    if options.color == Some(true) && caps.color == Some(false) {
        return reject(format!("{} prints in monochrome only", snapshot.printer));
    }
    if matches!(options.duplex, Some(DuplexMode::LongEdge | DuplexMode::ShortEdge))
        && caps.duplex == Some(false)
    {
        return reject(format!("{} prints one-sided only", snapshot.printer));
    }
    if let Some(paper) = &options.paper_size
        && !listed(&caps.paper_sizes, paper)
    {
        return reject(format!("paper size '{paper}' not supported by {}", snapshot.printer));
    }
    if let Some(media) = &options.media_type
        && !listed(&caps.media_types, media)
    {
        return reject(format!("media type '{media}' not supported by {}", snapshot.printer));
    }
    if let Some(resolution) = &options.resolution
        && !listed(&caps.resolutions, resolution)
    {
        return reject(format!(
            "resolution '{resolution}' not supported by {}",
            snapshot.printer
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const HP_LISTING: &str = "\
PageSize/Media Size: *Letter Legal A4 Executive
Duplex/2-Sided Printing: *None DuplexNoTumble DuplexTumble
Resolution/Resolution: 300dpi *600dpi
InputSlot/Media Source: *Auto Tray1 Tray2
";

    fn snapshot(caps: PrinterCapabilities) -> CapabilitySnapshot {
        CapabilitySnapshot {
            printer: "P1".into(),
            uri: None,
            capabilities: caps,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn parser_selection_by_priority() {
        assert_eq!(VendorParser::select("HiTi_P525L"), VendorParser::Hiti);
        assert_eq!(VendorParser::select("HP_LaserJet_Pro_M404"), VendorParser::HpLaserJet);
        assert_eq!(VendorParser::select("HP_OfficeJet"), VendorParser::GenericCups);
        assert_eq!(VendorParser::select("Brother_HL"), VendorParser::GenericCups);
    }

    #[test]
    fn hp_listing_parsed_with_defaults_for_missing_fields() {
        let caps = parse_lpoptions("HP_LaserJet_M404", HP_LISTING);
        assert_eq!(caps.paper_sizes, vec!["Letter", "Legal", "A4", "Executive"]);
        assert_eq!(caps.resolutions, vec!["300dpi", "600dpi"]);
        assert_eq!(caps.duplex, Some(true));
        // No ColorModel line: the Gray/RGB default applies.
        assert_eq!(caps.color, Some(true));
        assert_eq!(caps.media_types, vec!["Plain", "Cardstock", "Transparency"]);
    }

    #[test]
    fn hiti_defaults_are_simplex() {
        let caps = parse_lpoptions("hiti-p525l", "PrintQuality/Quality: Fast *Best\n");
        assert_eq!(caps.duplex, Some(false));
        assert_eq!(caps.resolutions, vec!["Fast", "Best"]);
        assert_eq!(caps.media_types, vec!["Plain", "Photo"]);
    }

    #[test]
    fn mono_printer_detected() {
        let caps = parse_lpoptions("Brother", "ColorModel/Color Mode: *Gray\n");
        assert_eq!(caps.color, Some(false));
    }

    #[test]
    fn metadata_round_trip_preserves_known_fields() {
        let caps = PrinterCapabilities {
            color: Some(false),
            duplex: Some(true),
            paper_sizes: vec!["A4".into(), "Letter".into()],
            media_types: Vec::new(),
            resolutions: vec!["600dpi".into()],
            max_copies: Some(99),
        };
        let meta = capabilities_to_metadata(&caps);
        assert!(!meta.contains_key("media-types"));
        assert_eq!(capabilities_from_metadata(&meta), caps);
    }

    #[test]
    fn copies_range_from_ipp_attribute() {
        let mut meta = PrinterMetadata::new();
        meta.insert("copies-supported".into(), "1-50".into());
        assert_eq!(capabilities_from_metadata(&meta).max_copies, Some(50));
    }

    #[test]
    fn unknown_capabilities_allow_everything() {
        let options = PrintOptions {
            copies: 500,
            color: Some(true),
            duplex: Some(DuplexMode::ShortEdge),
            paper_size: Some("A3".into()),
            media_type: Some("Photo".into()),
            ..PrintOptions::default()
        };
        assert!(validate_options(&options, &snapshot(PrinterCapabilities::default())).is_ok());
    }

    #[test]
    fn known_limits_are_enforced() {
        let caps = PrinterCapabilities {
            color: Some(false),
            duplex: Some(false),
            paper_sizes: vec!["A4".into()],
            max_copies: Some(10),
            ..PrinterCapabilities::default()
        };
        let snap = snapshot(caps);
        let check = |options: PrintOptions| validate_options(&options, &snap);

        assert!(check(PrintOptions::default()).is_ok());
        assert!(check(PrintOptions { paper_size: Some("a4".into()), ..Default::default() }).is_ok());
        assert!(check(PrintOptions { duplex: Some(DuplexMode::Simplex), ..Default::default() }).is_ok());

        for bad in [
            PrintOptions { copies: 0, ..Default::default() },
            PrintOptions { copies: 11, ..Default::default() },
            PrintOptions { color: Some(true), ..Default::default() },
            PrintOptions { duplex: Some(DuplexMode::LongEdge), ..Default::default() },
            PrintOptions { paper_size: Some("Letter".into()), ..Default::default() },
        ] {
            assert!(matches!(check(bad), Err(EdgePrintError::UnsupportedOption(_))));
        }
    }
}
