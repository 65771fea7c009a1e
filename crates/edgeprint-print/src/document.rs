// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Payload inspection before a document is handed to the print subsystem.
//
// PDFs are opened with `lopdf` and must have at least one page; images must
// have a decodable header.  Anything else is rejected as `PayloadRejected`,
// a terminal error for the job.

use std::path::Path;

use lopdf::Document;
use tracing::{debug, instrument};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::PayloadKind;

/// What inspection learned about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentInfo {
    Pdf { pages: usize },
    Image { width: u32, height: u32 },
}

/// Inspect a spooled payload file.
#[instrument(skip_all, fields(kind = ?kind, path = %path.display()))]
pub fn inspect(kind: PayloadKind, path: &Path) -> Result<DocumentInfo> {
    match kind {
        PayloadKind::Pdf => {
            let document = Document::load(path)
                .map_err(|e| EdgePrintError::PayloadRejected(format!("unreadable PDF: {e}")))?;
            let pages = document.get_pages().len();
            if pages == 0 {
                return Err(EdgePrintError::PayloadRejected("PDF has no pages".into()));
            }
            debug!(pages, "PDF inspected");
            Ok(DocumentInfo::Pdf { pages })
        }
        PayloadKind::Image => {
            let (width, height) = image::ImageReader::open(path)?
                .with_guessed_format()?
                .into_dimensions()
                .map_err(|e| EdgePrintError::PayloadRejected(format!("unreadable image: {e}")))?;
            if width == 0 || height == 0 {
                return Err(EdgePrintError::PayloadRejected("image is empty".into()));
            }
            debug!(width, height, "image inspected");
            Ok(DocumentInfo::Image { width, height })
        }
    }
}

#[cfg(test)]
pub(crate) mod samples {
    use std::io::Cursor;

    use lopdf::{Object, Stream, dictionary};

    /// A minimal valid single-page A4 PDF.
    pub(crate) fn one_page_pdf() -> Vec<u8> {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("serialize PDF");
        bytes
    }

    /// A 4x3 PNG.
    pub(crate) fn small_png() -> Vec<u8> {
        let img = image::RgbImage::new(4, 3);
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png)
            .expect("encode PNG");
        bytes.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).expect("write");
        path
    }

    #[test]
    fn valid_pdf_reports_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "doc.pdf", &samples::one_page_pdf());
        assert_eq!(
            inspect(PayloadKind::Pdf, &path).expect("inspect"),
            DocumentInfo::Pdf { pages: 1 }
        );
    }

    #[test]
    fn valid_png_reports_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "img.img", &samples::small_png());
        assert_eq!(
            inspect(PayloadKind::Image, &path).expect("inspect"),
            DocumentInfo::Image { width: 4, height: 3 }
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pdf = write(dir.path(), "bad.pdf", b"%PDF-1.4 truncated");
        let img = write(dir.path(), "bad.img", b"not an image at all");

        assert!(matches!(
            inspect(PayloadKind::Pdf, &pdf),
            Err(EdgePrintError::PayloadRejected(_))
        ));
        assert!(matches!(
            inspect(PayloadKind::Image, &img),
            Err(EdgePrintError::PayloadRejected(_))
        ));
    }
}
