//! Best-effort text extraction for uploaded documents.
//!
//! Extraction never fails: parse and OCR errors degrade to whatever text was
//! recovered (worst case an empty string) and a logged diagnostic. PDFs with
//! a thin or missing native text layer are treated as scanned and fall back
//! to per-page OCR.

use tracing::{debug, warn};

use crate::config::OcrConfig;
use crate::ocr;

pub const MIME_PDF: &str = "application/pdf";

/// Native text with fewer characters than this (after trimming) marks a PDF
/// as likely scanned rather than text-native.
const SCANNED_TEXT_THRESHOLD: usize = 100;

/// Coarse input classes the extractor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image,
    Other,
}

impl SourceKind {
    /// Classify an upload from its declared content type, falling back to
    /// the filename extension.
    pub fn detect(content_type: &str, filename: &str) -> SourceKind {
        if content_type == MIME_PDF {
            return SourceKind::Pdf;
        }
        if content_type.starts_with("image/") {
            return SourceKind::Image;
        }
        let name = filename.to_ascii_lowercase();
        if name.ends_with(".pdf") {
            return SourceKind::Pdf;
        }
        if [".png", ".jpg", ".jpeg", ".tiff", ".tif", ".bmp"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            return SourceKind::Image;
        }
        SourceKind::Other
    }
}

/// Extract plain text from raw document bytes. Always returns a string; an
/// empty result is a valid outcome, not an error.
pub fn extract_text(bytes: &[u8], kind: SourceKind, ocr_config: &OcrConfig) -> String {
    match kind {
        SourceKind::Pdf => extract_pdf(bytes, ocr_config),
        SourceKind::Image => extract_image(bytes, ocr_config),
        SourceKind::Other => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// `extract_text` on a blocking worker thread. PDF parsing and OCR are
/// CPU-bound and must not run on the async scheduler.
pub async fn extract_text_blocking(bytes: Vec<u8>, kind: SourceKind, ocr_config: OcrConfig) -> String {
    match tokio::task::spawn_blocking(move || extract_text(&bytes, kind, &ocr_config)).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "extraction worker panicked");
            String::new()
        }
    }
}

fn extract_pdf(bytes: &[u8], ocr_config: &OcrConfig) -> String {
    let mut text = String::new();

    // pdf-extract can panic on malformed input; isolate it.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(native)) => text = native,
        Ok(Err(e)) => warn!(error = %e, "PDF text layer extraction failed"),
        Err(_) => warn!("PDF text layer extraction panicked"),
    }

    if text.trim().chars().count() < SCANNED_TEXT_THRESHOLD {
        if ocr_config.enabled {
            match ocr::recognize_pdf(bytes, ocr_config) {
                Ok(pages) => {
                    for page in pages {
                        text.push_str(&page);
                        text.push('\n');
                    }
                }
                Err(e) => warn!(error = %e, "OCR fallback failed"),
            }
        } else {
            debug!("PDF looks scanned but OCR is disabled");
        }
    }

    text.trim().to_string()
}

fn extract_image(bytes: &[u8], ocr_config: &OcrConfig) -> String {
    if !ocr_config.enabled {
        debug!("image upload with OCR disabled; no text extracted");
        return String::new();
    }
    match ocr::recognize_image(bytes, ocr_config) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "image OCR failed");
            String::new()
        }
    }
}
