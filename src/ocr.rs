//! Optical character recognition via external CLI tools.
//!
//! Scanned documents are rasterized with poppler's `pdftoppm` and recognized
//! with `tesseract`, one page at a time. Both tools are invoked as
//! subprocesses; nothing here links against native OCR libraries. Callers
//! treat any error as "no OCR text available" and degrade.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::OcrConfig;

/// Rasterize each PDF page and run OCR over it. Returns one string per page
/// in page order.
pub fn recognize_pdf(bytes: &[u8], config: &OcrConfig) -> Result<Vec<String>> {
    let scratch = ScratchDir::create()?;
    let input = scratch.path().join("input.pdf");
    std::fs::write(&input, bytes).context("Failed to write PDF to scratch dir")?;

    let prefix = scratch.path().join("page");
    run_tool(
        &config.pdftoppm_path,
        &[
            "-r".to_string(),
            config.dpi.to_string(),
            "-png".to_string(),
            input.display().to_string(),
            prefix.display().to_string(),
        ],
    )
    .context("pdftoppm rasterization failed")?;

    let pages = list_page_images(scratch.path())?;
    if pages.is_empty() {
        bail!("pdftoppm produced no page images");
    }

    let mut out = Vec::with_capacity(pages.len());
    for page in pages {
        out.push(recognize_file(&page, config)?);
    }
    Ok(out)
}

/// Run OCR over a single raster image.
pub fn recognize_image(bytes: &[u8], config: &OcrConfig) -> Result<String> {
    let scratch = ScratchDir::create()?;
    let input = scratch.path().join("input.img");
    std::fs::write(&input, bytes).context("Failed to write image to scratch dir")?;
    recognize_file(&input, config)
}

fn recognize_file(path: &Path, config: &OcrConfig) -> Result<String> {
    let stdout = run_tool(
        &config.tesseract_path,
        &[
            path.display().to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            "eng".to_string(),
        ],
    )
    .context("tesseract recognition failed")?;
    Ok(stdout)
}

fn run_tool(program: &str, args: &[String]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// pdftoppm names output files `<prefix>-<n>.png` with zero-padded page
/// numbers; sort numerically so page 10 follows page 9.
fn list_page_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)
        .context("Failed to list scratch dir")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map(|e| e == "png").unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("page-"))
                    .unwrap_or(false)
        })
        .collect();

    pages.sort_by_key(|path| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("page-"))
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(u32::MAX)
    });

    Ok(pages)
}

/// Private scratch directory removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create() -> Result<ScratchDir> {
        let path = std::env::temp_dir().join(format!("apd-ocr-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).context("Failed to create OCR scratch dir")?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to clean OCR scratch dir");
        }
    }
}
