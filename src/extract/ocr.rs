//! OCR path: rasterize a page, then recognize its text
//!
//! Both steps shell out (`pdftoppm`, `tesseract`) through small traits so the
//! extractor can be driven by in-process fakes in tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

/// Renders one page of a PDF on disk to PNG bytes
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn render_page(&self, pdf_path: &Path, page_num: u32, dpi: u32) -> Result<Vec<u8>>;
}

/// Recognizes text in a page image
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, png: &[u8], language: &str) -> Result<String>;
}

/// `pdftoppm` (poppler-utils) rasterizer
pub struct PdftoppmRasterizer {
    bin: String,
}

impl PdftoppmRasterizer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn render_page(&self, pdf_path: &Path, page_num: u32, dpi: u32) -> Result<Vec<u8>> {
        let out_dir = TempDir::new()?;
        let prefix = out_dir.path().join("page");
        let page = page_num.to_string();

        let output = Command::new(&self.bin)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page)
            .arg("-l")
            .arg(&page)
            .arg("-singlefile")
            .arg(pdf_path)
            .arg(&prefix)
            .output()
            .await
            .map_err(|e| Error::Ocr(format!("Failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            return Err(Error::Ocr(format!(
                "{} failed on page {}: {}",
                self.bin,
                page_num,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let png = tokio::fs::read(prefix.with_extension("png"))
            .await
            .map_err(|e| Error::Ocr(format!("No image rendered for page {}: {}", page_num, e)))?;
        debug!("Rendered page {} ({} bytes)", page_num, png.len());
        Ok(png)
    }
}

/// Tesseract CLI engine
pub struct TesseractOcr {
    bin: String,
}

impl TesseractOcr {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, png: &[u8], language: &str) -> Result<String> {
        let work_dir = TempDir::new()?;
        let image_path = work_dir.path().join("page.png");
        tokio::fs::write(&image_path, png).await?;

        // --psm 1: automatic page segmentation with orientation detection
        let output = Command::new(&self.bin)
            .arg(&image_path)
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .arg("--psm")
            .arg("1")
            .output()
            .await
            .map_err(|e| Error::Ocr(format!("Failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            return Err(Error::Ocr(format!(
                "{} failed: {}",
                self.bin,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Reject truncated or corrupt renders before they reach the OCR engine
pub fn check_image(png: &[u8]) -> Result<()> {
    image::load_from_memory(png)
        .map(|_| ())
        .map_err(|e| Error::Ocr(format!("Corrupt page image: {}", e)))
}
