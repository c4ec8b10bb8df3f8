//! PDF extraction
//!
//! Produces exactly one [`ExtractedPage`] per PDF page. The text layer is
//! used when the first pages carry text and it is preferred; otherwise every
//! page goes through rasterize + OCR, degrading per page to the text layer
//! and finally to an empty placeholder.

mod ocr;
mod text_layer;

pub use ocr::*;
pub use text_layer::*;

use crate::config::ExtractConfig;
use crate::error::{Error, Result};
use crate::progress::{advance_progress, finish_progress, start_progress};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// A run of text drawn with one font size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub font_size: f32,
}

/// Where a page's text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    TextLayer,
    Ocr,
    /// OCR failed; the text layer stood in
    DirectFallback,
    /// Nothing could be read; keeps page numbering contiguous
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    /// 1-based
    pub page_num: u32,
    pub text: String,
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
    pub source: PageSource,
}

impl ExtractedPage {
    fn placeholder(page_num: u32) -> Self {
        Self {
            page_num,
            text: String::new(),
            blocks: Vec::new(),
            source: PageSource::Placeholder,
        }
    }
}

pub struct PdfExtractor {
    config: ExtractConfig,
    rasterizer: Arc<dyn Rasterizer>,
    ocr: Arc<dyn OcrEngine>,
}

impl PdfExtractor {
    pub fn new(
        config: ExtractConfig,
        rasterizer: Arc<dyn Rasterizer>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            config,
            rasterizer,
            ocr,
        }
    }

    /// Extractor backed by the configured `pdftoppm` and `tesseract` binaries
    pub fn from_config(config: &ExtractConfig) -> Self {
        Self::new(
            config.clone(),
            Arc::new(PdftoppmRasterizer::new(&config.pdftoppm_bin)),
            Arc::new(TesseractOcr::new(&config.tesseract_bin)),
        )
    }

    pub async fn extract(&self, bytes: Arc<Vec<u8>>) -> Result<Vec<ExtractedPage>> {
        let layer_bytes = bytes.clone();
        let layer = tokio::task::spawn_blocking(move || TextLayer::load(&layer_bytes))
            .await
            .map_err(|e| Error::Pdf(format!("Text extraction task failed: {}", e)))??;

        if self.use_text_layer(&layer) {
            info!("Using text layer for {} pages", layer.page_count());
            return Ok(text_layer_pages(layer));
        }

        info!(
            "Using OCR ({}, {} dpi) for {} pages",
            self.config.language,
            self.config.ocr_dpi,
            layer.page_count()
        );
        self.extract_ocr(&bytes, &layer).await
    }

    fn use_text_layer(&self, layer: &TextLayer) -> bool {
        self.config.prefer_text
            && !self.config.ocr_forced()
            && layer.has_text(self.config.text_probe_pages)
    }

    async fn extract_ocr(&self, bytes: &[u8], layer: &TextLayer) -> Result<Vec<ExtractedPage>> {
        let mut pdf_file = NamedTempFile::new()?;
        pdf_file.write_all(bytes)?;
        pdf_file.flush()?;

        let total = layer.page_count();
        let progress = start_progress(total, "OCR pages");
        let mut pages = Vec::with_capacity(total);

        for page_num in (1..=total).map(|n| n as u32) {
            let page = match self.ocr_page(pdf_file.path(), page_num).await {
                Ok(text) => ExtractedPage {
                    page_num,
                    text,
                    blocks: Vec::new(),
                    source: PageSource::Ocr,
                },
                Err(e) => {
                    warn!("OCR failed on page {}: {}", page_num, e);
                    match layer.page_text(page_num) {
                        Some(text) => ExtractedPage {
                            page_num,
                            text: text.to_string(),
                            blocks: Vec::new(),
                            source: PageSource::DirectFallback,
                        },
                        None => {
                            warn!("Page {} left empty", page_num);
                            ExtractedPage::placeholder(page_num)
                        }
                    }
                }
            };
            pages.push(page);
            advance_progress(&progress);
        }

        finish_progress(progress, "OCR complete");
        Ok(pages)
    }

    async fn ocr_page(&self, pdf_path: &std::path::Path, page_num: u32) -> Result<String> {
        let png = self
            .rasterizer
            .render_page(pdf_path, page_num, self.config.ocr_dpi)
            .await?;
        check_image(&png)?;
        self.ocr.recognize(&png, &self.config.language).await
    }
}

fn text_layer_pages(layer: TextLayer) -> Vec<ExtractedPage> {
    layer
        .pages()
        .iter()
        .enumerate()
        .map(|(i, page)| ExtractedPage {
            page_num: i as u32 + 1,
            text: page.text.clone().unwrap_or_default(),
            blocks: page.blocks.clone(),
            source: PageSource::TextLayer,
        })
        .collect()
}
