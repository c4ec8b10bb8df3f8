//! Direct text-layer extraction
//!
//! `lopdf` supplies per-page text and font-sized text blocks. When it cannot
//! open the document, `pdf-extract` is tried and its output split on form
//! feeds into pages (no blocks in that case).

use super::TextBlock;
use crate::error::{Error, Result};
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};
use tracing::{debug, warn};

/// One page of the text layer
#[derive(Debug, Clone, Default)]
pub struct LayerPage {
    /// Extracted text, `None` when extraction failed for this page
    pub text: Option<String>,
    pub blocks: Vec<TextBlock>,
}

impl LayerPage {
    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextLayer {
    pages: Vec<LayerPage>,
}

impl TextLayer {
    /// Load every page's text layer. Fails only when no extractor can open
    /// the document at all.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        match Document::load_mem(bytes) {
            Ok(doc) => Ok(Self::from_document(&doc)),
            Err(lopdf_err) => {
                warn!("lopdf could not open PDF ({}), trying pdf-extract", lopdf_err);
                let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
                    Error::Pdf(format!(
                        "Failed to open PDF. lopdf: {}; pdf-extract: {}",
                        lopdf_err, e
                    ))
                })?;
                Ok(Self::from_form_feeds(&text))
            }
        }
    }

    fn from_document(doc: &Document) -> Self {
        let pages = doc
            .get_pages()
            .into_iter()
            .map(|(page_num, page_id)| {
                let text = match doc.extract_text(&[page_num]) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        debug!("No text layer on page {}: {}", page_num, e);
                        None
                    }
                };
                let blocks = page_blocks(doc, page_id);
                // Keep line structure when the extractor ran blocks together
                let text = match text {
                    Some(t) if !t.trim().contains('\n') && blocks.len() > 1 => Some(
                        blocks
                            .iter()
                            .map(|b| b.text.as_str())
                            .collect::<Vec<_>>()
                            .join("\n"),
                    ),
                    other => other,
                };
                LayerPage { text, blocks }
            })
            .collect();
        Self { pages }
    }

    fn from_form_feeds(text: &str) -> Self {
        let mut parts: Vec<&str> = text.split('\x0C').collect();
        // pdf-extract ends the last page with a form feed too
        if parts.len() > 1 && parts.last().is_some_and(|p| p.trim().is_empty()) {
            parts.pop();
        }
        Self {
            pages: parts
                .into_iter()
                .map(|p| LayerPage {
                    text: Some(p.to_string()),
                    blocks: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[LayerPage] {
        &self.pages
    }

    /// Text of a 1-based page, if it has any
    pub fn page_text(&self, page_num: u32) -> Option<&str> {
        let page = self.pages.get((page_num as usize).checked_sub(1)?)?;
        page.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Whether any of the first `probe` pages carries text
    pub fn has_text(&self, probe: usize) -> bool {
        self.pages.iter().take(probe).any(LayerPage::has_text)
    }
}

/// Text blocks (BT..ET runs) with the font size in effect
fn page_blocks(doc: &Document, page_id: ObjectId) -> Vec<TextBlock> {
    let content = match doc
        .get_page_content(page_id)
        .map_err(|e| e.to_string())
        .and_then(|raw| Content::decode(&raw).map_err(|e| e.to_string()))
    {
        Ok(content) => content,
        Err(e) => {
            debug!("Could not decode page content: {}", e);
            return Vec::new();
        }
    };

    let mut blocks = Vec::new();
    let mut font_size = 0.0f32;
    let mut current = String::new();

    let mut flush = |current: &mut String, font_size: f32| {
        let text = current.trim();
        if !text.is_empty() {
            blocks.push(TextBlock {
                text: text.to_string(),
                font_size,
            });
        }
        current.clear();
    };

    for op in &content.operations {
        match op.operator.as_str() {
            "BT" | "ET" => flush(&mut current, font_size),
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(number) {
                    if size != font_size {
                        flush(&mut current, font_size);
                    }
                    font_size = size.abs();
                }
            }
            "Td" | "TD" | "T*" | "Tm" => {
                if !current.is_empty() && !current.ends_with('\n') {
                    current.push('\n');
                }
            }
            "Tj" | "'" | "\"" => {
                if let Some(Object::String(bytes, _)) = op.operands.last() {
                    current.push_str(&decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => current.push_str(&decode_pdf_string(bytes)),
                            other => {
                                // Large negative kerning reads as a word gap
                                if number(other).is_some_and(|k| k < -200.0) {
                                    current.push(' ');
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    flush(&mut current, font_size);

    blocks
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Decode a PDF string operand: UTF-16BE with BOM, otherwise Latin-1
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}
