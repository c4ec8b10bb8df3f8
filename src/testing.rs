//! In-process stand-ins for the external services, plus fixture builders

use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::extract::{OcrEngine, Rasterizer};
use crate::generate::Generator;
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic bag-of-words embedder: each lowercase word hashes into a
/// bucket, and the counts are normalized to unit length.
pub struct FakeEmbedder {
    dim: usize,
    calls: AtomicUsize,
    fail_on: Option<usize>,
    overrides: HashMap<String, Vec<f32>>,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
            fail_on: None,
            overrides: HashMap::new(),
        }
    }

    /// Fail the n-th call (1-based)
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Pin the vector returned for an exact text
    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides.insert(text.to_string(), vector);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.overrides.get(text) {
            return v.clone();
        }

        let mut v = vec![0.0f32; self.dim];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let hash = blake3::hash(word.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dim;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(Error::Embedding(format!("fake failure on call {}", call)));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

/// Generator with a canned reply (or failure) that records every prompt
pub struct FakeGenerator {
    reply: std::result::Result<String, String>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl FakeGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: Err("fake generation outage".to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Recorded `(system, user)` pairs
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        _temperature: f32,
        _json_mode: bool,
    ) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((system.to_string(), user.to_string()));
        }
        self.reply.clone().map_err(Error::Generation)
    }

    fn model_name(&self) -> &str {
        "fake-generator"
    }
}

/// Renders page N as an N-pixel-wide PNG, so the OCR fake can tell pages apart
#[derive(Default)]
pub struct FakeRasterizer {
    fail: HashSet<u32>,
    corrupt: HashSet<u32>,
}

impl FakeRasterizer {
    pub fn failing(pages: &[u32]) -> Self {
        Self {
            fail: pages.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn corrupt(pages: &[u32]) -> Self {
        Self {
            corrupt: pages.iter().copied().collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn render_page(&self, _pdf_path: &Path, page_num: u32, _dpi: u32) -> Result<Vec<u8>> {
        if self.fail.contains(&page_num) {
            return Err(Error::Ocr(format!("fake render failure on page {}", page_num)));
        }
        let mut png = png_with_width(page_num);
        if self.corrupt.contains(&page_num) {
            png.truncate(png.len() / 2);
        }
        Ok(png)
    }
}

/// Reads the page number back out of the image width
pub struct FakeOcr;

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, png: &[u8], _language: &str) -> Result<String> {
        let img = image::load_from_memory(png).map_err(|e| Error::Ocr(e.to_string()))?;
        Ok(format!("ocr text for page {}", img.width()))
    }
}

pub fn png_with_width(width: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width.max(1), 1, image::Rgb([255, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Build a PDF where each page is a list of `(font size, line)` text blocks
pub fn synthetic_pdf(pages: &[&[(f32, &str)]]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for blocks in pages {
        let mut operations = Vec::new();
        for (i, (size, text)) in blocks.iter().enumerate() {
            let y = 760 - 40 * i as i64;
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec!["F1".into(), Object::Integer(*size as i64)],
            ));
            operations.push(Operation::new(
                "Td",
                vec![Object::Integer(72), Object::Integer(y)],
            ));
            operations.push(Operation::new("Tj", vec![Object::string_literal(*text)]));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("save pdf");
    out
}
