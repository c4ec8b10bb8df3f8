//! Chapter/lesson structure recovery
//!
//! Pages are tagged by in-body heading detection, carried forward page to
//! page. When the book has a table of contents with page numbers, the
//! TOC-derived page ranges replace those tags.

mod headings;
mod toc;

pub use headings::*;
pub use toc::*;

use crate::config::StructureConfig;
use crate::error::Result;
use crate::extract::ExtractedPage;
use crate::generate::Generator;
use crate::ids;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A page with its recovered chapter/lesson titles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedPage {
    pub page_num: u32,
    pub text: String,
    pub chapter: Option<String>,
    pub lesson: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlineSource {
    /// Page ranges from the table of contents
    Toc,
    /// In-body heading detection
    Headings,
    #[default]
    None,
}

impl std::fmt::Display for OutlineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutlineSource::Toc => write!(f, "toc"),
            OutlineSource::Headings => write!(f, "headings"),
            OutlineSource::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonOutline {
    pub lesson_id: String,
    pub title: String,
    pub order: usize,
    /// First page
    pub page: Option<u32>,
    pub end_page: Option<u32>,
    #[serde(default)]
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub chapter_id: String,
    pub title: String,
    pub order: usize,
    pub start_page: Option<u32>,
    pub end_page: Option<u32>,
    #[serde(default)]
    pub chunk_count: usize,
    #[serde(default)]
    pub lessons: Vec<LessonOutline>,
}

/// A book's chapter → lesson tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub chapters: Vec<ChapterOutline>,
    #[serde(default)]
    pub source: OutlineSource,
}

impl Outline {
    /// Chapters and lessons in first-appearance order over tagged pages
    pub fn from_pages(book_id: &str, pages: &[TaggedPage], source: OutlineSource) -> Self {
        let mut chapters: Vec<ChapterOutline> = Vec::new();

        for page in pages {
            let Some(chapter_title) = &page.chapter else {
                continue;
            };
            let chapter_id = ids::chapter_id(book_id, chapter_title);
            let pos = match chapters.iter().position(|c| c.chapter_id == chapter_id) {
                Some(pos) => pos,
                None => {
                    chapters.push(ChapterOutline {
                        chapter_id: chapter_id.clone(),
                        title: chapter_title.clone(),
                        order: chapters.len(),
                        start_page: Some(page.page_num),
                        end_page: Some(page.page_num),
                        chunk_count: 0,
                        lessons: Vec::new(),
                    });
                    chapters.len() - 1
                }
            };
            let chapter = &mut chapters[pos];
            chapter.end_page = chapter.end_page.max(Some(page.page_num));

            let Some(lesson_title) = &page.lesson else {
                continue;
            };
            let lesson_id = ids::lesson_id(&chapter_id, lesson_title);
            match chapter.lessons.iter_mut().find(|l| l.lesson_id == lesson_id) {
                Some(lesson) => lesson.end_page = lesson.end_page.max(Some(page.page_num)),
                None => {
                    let order = chapter.lessons.len();
                    chapter.lessons.push(LessonOutline {
                        lesson_id,
                        title: lesson_title.clone(),
                        order,
                        page: Some(page.page_num),
                        end_page: Some(page.page_num),
                        chunk_count: 0,
                    });
                }
            }
        }

        let source = if chapters.is_empty() {
            OutlineSource::None
        } else {
            source
        };
        Self { chapters, source }
    }

    /// Fill chunk counts from `(chapter_id, lesson_id)` tallies
    pub fn apply_chunk_counts(&mut self, counts: &HashMap<(Option<String>, Option<String>), usize>) {
        for chapter in &mut self.chapters {
            chapter.chunk_count = counts
                .iter()
                .filter(|((c, _), _)| c.as_deref() == Some(chapter.chapter_id.as_str()))
                .map(|(_, n)| n)
                .sum();
            for lesson in &mut chapter.lessons {
                lesson.chunk_count = counts
                    .get(&(Some(chapter.chapter_id.clone()), Some(lesson.lesson_id.clone())))
                    .copied()
                    .unwrap_or(0);
            }
        }
    }

    pub fn lesson_count(&self) -> usize {
        self.chapters.iter().map(|c| c.lessons.len()).sum()
    }
}

/// Tagged pages plus the outline they imply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredStructure {
    pub pages: Vec<TaggedPage>,
    pub outline: Outline,
}

pub struct StructureRecoverer {
    config: StructureConfig,
    detector: HeadingDetector,
    toc_parser: TocParser,
    generator: Option<Arc<dyn Generator>>,
}

impl StructureRecoverer {
    pub fn new(config: StructureConfig, generator: Option<Arc<dyn Generator>>) -> Result<Self> {
        Ok(Self {
            config,
            detector: HeadingDetector::new()?,
            toc_parser: TocParser::new()?,
            generator,
        })
    }

    pub fn detector(&self) -> &HeadingDetector {
        &self.detector
    }

    fn refiner(&self) -> Option<&Arc<dyn Generator>> {
        self.generator
            .as_ref()
            .filter(|_| self.config.use_llm_refinement)
    }

    fn title_strategies(&self) -> Vec<Box<dyn TitleStrategy>> {
        let max = self.config.max_heading_chars;
        let mut strategies: Vec<Box<dyn TitleStrategy>> = Vec::new();
        if let Some(generator) = self.refiner() {
            strategies.push(Box::new(LlmTitle::new(generator.clone(), max)));
        }
        strategies.push(Box::new(HeuristicTitle::new(max)));
        strategies
    }

    pub async fn recover(&self, book_id: &str, pages: &[ExtractedPage]) -> RecoveredStructure {
        let detected: Vec<PageHeadings> =
            pages.iter().map(|p| self.detector.scan_page(p)).collect();
        let detected = self.clean_titles(detected).await;

        let (tags, source) = match self.toc_ranges(pages).await {
            Some(map) => {
                info!("Using table of contents ({} page ranges)", map.ranges().len());
                let tags = pages
                    .iter()
                    .map(|p| match map.lookup(p.page_num) {
                        Some((chapter, lesson)) => PageHeadings {
                            chapter: Some(chapter.to_string()),
                            lesson: lesson.map(str::to_string),
                        },
                        None => PageHeadings::default(),
                    })
                    .collect();
                (tags, OutlineSource::Toc)
            }
            None => (carry_forward(&detected), OutlineSource::Headings),
        };

        let tagged: Vec<TaggedPage> = pages
            .iter()
            .zip(tags)
            .map(|(page, tag)| TaggedPage {
                page_num: page.page_num,
                text: page.text.clone(),
                chapter: tag.chapter,
                lesson: tag.lesson,
            })
            .collect();

        let outline = Outline::from_pages(book_id, &tagged, source);
        info!(
            "Recovered {} chapters, {} lessons (source: {})",
            outline.chapters.len(),
            outline.lesson_count(),
            outline.source
        );
        RecoveredStructure {
            pages: tagged,
            outline,
        }
    }

    /// Strip noise from every detected title; overlong ones go through the
    /// strategy chain, once per distinct capture.
    async fn clean_titles(&self, detected: Vec<PageHeadings>) -> Vec<PageHeadings> {
        let strategies = self.title_strategies();
        let max = self.config.max_heading_chars;
        let mut refined: HashMap<String, String> = HashMap::new();

        let mut out = Vec::with_capacity(detected.len());
        for found in detected {
            let mut cleaned = PageHeadings::default();
            for (raw, slot) in [
                (found.chapter, &mut cleaned.chapter),
                (found.lesson, &mut cleaned.lesson),
            ] {
                let Some(raw) = raw else { continue };
                let title = strip_noise(&raw);
                if title.chars().count() <= max && !title.is_empty() {
                    *slot = Some(title);
                    continue;
                }
                if let Some(done) = refined.get(&raw) {
                    *slot = Some(done.clone());
                    continue;
                }
                debug!("Refining overlong heading: {}", raw);
                let title = refine_title(&strategies, &raw, max).await;
                refined.insert(raw, title.clone());
                *slot = Some(title);
            }
            out.push(cleaned);
        }
        out
    }

    async fn toc_ranges(&self, pages: &[ExtractedPage]) -> Option<RangeMap> {
        let raw = find_toc_text(pages, self.config.toc_scan_pages, self.config.toc_max_pages)?;

        let mut toc = self.toc_parser.parse(&raw);
        if let Some(generator) = self.refiner() {
            if let Some(normalized) = normalize_with_llm(generator.as_ref(), &raw).await {
                toc = normalized;
            }
        }
        if toc.is_empty() {
            debug!("Table of contents found but no entries parsed");
            return None;
        }

        let max = self.config.max_heading_chars;
        for chapter in &mut toc.chapters {
            chapter.title = cap_length(&chapter.title, max);
            for lesson in &mut chapter.lessons {
                lesson.title = cap_length(&lesson.title, max);
            }
        }

        RangeMap::build(&toc, self.config.toc_page_offset, pages.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PageSource;
    use crate::testing::FakeGenerator;

    fn page(n: u32, text: &str) -> ExtractedPage {
        ExtractedPage {
            page_num: n,
            text: text.to_string(),
            blocks: Vec::new(),
            source: PageSource::TextLayer,
        }
    }

    fn recoverer(generator: Option<Arc<dyn Generator>>) -> StructureRecoverer {
        StructureRecoverer::new(StructureConfig::default(), generator).unwrap()
    }

    #[tokio::test]
    async fn test_headings_carried_forward() {
        let pages = vec![
            page(1, "Welcome to the book."),
            page(2, "Chapter 1: Basics\nLesson 1: Intro\nPlants make food."),
            page(3, "Sunlight drives the process."),
        ];
        let recovered = recoverer(None).recover("book1", &pages).await;

        assert_eq!(recovered.pages[0].chapter, None);
        assert_eq!(recovered.pages[0].lesson, None);
        for p in &recovered.pages[1..] {
            assert_eq!(p.chapter.as_deref(), Some("Chapter 1: Basics"));
            assert_eq!(p.lesson.as_deref(), Some("Lesson 1: Intro"));
        }

        let outline = &recovered.outline;
        assert_eq!(outline.source, OutlineSource::Headings);
        assert_eq!(outline.chapters.len(), 1);
        let chapter = &outline.chapters[0];
        assert_eq!(chapter.chapter_id, ids::chapter_id("book1", "Chapter 1: Basics"));
        assert_eq!((chapter.start_page, chapter.end_page), (Some(2), Some(3)));
        assert_eq!(chapter.lessons[0].page, Some(2));
        assert_eq!(
            chapter.lessons[0].lesson_id,
            ids::lesson_id(&chapter.chapter_id, "Lesson 1: Intro")
        );
    }

    #[tokio::test]
    async fn test_no_structure() {
        let pages = vec![page(1, "just text"), page(2, "more text")];
        let recovered = recoverer(None).recover("b", &pages).await;
        assert_eq!(recovered.outline.source, OutlineSource::None);
        assert!(recovered.outline.chapters.is_empty());
        assert_eq!(recovered.pages.len(), 2);
    }

    #[tokio::test]
    async fn test_toc_overrides_headings() {
        let pages = vec![
            page(1, "Mục lục\nChương 1. Cơ học\nBài 1. Chuyển động .... 2\nBài 2. Lực .... 3"),
            page(2, "Chapter 9: Wrong heading\nnội dung"),
            page(3, "nội dung"),
            page(4, "nội dung"),
        ];
        let recovered = recoverer(None).recover("b", &pages).await;

        assert_eq!(recovered.outline.source, OutlineSource::Toc);
        assert_eq!(recovered.pages[0].chapter, None);
        assert_eq!(recovered.pages[1].chapter.as_deref(), Some("Chương 1. Cơ học"));
        assert_eq!(recovered.pages[1].lesson.as_deref(), Some("Bài 1. Chuyển động"));
        assert_eq!(recovered.pages[3].lesson.as_deref(), Some("Bài 2. Lực"));
    }

    #[tokio::test]
    async fn test_overlong_heading_refined_once() {
        let long = format!("Chapter 1: Basics {}", "and more words ".repeat(10));
        let pages = vec![page(1, &long), page(2, &long)];
        let generator = Arc::new(FakeGenerator::replying(r#"{"title": "Chapter 1: Basics"}"#));
        let recovered = recoverer(Some(generator.clone())).recover("b", &pages).await;

        assert_eq!(recovered.pages[0].chapter.as_deref(), Some("Chapter 1: Basics"));
        assert_eq!(generator.calls(), 1);
    }

    #[test]
    fn test_apply_chunk_counts() {
        let pages = vec![TaggedPage {
            page_num: 1,
            text: String::new(),
            chapter: Some("C".to_string()),
            lesson: Some("L".to_string()),
        }];
        let mut outline = Outline::from_pages("b", &pages, OutlineSource::Headings);
        let cid = outline.chapters[0].chapter_id.clone();
        let lid = outline.chapters[0].lessons[0].lesson_id.clone();

        let counts = HashMap::from([
            ((Some(cid.clone()), Some(lid)), 3),
            ((Some(cid), None), 2),
            ((None, None), 7),
        ]);
        outline.apply_chunk_counts(&counts);
        assert_eq!(outline.chapters[0].chunk_count, 5);
        assert_eq!(outline.chapters[0].lessons[0].chunk_count, 3);
    }
}
