//! In-body chapter/lesson heading detection and title cleanup

use crate::error::{Error, Result};
use crate::extract::ExtractedPage;
use crate::generate::{extract_json_object, Generator};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const CHAPTER_WORDS: &str = r"chapter|part|chương|phần";
const LESSON_WORDS: &str = r"lesson|unit|bài|tiết";
const NUMBER: &str = r"[0-9]+|[IVXLC]+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingKind {
    Chapter,
    Lesson,
}

/// Headings found on a single page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageHeadings {
    pub chapter: Option<String>,
    pub lesson: Option<String>,
}

pub struct HeadingDetector {
    chapter: Regex,
    lesson: Regex,
    bare_marker: Regex,
}

impl HeadingDetector {
    pub fn new() -> Result<Self> {
        // Marker, number, then either a separator + title, an uppercase
        // title, or nothing. Lowercase continuations read as body prose.
        let pattern = |words: &str| {
            format!(
                r"^\s*(?i:{})\s+(?:{})\s*(?:[.:\-–]\s*.*|\p{{Lu}}.*)?$",
                words, NUMBER
            )
        };
        Ok(Self {
            chapter: compile(&pattern(CHAPTER_WORDS))?,
            lesson: compile(&pattern(LESSON_WORDS))?,
            bare_marker: compile(&format!(
                r"^\s*(?i:{}|{})\s*[.:\-–]?\s*$",
                CHAPTER_WORDS, LESSON_WORDS
            ))?,
        })
    }

    pub fn classify(&self, line: &str) -> Option<HeadingKind> {
        if self.chapter.is_match(line) {
            Some(HeadingKind::Chapter)
        } else if self.lesson.is_match(line) {
            Some(HeadingKind::Lesson)
        } else {
            None
        }
    }

    /// A heading keyword with no number after it
    pub fn is_bare_marker(&self, text: &str) -> bool {
        self.bare_marker.is_match(text)
    }

    /// First chapter and lesson heading on a page. Lines drawn larger than
    /// the page's body font are checked before the rest of the text.
    pub fn scan_page(&self, page: &ExtractedPage) -> PageHeadings {
        let mut found = PageHeadings::default();
        for (line, next) in candidate_lines(page) {
            let slot = match self.classify(&line) {
                Some(HeadingKind::Chapter) => &mut found.chapter,
                Some(HeadingKind::Lesson) => &mut found.lesson,
                None => continue,
            };
            if slot.is_none() {
                *slot = Some(with_title_line(&line, next.as_deref()));
            }
            if found.chapter.is_some() && found.lesson.is_some() {
                break;
            }
        }
        found
    }

    /// Whether a carried title looks like a detection failure
    pub fn is_malformed(&self, title: &str, max_chars: usize) -> bool {
        let trimmed = title.trim();
        trimmed.is_empty()
            || trimmed.chars().count() > max_chars
            || trimmed.contains("..")
            || trimmed.contains('…')
            || trimmed.chars().all(|c| c.is_ascii_digit() || c.is_whitespace())
            || self.is_bare_marker(trimmed)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Other(format!("Invalid heading pattern: {}", e)))
}

/// `(line, following line)` pairs: large-font block lines first, then the
/// page text in reading order.
fn candidate_lines(page: &ExtractedPage) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();

    let mut sizes: Vec<f32> = page.blocks.iter().map(|b| b.font_size).collect();
    sizes.sort_by(|a, b| a.total_cmp(b));
    if let Some(&body) = sizes.get(sizes.len() / 2) {
        for block in page.blocks.iter().filter(|b| b.font_size > body) {
            out.extend(line_pairs(&block.text));
        }
    }

    out.extend(line_pairs(&page.text));
    out
}

fn line_pairs(text: &str) -> Vec<(String, Option<String>)> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| (line.to_string(), lines.get(i + 1).map(|n| n.to_string())))
        .collect()
}

/// "Chương 1" alone on its line takes its title from the next line
fn with_title_line(line: &str, next: Option<&str>) -> String {
    let line = collapse_whitespace(line);
    let ends_at_number = line
        .trim_end_matches(['.', ':', '-', '–'])
        .split_whitespace()
        .count()
        == 2;
    match next {
        Some(next) if ends_at_number => {
            format!("{}: {}", line.trim_end_matches(['.', ':', '-', '–']), collapse_whitespace(next))
        }
        _ => line,
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop dot leaders and trailing page numbers
pub fn strip_noise(title: &str) -> String {
    let mut title = collapse_whitespace(title);
    for leader in ["..", "…", "· ·", "__"] {
        if let Some(pos) = title.find(leader) {
            title.truncate(pos);
        }
    }
    let trimmed = title.trim_end_matches(|c: char| c.is_whitespace() || c == '.' || c == '·');
    let without_page = match trimmed.rsplit_once(' ') {
        Some((head, tail)) if tail.chars().all(|c| c.is_ascii_digit()) && head.split_whitespace().count() > 2 => head,
        _ => trimmed,
    };
    without_page.trim().to_string()
}

/// Cap at `max_chars`, cutting on a word boundary where possible
pub fn cap_length(title: &str, max_chars: usize) -> String {
    if title.chars().count() <= max_chars {
        return title.to_string();
    }
    let cut: String = title.chars().take(max_chars).collect();
    match cut.rfind(' ') {
        Some(pos) if pos > 0 => cut[..pos].trim_end_matches([',', ';', ':', '-']).trim().to_string(),
        _ => cut,
    }
}

/// One way of turning a noisy heading capture into a clean title
#[async_trait]
pub trait TitleStrategy: Send + Sync {
    async fn refine(&self, raw: &str) -> Option<String>;
}

/// Ask the generation service for a one-line title
pub struct LlmTitle {
    generator: Arc<dyn Generator>,
    max_chars: usize,
}

impl LlmTitle {
    pub fn new(generator: Arc<dyn Generator>, max_chars: usize) -> Self {
        Self {
            generator,
            max_chars,
        }
    }
}

#[derive(Deserialize)]
struct TitleReply {
    title: String,
}

const TITLE_SYSTEM_PROMPT: &str = "You clean up textbook headings captured by OCR. \
Return JSON {\"title\": \"...\"} holding the heading as one short line: keep the \
chapter or lesson marker and number, keep the original language, drop page numbers, \
dot leaders and any body text that ran on after the heading.";

#[async_trait]
impl TitleStrategy for LlmTitle {
    async fn refine(&self, raw: &str) -> Option<String> {
        let reply = match self
            .generator
            .complete(TITLE_SYSTEM_PROMPT, raw, 0.0, true)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Heading refinement failed: {}", e);
                return None;
            }
        };
        let parsed: TitleReply = serde_json::from_str(extract_json_object(&reply)?).ok()?;
        let title = collapse_whitespace(&parsed.title);
        (!title.is_empty() && title.chars().count() <= self.max_chars).then_some(title)
    }
}

/// Strip noise and cap the length; always produces a title
pub struct HeuristicTitle {
    max_chars: usize,
}

impl HeuristicTitle {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl TitleStrategy for HeuristicTitle {
    async fn refine(&self, raw: &str) -> Option<String> {
        let title = cap_length(&strip_noise(raw), self.max_chars);
        (!title.is_empty()).then_some(title)
    }
}

/// Try each strategy in order; the capped raw text backs them all up
pub async fn refine_title(
    strategies: &[Box<dyn TitleStrategy>],
    raw: &str,
    max_chars: usize,
) -> String {
    for strategy in strategies {
        if let Some(title) = strategy.refine(raw).await {
            return title;
        }
    }
    cap_length(&collapse_whitespace(raw), max_chars)
}

/// Thread `(chapter, lesson)` across pages: a chapter heading resets the
/// lesson, and lessons seen before any chapter are ignored.
pub fn carry_forward(detected: &[PageHeadings]) -> Vec<PageHeadings> {
    detected
        .iter()
        .fold(
            (PageHeadings::default(), Vec::with_capacity(detected.len())),
            |(mut current, mut out), found| {
                if let Some(chapter) = &found.chapter {
                    current = PageHeadings {
                        chapter: Some(chapter.clone()),
                        lesson: None,
                    };
                }
                if let (Some(lesson), Some(_)) = (&found.lesson, &current.chapter) {
                    current.lesson = Some(lesson.clone());
                }
                out.push(current.clone());
                (current, out)
            },
        )
        .1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{PageSource, TextBlock};
    use crate::testing::FakeGenerator;

    fn page(text: &str) -> ExtractedPage {
        ExtractedPage {
            page_num: 1,
            text: text.to_string(),
            blocks: Vec::new(),
            source: PageSource::TextLayer,
        }
    }

    fn found(chapter: Option<&str>, lesson: Option<&str>) -> PageHeadings {
        PageHeadings {
            chapter: chapter.map(String::from),
            lesson: lesson.map(String::from),
        }
    }

    #[test]
    fn test_classify() {
        let d = HeadingDetector::new().unwrap();
        assert_eq!(d.classify("Chapter 1: Basics"), Some(HeadingKind::Chapter));
        assert_eq!(d.classify("CHƯƠNG II. Nhiệt học"), Some(HeadingKind::Chapter));
        assert_eq!(d.classify("Phần 3"), Some(HeadingKind::Chapter));
        assert_eq!(d.classify("Lesson 1: Intro"), Some(HeadingKind::Lesson));
        assert_eq!(d.classify("Bài 12. Lực ma sát"), Some(HeadingKind::Lesson));
        assert_eq!(d.classify("Chapter 3 discusses energy"), None);
        assert_eq!(d.classify("In this lesson we learn"), None);
    }

    #[test]
    fn test_scan_page_finds_both() {
        let d = HeadingDetector::new().unwrap();
        let found = d.scan_page(&page("Chapter 1: Basics\nLesson 1: Intro\nBody text."));
        assert_eq!(found.chapter.as_deref(), Some("Chapter 1: Basics"));
        assert_eq!(found.lesson.as_deref(), Some("Lesson 1: Intro"));
    }

    #[test]
    fn test_scan_page_joins_title_line() {
        let d = HeadingDetector::new().unwrap();
        let found = d.scan_page(&page("Chương 1\nCơ học\nNội dung"));
        assert_eq!(found.chapter.as_deref(), Some("Chương 1: Cơ học"));
    }

    #[test]
    fn test_large_font_checked_first() {
        let d = HeadingDetector::new().unwrap();
        let mut p = page("Part 9: Appendix reference\nChapter 2: Motion");
        p.blocks = vec![
            TextBlock {
                text: "Chapter 2: Motion".to_string(),
                font_size: 20.0,
            },
            TextBlock {
                text: "Part 9: Appendix reference".to_string(),
                font_size: 10.0,
            },
            TextBlock {
                text: "More body".to_string(),
                font_size: 10.0,
            },
        ];
        assert_eq!(d.scan_page(&p).chapter.as_deref(), Some("Chapter 2: Motion"));
    }

    #[test]
    fn test_carry_forward() {
        let detected = vec![
            found(None, Some("Lesson 0: Orphan")),
            found(Some("Chapter 1"), Some("Lesson 1")),
            found(None, None),
            found(None, Some("Lesson 2")),
            found(Some("Chapter 2"), None),
        ];
        let carried = carry_forward(&detected);

        assert_eq!(carried[0], found(None, None));
        assert_eq!(carried[1], found(Some("Chapter 1"), Some("Lesson 1")));
        assert_eq!(carried[2], found(Some("Chapter 1"), Some("Lesson 1")));
        assert_eq!(carried[3], found(Some("Chapter 1"), Some("Lesson 2")));
        assert_eq!(carried[4], found(Some("Chapter 2"), None));
    }

    #[test]
    fn test_strip_noise_and_cap() {
        assert_eq!(strip_noise("Bài 3. Lực ....... 45"), "Bài 3. Lực");
        assert_eq!(strip_noise("Lesson 2: Forces and motion 17"), "Lesson 2: Forces and motion");
        assert_eq!(strip_noise("Lesson 2"), "Lesson 2");
        assert_eq!(cap_length("Chapter 1: one two three", 16), "Chapter 1: one");
    }

    #[test]
    fn test_malformed_titles() {
        let d = HeadingDetector::new().unwrap();
        assert!(d.is_malformed("Bài", 80));
        assert!(d.is_malformed("123", 80));
        assert!(d.is_malformed("Chapter 1 .......", 80));
        assert!(d.is_malformed(&"x".repeat(81), 80));
        assert!(!d.is_malformed("Chapter 1: Basics", 80));
    }

    #[tokio::test]
    async fn test_strategy_chain_prefers_llm() {
        let generator = Arc::new(FakeGenerator::replying(r#"{"title": "Chapter 1: Basics"}"#));
        let strategies: Vec<Box<dyn TitleStrategy>> = vec![
            Box::new(LlmTitle::new(generator.clone(), 40)),
            Box::new(HeuristicTitle::new(40)),
        ];
        let raw = "Chapter 1: Basics of everything that follows in this long run-on capture";
        assert_eq!(refine_title(&strategies, raw, 40).await, "Chapter 1: Basics");
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_strategy_chain_falls_back_to_heuristic() {
        let strategies: Vec<Box<dyn TitleStrategy>> = vec![
            Box::new(LlmTitle::new(Arc::new(FakeGenerator::failing()), 20)),
            Box::new(HeuristicTitle::new(20)),
        ];
        let title = refine_title(&strategies, "Lesson 4: Waves and sound energy ..... 88", 20).await;
        assert_eq!(title, "Lesson 4: Waves and");
    }

    #[tokio::test]
    async fn test_llm_reply_without_json_is_skipped() {
        let strategies: Vec<Box<dyn TitleStrategy>> = vec![
            Box::new(LlmTitle::new(Arc::new(FakeGenerator::replying("sorry")), 20)),
            Box::new(HeuristicTitle::new(20)),
        ];
        let title = refine_title(&strategies, "Lesson 4: Waves and sound energy", 20).await;
        assert_eq!(title, "Lesson 4: Waves and");
    }
}
