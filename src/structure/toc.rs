//! Table-of-contents discovery, parsing and page-range mapping

use super::headings::{collapse_whitespace, strip_noise, HeadingDetector, HeadingKind};
use crate::error::{Error, Result};
use crate::extract::ExtractedPage;
use crate::generate::{extract_json_object, Generator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const TOC_MARKERS: [&str; 4] = ["table of contents", "contents", "mục lục", "muc luc"];

/// Entries that are not lessons even when the TOC lists them with a page
const DENYLIST: [&str; 12] = [
    "exercises",
    "review",
    "glossary",
    "appendix",
    "index",
    "answers",
    "bài tập cuối chương",
    "ôn tập",
    "phụ lục",
    "thuật ngữ",
    "bảng tra cứu",
    "đáp án",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocLesson {
    pub title: String,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocChapter {
    pub title: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub lessons: Vec<TocLesson>,
}

/// Ordered chapter → lessons skeleton as the book declares it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TocSkeleton {
    pub chapters: Vec<TocChapter>,
}

impl TocSkeleton {
    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

pub fn is_denylisted(title: &str) -> bool {
    let lower = title.to_lowercase();
    DENYLIST.iter().any(|d| lower.contains(d))
}

/// Raw TOC text from the first `scan_pages` pages, at most `max_pages` long
pub fn find_toc_text(pages: &[ExtractedPage], scan_pages: usize, max_pages: usize) -> Option<String> {
    let start = pages.iter().take(scan_pages).position(|p| {
        p.text.lines().any(|line| {
            let line = collapse_whitespace(line).to_lowercase();
            TOC_MARKERS.contains(&line.trim_end_matches([':', '.']).trim())
        })
    })?;

    // Continuation pages must still look like TOC entries
    let mut text = pages[start].text.clone();
    for page in pages[start + 1..].iter().take(max_pages.saturating_sub(1)) {
        if numbered_lines(&page.text) < 2 {
            break;
        }
        text.push('\n');
        text.push_str(&page.text);
    }
    debug!("TOC found on page {}", pages[start].page_num);
    Some(text)
}

fn numbered_lines(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            line.split_whitespace()
                .last()
                .is_some_and(|w| w.chars().all(|c| c.is_ascii_digit()))
        })
        .count()
}

pub struct TocParser {
    detector: HeadingDetector,
    entry: Regex,
}

impl TocParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            detector: HeadingDetector::new()?,
            entry: Regex::new(r"^(?P<title>.+?)(?:\s*[.…·_]{2,}\s*|\s+)(?P<page>\d{1,4})$")
                .map_err(|e| Error::Other(format!("Invalid TOC pattern: {}", e)))?,
        })
    }

    /// Split a line into title and trailing page number
    fn split_entry(&self, line: &str) -> (String, Option<u32>) {
        if let Some(caps) = self.entry.captures(line) {
            let title = caps["title"].trim();
            // "Bài 1" is a marker and its number, not a title and a page
            if !self.detector.is_bare_marker(title) {
                if let Ok(page) = caps["page"].parse::<u32>() {
                    return (strip_noise(title), Some(page));
                }
            }
        }
        (strip_noise(line), None)
    }

    /// Heuristic line-by-line parse. Lines without a page number are held
    /// and joined to the next line unless they are chapter headings.
    pub fn parse(&self, text: &str) -> TocSkeleton {
        let mut toc = TocSkeleton::default();
        let mut pending = String::new();

        for line in text.lines().map(collapse_whitespace).filter(|l| !l.is_empty()) {
            let lower = line.to_lowercase();
            if TOC_MARKERS.contains(&lower.as_str()) {
                continue;
            }

            let joined = if pending.is_empty() {
                line
            } else {
                format!("{} {}", pending, line)
            };
            let (title, page) = self.split_entry(&joined);
            let kind = self.detector.classify(&title);

            if page.is_none() && kind != Some(HeadingKind::Chapter) {
                // Wrapped entries rarely span more than a few lines
                pending = if joined.chars().count() > 200 {
                    line_tail(&joined)
                } else {
                    joined
                };
                continue;
            }
            pending.clear();

            if kind == Some(HeadingKind::Chapter) {
                toc.chapters.push(TocChapter {
                    title,
                    page,
                    lessons: Vec::new(),
                });
                continue;
            }

            if is_denylisted(&title) {
                debug!("Skipping TOC entry '{}'", title);
                continue;
            }
            match toc.chapters.last_mut() {
                Some(chapter) => chapter.lessons.push(TocLesson { title, page }),
                None => debug!("TOC entry '{}' before any chapter", title),
            }
        }

        toc
    }
}

fn line_tail(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    words[words.len().saturating_sub(12)..].join(" ")
}

const TOC_SYSTEM_PROMPT: &str = "You normalize textbook tables of contents. \
Merge entries that wrapped onto several lines, attach every lesson to the chapter it \
belongs to, keep titles in their original language and keep the printed page numbers. \
Leave out exercises, reviews, glossaries, appendices and indexes. Reply with JSON only: \
{\"chapters\": [{\"title\": \"...\", \"page\": 1, \"lessons\": [{\"title\": \"...\", \"page\": 3}]}]}";

/// Ask the generation service to normalize the raw TOC. `None` on any
/// failure, so the heuristic parse stands.
pub async fn normalize_with_llm(generator: &dyn Generator, raw: &str) -> Option<TocSkeleton> {
    let reply = match generator.complete(TOC_SYSTEM_PROMPT, raw, 0.0, true).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("TOC normalization failed, using heuristic parse: {}", e);
            return None;
        }
    };
    let parsed = extract_json_object(&reply)
        .and_then(|json| serde_json::from_str::<TocSkeleton>(json).ok());
    match parsed {
        Some(mut toc) if !toc.is_empty() => {
            for chapter in &mut toc.chapters {
                chapter.lessons.retain(|l| !is_denylisted(&l.title));
            }
            Some(toc)
        }
        _ => {
            warn!("TOC normalization returned no usable outline, using heuristic parse");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRange {
    pub chapter: String,
    pub lesson: Option<String>,
    pub start: u32,
    pub end: u32,
}

/// page → (chapter, lesson) assignment derived from a TOC skeleton
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeMap {
    ranges: Vec<PageRange>,
}

impl RangeMap {
    /// A chapter spans from its first lesson's page to just before the next
    /// chapter's start; lessons split that span the same way. A chapter's own
    /// page is used only when none of its lessons has one. `offset` maps
    /// printed page numbers to PDF pages. `None` when no chapter has a usable
    /// page.
    pub fn build(toc: &TocSkeleton, offset: i32, total_pages: u32) -> Option<Self> {
        let shift = |page: u32| -> Option<u32> {
            let shifted = page as i64 + offset as i64;
            (shifted >= 1 && shifted <= total_pages as i64).then_some(shifted as u32)
        };

        let starts: Vec<(&TocChapter, u32)> = toc
            .chapters
            .iter()
            .filter_map(|c| {
                let first = c.lessons.iter().find_map(|l| l.page).or(c.page)?;
                Some((c, shift(first)?))
            })
            .collect();

        let mut ranges = Vec::new();
        for (i, (chapter, start)) in starts.iter().enumerate() {
            let end = starts
                .get(i + 1)
                .map(|(_, next)| next.saturating_sub(1))
                .unwrap_or(total_pages)
                .max(*start);

            let lessons: Vec<(&TocLesson, u32)> = chapter
                .lessons
                .iter()
                .filter_map(|l| Some((l, shift(l.page?)?)))
                .filter(|(_, p)| *p >= *start && *p <= end)
                .collect();

            let first_lesson = lessons.first().map(|(_, p)| *p).unwrap_or(end + 1);
            if first_lesson > *start {
                ranges.push(PageRange {
                    chapter: chapter.title.clone(),
                    lesson: None,
                    start: *start,
                    end: first_lesson - 1,
                });
            }

            for (j, (lesson, lesson_start)) in lessons.iter().enumerate() {
                let lesson_end = lessons
                    .get(j + 1)
                    .map(|(_, next)| next.saturating_sub(1))
                    .unwrap_or(end)
                    .max(*lesson_start);
                ranges.push(PageRange {
                    chapter: chapter.title.clone(),
                    lesson: Some(lesson.title.clone()),
                    start: *lesson_start,
                    end: lesson_end,
                });
            }
        }

        (!ranges.is_empty()).then_some(Self { ranges })
    }

    pub fn lookup(&self, page: u32) -> Option<(&str, Option<&str>)> {
        self.ranges
            .iter()
            .find(|r| r.start <= page && page <= r.end)
            .map(|r| (r.chapter.as_str(), r.lesson.as_deref()))
    }

    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }
}
