//! Word-bounded recursive chunking
//!
//! Pages are split paragraph → line → sentence → word until every piece fits
//! the target size, then neighboring pieces are merged back up to the target
//! with a trailing overlap carried into the next chunk. Sizes are measured
//! in whitespace-separated words.

mod boundaries;

pub use boundaries::*;

use crate::config::ChunkConfig;
use crate::structure::TaggedPage;
use serde::{Deserialize, Serialize};

/// A passage cut from one page, carrying that page's structure tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageChunk {
    /// Provisional position in the book's chunk sequence
    pub seq: usize,
    pub page: u32,
    pub chapter: Option<String>,
    pub lesson: Option<String>,
    pub text: String,
}

/// Recursive splitter configured with a size and an overlap in words
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    size: usize,
    overlap: usize,
}

impl Splitter {
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            size: config.size_words.max(1),
            overlap: config.overlap_words.min(config.size_words.saturating_sub(1)),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_levels(text, &LEVELS)
    }

    fn split_levels(&self, text: &str, levels: &[BreakPriority]) -> Vec<String> {
        let Some(pos) = levels.iter().position(|l| l.occurs_in(text)) else {
            let text = text.trim();
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![text.to_string()]
            };
        };
        let level = levels[pos];
        let finer = &levels[pos + 1..];

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in level.split(text) {
            if word_count(piece) < self.size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, level.joiner()));
                fitting.clear();
            }

            if finer.is_empty() {
                out.push(piece.to_string());
            } else {
                out.extend(self.split_levels(piece, finer));
            }
        }

        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, level.joiner()));
        }
        out
    }

    /// Greedily pack pieces up to `size` words, keeping up to `overlap`
    /// trailing words as the head of the next chunk.
    fn merge(&self, pieces: &[&str], joiner: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: Vec<(&str, usize)> = Vec::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = word_count(piece);

            if total + len > self.size && !window.is_empty() {
                push_joined(&mut chunks, &window, joiner);

                while !window.is_empty()
                    && (total > self.overlap || total + len > self.size)
                {
                    let (_, first) = window.remove(0);
                    total -= first;
                }
            }

            window.push((piece, len));
            total += len;
        }

        push_joined(&mut chunks, &window, joiner);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &[(&str, usize)], joiner: &str) {
    let text = window
        .iter()
        .map(|(p, _)| *p)
        .collect::<Vec<_>>()
        .join(joiner);
    let text = text.trim();
    if !text.is_empty() {
        chunks.push(text.to_string());
    }
}

/// Chunk every page in order; each chunk inherits its page's tags
pub fn chunk_pages(pages: &[TaggedPage], config: &ChunkConfig) -> Vec<PageChunk> {
    let splitter = Splitter::new(config);
    let mut out = Vec::new();

    for page in pages {
        for text in splitter.split(&page.text) {
            out.push(PageChunk {
                seq: out.len(),
                page: page.page_num,
                chapter: page.chapter.clone(),
                lesson: page.lesson.clone(),
                text,
            });
        }
    }

    out
}
