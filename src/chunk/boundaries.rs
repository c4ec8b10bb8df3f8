//! Break levels for recursive splitting

use unicode_segmentation::UnicodeSegmentation;

/// Priority levels for break points, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPriority {
    /// Word boundary (lowest)
    Word = 1,
    /// Sentence boundary
    Sentence = 2,
    /// Line boundary
    Line = 3,
    /// Paragraph boundary (highest)
    Paragraph = 4,
}

/// Levels in the order the splitter tries them
pub const LEVELS: [BreakPriority; 4] = [
    BreakPriority::Paragraph,
    BreakPriority::Line,
    BreakPriority::Sentence,
    BreakPriority::Word,
];

impl BreakPriority {
    /// String used to re-join pieces split at this level
    pub fn joiner(self) -> &'static str {
        match self {
            BreakPriority::Paragraph => "\n\n",
            BreakPriority::Line => "\n",
            BreakPriority::Sentence | BreakPriority::Word => " ",
        }
    }

    /// Whether `text` contains at least one break of this level
    pub fn occurs_in(self, text: &str) -> bool {
        match self {
            BreakPriority::Paragraph => text.contains("\n\n"),
            BreakPriority::Line => text.contains('\n'),
            BreakPriority::Sentence => text.split_sentence_bounds().nth(1).is_some(),
            BreakPriority::Word => true,
        }
    }

    /// Split `text` at this level, dropping separators and blank pieces
    pub fn split(self, text: &str) -> Vec<&str> {
        let pieces: Vec<&str> = match self {
            BreakPriority::Paragraph => text.split("\n\n").collect(),
            BreakPriority::Line => text.split('\n').collect(),
            BreakPriority::Sentence => text.split_sentence_bounds().collect(),
            BreakPriority::Word => text.split_whitespace().collect(),
        };
        pieces
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Length measure used for chunk sizing
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
