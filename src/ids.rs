//! Content-addressed identifiers for books, chapters and lessons
//!
//! Every id is a pure function of its parent id and a normalized title, so
//! re-ingesting the same book overwrites its rows instead of duplicating them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Hex length of an id (128 bits of blake3 output)
const ID_HEX_LEN: usize = 32;

/// Normalize a name or title for hashing: trim, lowercase, collapse whitespace.
pub fn normalize_title(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(&[0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    hex[..ID_HEX_LEN].to_string()
}

/// Id of a numbered grade
pub fn grade_id(grade: u32) -> String {
    hash_parts(&["grade", &grade.to_string()])
}

/// A grade given either by number or by an already-assigned grade id.
///
/// Both forms resolve to the same id, so `Number(5)` and `Id(grade_id(5))`
/// produce the same book id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeRef {
    Number(u32),
    Id(String),
}

impl GradeRef {
    /// The grade id this reference resolves to
    pub fn resolve(&self) -> String {
        match self {
            GradeRef::Number(n) => grade_id(*n),
            GradeRef::Id(id) => id.trim().to_string(),
        }
    }
}

impl fmt::Display for GradeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradeRef::Number(n) => write!(f, "grade {}", n),
            GradeRef::Id(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for GradeRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("Grade reference must not be empty".to_string()));
        }
        Ok(match s.parse::<u32>() {
            Ok(n) => GradeRef::Number(n),
            Err(_) => GradeRef::Id(s.to_string()),
        })
    }
}

pub fn book_id(name: &str, grade: &GradeRef) -> String {
    hash_parts(&["book", &normalize_title(name), &grade.resolve()])
}

pub fn chapter_id(book_id: &str, title: &str) -> String {
    hash_parts(&["chapter", book_id, &normalize_title(title)])
}

pub fn lesson_id(chapter_id: &str, title: &str) -> String {
    hash_parts(&["lesson", chapter_id, &normalize_title(title)])
}

/// Sequence-local chunk id (1-based)
pub fn chunk_id(seq: usize) -> String {
    format!("chunk_{:06}", seq + 1)
}
