//! Parse cache
//!
//! Caches the recovered page structure of a PDF so re-ingestion can skip
//! extraction. Entries are keyed by book identity and content hash, and are
//! re-checked before use so a bad OCR or heading run is not replayed.

use crate::error::Result;
use crate::ids::normalize_title;
use crate::structure::{HeadingDetector, RecoveredStructure};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const CACHE_VERSION: u32 = 1;
const CACHE_SUFFIX: &str = "_pages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedParse {
    pub version: u32,
    pub book_name: String,
    pub grade_ref: String,
    pub total_pages: usize,
    pub structure: RecoveredStructure,
}

impl CachedParse {
    pub fn new(book_name: &str, grade_ref: &str, structure: RecoveredStructure) -> Self {
        Self {
            version: CACHE_VERSION,
            book_name: book_name.to_string(),
            grade_ref: grade_ref.to_string(),
            total_pages: structure.pages.len(),
            structure,
        }
    }
}

pub struct ParseCache {
    dir: PathBuf,
}

impl ParseCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn key(book_name: &str, grade_ref: &str, pdf: &[u8]) -> String {
        let content = blake3::hash(pdf);
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalize_title(book_name).as_bytes());
        hasher.update(&[0]);
        hasher.update(grade_ref.as_bytes());
        hasher.update(&[0]);
        hasher.update(content.as_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, CACHE_SUFFIX))
    }

    /// A readable entry of the current version, if any
    pub fn load(&self, key: &str) -> Option<CachedParse> {
        let path = self.path(key);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CachedParse>(&content) {
            Ok(cached) if cached.version == CACHE_VERSION => {
                debug!("Cache hit: {}", path.display());
                Some(cached)
            }
            Ok(_) => {
                debug!("Ignoring cache entry from another version: {}", path.display());
                None
            }
            Err(e) => {
                warn!("Unreadable cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn store(&self, key: &str, cached: &CachedParse) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(cached)?)?;
        tmp.persist(self.path(key)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Delete every cached parse; returns how many were removed
    pub fn clear_all(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let is_cache = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CACHE_SUFFIX));
            if is_cache {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!("Cleared {} cached parses", removed);
        Ok(removed)
    }
}

/// Check the first `window` pages of a cached parse. Rejects entries with no
/// chapter or lesson tag at all, or with a tag that looks like a detection
/// failure.
pub fn sanity_check(
    structure: &RecoveredStructure,
    detector: &HeadingDetector,
    window: usize,
    max_heading_chars: usize,
) -> std::result::Result<(), String> {
    let head = &structure.pages[..structure.pages.len().min(window)];

    let mut any_tag = false;
    for page in head {
        for title in [&page.chapter, &page.lesson].into_iter().flatten() {
            any_tag = true;
            if detector.is_malformed(title, max_heading_chars) {
                return Err(format!(
                    "malformed heading '{}' on page {}",
                    title, page.page_num
                ));
            }
        }
    }

    if any_tag {
        Ok(())
    } else {
        Err(format!("no structure in the first {} pages", head.len()))
    }
}
