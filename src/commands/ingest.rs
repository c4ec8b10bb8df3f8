//! Ingest command implementation
//!
//! fetch → cache check → extract + recover structure (or cached) → chunk →
//! embed → index append + entity writes → commit. Fetch, embedding and index
//! failures abort the run and leave the previous state of the book intact.

use crate::cache::{sanity_check, CachedParse, ParseCache};
use crate::chunk::{chunk_pages, PageChunk};
use crate::embed::embed_in_batches;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, PdfSource};
use crate::ids::{self, GradeRef};
use crate::library::{Library, WriteGuard};
use crate::meta::{Book, Chapter, Chunk, Lesson, MetaDb, RunOperation, RunStatus};
use crate::structure::{Outline, RecoveredStructure};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to ingest
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// URL, `file://` URL or local path
    pub source: String,
    pub book_name: String,
    pub grade: GradeRef,
    pub subject_id: Option<String>,
    /// Ignore any cached parse of this PDF
    pub force_reparse: bool,
    /// Delete every cached parse before starting
    pub force_clear_cache: bool,
}

/// Statistics from an ingestion run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub status: String,
    pub book_id: String,
    pub chunks_created: usize,
    pub embeddings_indexed: usize,
    pub total_pages: usize,
    pub duration_seconds: f64,
    pub chapters: usize,
    pub lessons: usize,
    pub from_cache: bool,
    /// Chunks of a previous ingestion of the same book that were replaced
    pub replaced_chunks: usize,
}

/// Ingest one book. Re-ingesting the same (name, grade) replaces the book.
pub async fn cmd_ingest(library: &Library, request: IngestRequest) -> Result<IngestStats> {
    let started = Instant::now();
    let book_id = ids::book_id(&request.book_name, &request.grade);
    info!("Ingesting '{}' ({}) as {}", request.book_name, request.grade, book_id);

    let guard = library.lock_writes().await;
    let run = library
        .db()
        .start_run(Some(&book_id), RunOperation::Ingest)
        .await?;

    let result = ingest_book(library, &guard, &request, &book_id).await;
    match &result {
        Ok(stats) => {
            library
                .db()
                .complete_run(
                    &run.id,
                    RunStatus::Completed,
                    stats.total_pages,
                    stats.chunks_created,
                    None,
                )
                .await?
        }
        Err(e) => {
            warn!("Ingestion of {} failed: {}", book_id, e);
            library
                .db()
                .complete_run(&run.id, RunStatus::Failed, 0, 0, Some(e.to_string()))
                .await?
        }
    }

    let mut stats = result?;
    stats.duration_seconds = started.elapsed().as_secs_f64();
    info!(
        "Ingested {}: {} pages, {} chunks in {:.1}s",
        book_id, stats.total_pages, stats.chunks_created, stats.duration_seconds
    );
    Ok(stats)
}

async fn ingest_book(
    library: &Library,
    guard: &WriteGuard<'_>,
    request: &IngestRequest,
    book_id: &str,
) -> Result<IngestStats> {
    let config = library.config();
    let grade_ref = request.grade.resolve();

    let source = PdfSource::parse(&request.source)?;
    let fetcher = Fetcher::new(Duration::from_secs(config.ingest.fetch_timeout_secs))?;
    let bytes = fetcher.fetch(&source).await?;

    if request.force_clear_cache {
        library.cache().clear_all()?;
    }
    let key = ParseCache::key(&request.book_name, &grade_ref, &bytes);

    let (structure, from_cache) = match cached_structure(library, &key, request.force_reparse) {
        Some(structure) => (structure, true),
        None => {
            let pages = library.extractor().extract(Arc::new(bytes)).await?;
            let structure = library.structure().recover(book_id, &pages).await;
            let cached = CachedParse::new(&request.book_name, &grade_ref, structure.clone());
            if let Err(e) = library.cache().store(&key, &cached) {
                warn!("Could not cache parse: {}", e);
            }
            (structure, false)
        }
    };

    let chunks = chunk_pages(&structure.pages, &config.chunk);
    info!("Created {} chunks from {} pages", chunks.len(), structure.pages.len());

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_in_batches(library.embedder(), texts, config.embedding.batch_size).await?;
    if vectors.len() != chunks.len() {
        return Err(Error::Embedding(format!(
            "Got {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        )));
    }

    // Leftovers of an earlier failed run must not shift the new positions
    library.reconcile(guard).await?;
    if let Some(dim) = vectors
        .first()
        .map(|v| v.len())
        .or_else(|| library.embedder().dimension())
    {
        library.index().ensure(dim)?;
    }

    let outline = outline_with_counts(book_id, &structure, &chunks);
    let base = library.index().len()?;
    let created_at = Utc::now().to_rfc3339();

    let mut tx = library.db().begin().await?;
    let removed = MetaDb::clear_book_in(&mut tx, book_id, true).await?;

    let mut book = Book::new(
        book_id.to_string(),
        request.book_name.trim().to_string(),
        grade_ref.clone(),
        request.subject_id.clone(),
    );
    book.structure_json = Some(serde_json::to_string(&outline)?);
    MetaDb::upsert_book_in(&mut tx, &book).await?;

    for chapter in &outline.chapters {
        MetaDb::insert_chapter_in(
            &mut tx,
            &Chapter {
                chapter_id: chapter.chapter_id.clone(),
                book_id: book_id.to_string(),
                title: chapter.title.clone(),
                ord: chapter.order as i64,
            },
        )
        .await?;
        for lesson in &chapter.lessons {
            MetaDb::insert_lesson_in(
                &mut tx,
                &Lesson {
                    lesson_id: lesson.lesson_id.clone(),
                    chapter_id: chapter.chapter_id.clone(),
                    book_id: book_id.to_string(),
                    title: lesson.title.clone(),
                    page: lesson.page.map(i64::from),
                    ord: lesson.order as i64,
                },
            )
            .await?;
        }
    }

    for (i, (chunk, vector)) in chunks.iter().zip(&vectors).enumerate() {
        let (chapter_id, lesson_id) = scope_ids(book_id, chunk);
        let row = Chunk {
            embedding_index: (base + i) as i64,
            chunk_id: ids::chunk_id(chunk.seq),
            book_id: book_id.to_string(),
            chapter_id,
            lesson_id,
            page: chunk.page as i64,
            grade_ref: grade_ref.clone(),
            book_name: book.name.clone(),
            text: chunk.text.clone(),
            created_at: created_at.clone(),
        };
        MetaDb::insert_chunk_in(&mut tx, &row, vector).await?;
    }

    // Vectors land before the rows commit; a crash in between leaves
    // trailing vectors that reconciliation truncates.
    let start = if vectors.is_empty() {
        base
    } else {
        library.index().append(&vectors)?
    };
    if start != base {
        library.index().truncate(base)?;
        return Err(Error::IndexCorrupt(format!(
            "expected to append at {}, index appended at {}",
            base, start
        )));
    }

    if let Err(e) = tx.commit().await {
        library.index().truncate(base)?;
        return Err(e.into());
    }

    if removed.removed_chunks > 0 {
        info!(
            "Replaced {} chunks from the previous ingestion; rebuilding index",
            removed.removed_chunks
        );
        library.rebuild(guard).await?;
    }

    Ok(IngestStats {
        status: "completed".to_string(),
        book_id: book_id.to_string(),
        chunks_created: chunks.len(),
        embeddings_indexed: vectors.len(),
        total_pages: structure.pages.len(),
        duration_seconds: 0.0,
        chapters: outline.chapters.len(),
        lessons: outline.lesson_count(),
        from_cache,
        replaced_chunks: removed.removed_chunks,
    })
}

/// A cached parse that passes the sanity check
fn cached_structure(library: &Library, key: &str, force_reparse: bool) -> Option<RecoveredStructure> {
    if force_reparse {
        debug!("Reparse forced, skipping cache");
        return None;
    }

    let cached = library.cache().load(key)?;
    let config = library.config();
    match sanity_check(
        &cached.structure,
        library.structure().detector(),
        config.ingest.cache_check_pages,
        config.structure.max_heading_chars,
    ) {
        Ok(()) => {
            info!("Using cached parse ({} pages)", cached.total_pages);
            Some(cached.structure)
        }
        Err(reason) => {
            warn!("Rejecting cached parse: {}", reason);
            None
        }
    }
}

fn scope_ids(book_id: &str, chunk: &PageChunk) -> (Option<String>, Option<String>) {
    let chapter_id = chunk
        .chapter
        .as_deref()
        .map(|title| ids::chapter_id(book_id, title));
    let lesson_id = match (&chapter_id, chunk.lesson.as_deref()) {
        (Some(chapter_id), Some(title)) => Some(ids::lesson_id(chapter_id, title)),
        _ => None,
    };
    (chapter_id, lesson_id)
}

fn outline_with_counts(book_id: &str, structure: &RecoveredStructure, chunks: &[PageChunk]) -> Outline {
    let mut counts: HashMap<(Option<String>, Option<String>), usize> = HashMap::new();
    for chunk in chunks {
        *counts.entry(scope_ids(book_id, chunk)).or_default() += 1;
    }
    let mut outline = structure.outline.clone();
    outline.apply_chunk_counts(&counts);
    outline
}

/// Print ingest stats to console
pub fn print_ingest_stats(stats: &IngestStats) {
    println!("\n📥 Ingestion complete\n");
    println!("Book: {}", stats.book_id);
    println!("Pages: {}", stats.total_pages);
    println!(
        "Structure: {} chapters, {} lessons",
        stats.chapters, stats.lessons
    );
    println!("Chunks created: {}", stats.chunks_created);
    println!("Embeddings indexed: {}", stats.embeddings_indexed);
    if stats.replaced_chunks > 0 {
        println!("Replaced chunks: {}", stats.replaced_chunks);
    }
    if stats.from_cache {
        println!("Parse: cached");
    }
    println!("Duration: {:.1}s", stats.duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::tests::{open_test_library, test_config};
    use crate::testing::{synthetic_pdf, FakeEmbedder};
    use tempfile::TempDir;

    const BOOK: &str = "Biology Basics";

    fn write_three_page_pdf(tmp: &TempDir) -> String {
        let pdf = synthetic_pdf(&[
            &[(11.0, "Welcome to the course")],
            &[
                (24.0, "Chapter 1: Basics"),
                (18.0, "Lesson 1: Intro"),
                (11.0, "Plants make food"),
            ],
            &[(11.0, "Sunlight powers photosynthesis")],
        ]);
        let path = tmp.path().join("biology.pdf");
        std::fs::write(&path, pdf).unwrap();
        path.display().to_string()
    }

    fn request(source: &str) -> IngestRequest {
        IngestRequest {
            source: source.to_string(),
            book_name: BOOK.to_string(),
            grade: GradeRef::Number(5),
            subject_id: None,
            force_reparse: false,
            force_clear_cache: false,
        }
    }

    #[tokio::test]
    async fn test_three_page_scenario() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let embedder = Arc::new(FakeEmbedder::new(8));
        let library = open_test_library(test_config(&tmp), embedder.clone(), None).await;

        let stats = cmd_ingest(&library, request(&source)).await.unwrap();
        assert_eq!(stats.status, "completed");
        assert_eq!(stats.total_pages, 3);
        assert_eq!(stats.chunks_created, 3);
        assert_eq!(stats.embeddings_indexed, 3);
        assert_eq!((stats.chapters, stats.lessons), (1, 1));

        let book_id = ids::book_id(BOOK, &GradeRef::Number(5));
        let chapters = library.db().list_chapters(&book_id).await.unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Chapter 1: Basics");
        let lessons = library.db().list_lessons(&chapters[0].chapter_id).await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].title, "Lesson 1: Intro");
        assert_eq!(lessons[0].page, Some(2));

        let chunks = library.db().list_book_chunks(&book_id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.page).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(chunks[0].chapter_id, None);
        assert_eq!(chunks[0].lesson_id, None);
        for chunk in &chunks[1..] {
            assert_eq!(chunk.chapter_id.as_deref(), Some(chapters[0].chapter_id.as_str()));
            assert_eq!(chunk.lesson_id.as_deref(), Some(lessons[0].lesson_id.as_str()));
        }

        // Vectors sit at each chunk's position, in page order
        let snapshot = library.index().snapshot().unwrap().unwrap();
        assert_eq!(snapshot.len(), 3);
        for chunk in &chunks {
            let stored = snapshot.vector(chunk.embedding_index as usize).unwrap();
            assert_eq!(stored, embedder.vector_for(&chunk.text).as_slice());
        }

        let book = library.db().get_book(&book_id).await.unwrap().unwrap();
        let outline: Outline = serde_json::from_str(&book.structure_json.unwrap()).unwrap();
        assert_eq!(outline.chapters[0].chunk_count, 2);
        assert_eq!(outline.chapters[0].lessons[0].chunk_count, 2);
    }

    #[tokio::test]
    async fn test_reingest_replaces_book() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;

        let first = cmd_ingest(&library, request(&source)).await.unwrap();
        assert!(!first.from_cache);
        let second = cmd_ingest(&library, request(&source)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.replaced_chunks, first.chunks_created);

        let book_id = ids::book_id(BOOK, &GradeRef::Number(5));
        assert_eq!(
            library.db().count_book_chunks(&book_id).await.unwrap(),
            first.chunks_created
        );
        assert_eq!(library.db().list_books().await.unwrap().len(), 1);
        assert_eq!(library.db().list_chapters(&book_id).await.unwrap().len(), 1);

        // The rebuild leaves a dense index with no orphaned vectors
        let chunks = library.db().list_book_chunks(&book_id).await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.embedding_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(library.index().len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reingest_advances_past_other_books() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;

        cmd_ingest(&library, request(&source)).await.unwrap();
        let mut other = request(&source);
        other.book_name = "Another Book".to_string();
        cmd_ingest(&library, other).await.unwrap();

        let other_id = ids::book_id("Another Book", &GradeRef::Number(5));
        let chunks = library.db().list_book_chunks(&other_id).await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.embedding_index).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(library.index().len().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_state_untouched() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let mut config = test_config(&tmp);
        config.embedding.batch_size = 1;
        // Second batch of the first run fails
        let embedder = Arc::new(FakeEmbedder::new(8).failing_on_call(2));
        let library = open_test_library(config, embedder, None).await;

        let err = cmd_ingest(&library, request(&source)).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));

        assert!(library.db().list_books().await.unwrap().is_empty());
        assert_eq!(library.index().len().unwrap(), 0);
        let runs = library.db().recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "failed");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let config = test_config(&tmp);
        {
            let library =
                open_test_library(config.clone(), Arc::new(FakeEmbedder::new(8)), None).await;
            cmd_ingest(&library, request(&source)).await.unwrap();
        }

        let library = open_test_library(config, Arc::new(FakeEmbedder::new(4)), None).await;
        let mut other = request(&source);
        other.book_name = "Other".to_string();
        let err = cmd_ingest(&library, other).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 8, actual: 4 }));
        assert_eq!(library.db().list_books().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_fetch_error() {
        let tmp = TempDir::new().unwrap();
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;
        let missing = tmp.path().join("missing.pdf").display().to_string();

        let err = cmd_ingest(&library, request(&missing)).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn test_force_reparse_skips_cache() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;

        cmd_ingest(&library, request(&source)).await.unwrap();
        let mut forced = request(&source);
        forced.force_reparse = true;
        let reparsed = cmd_ingest(&library, forced).await.unwrap();
        assert!(!reparsed.from_cache);
        assert_eq!(reparsed.chunks_created, 3);

        // The fresh parse was cached again
        let again = cmd_ingest(&library, request(&source)).await.unwrap();
        assert!(again.from_cache);
    }

    #[tokio::test]
    async fn test_force_clear_cache_purges_other_books() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;

        let mut other = request(&source);
        other.book_name = "Another Book".to_string();
        cmd_ingest(&library, other).await.unwrap();
        cmd_ingest(&library, request(&source)).await.unwrap();

        let bytes = std::fs::read(&source).unwrap();
        let grade = GradeRef::Number(5).resolve();
        let other_key = ParseCache::key("Another Book", &grade, &bytes);
        assert!(library.cache().load(&other_key).is_some());

        let mut clearing = request(&source);
        clearing.force_clear_cache = true;
        let stats = cmd_ingest(&library, clearing).await.unwrap();
        assert!(!stats.from_cache);

        assert!(library.cache().load(&other_key).is_none());
        let remaining: Vec<_> = std::fs::read_dir(&library.config().paths.cache_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with("_pages.json"))
            .collect();
        assert_eq!(remaining.len(), 1);
        let own_key = ParseCache::key(BOOK, &grade, &bytes);
        assert!(library.cache().load(&own_key).is_some());
    }

    #[tokio::test]
    async fn test_bad_cache_entry_is_reparsed() {
        let tmp = TempDir::new().unwrap();
        let source = write_three_page_pdf(&tmp);
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;

        let bytes = std::fs::read(&source).unwrap();
        let key = ParseCache::key(BOOK, &GradeRef::Number(5).resolve(), &bytes);
        let bogus = RecoveredStructure {
            pages: Vec::new(),
            outline: Outline::default(),
        };
        library
            .cache()
            .store(&key, &CachedParse::new(BOOK, "x", bogus))
            .unwrap();

        let stats = cmd_ingest(&library, request(&source)).await.unwrap();
        assert!(!stats.from_cache);
        assert_eq!(stats.total_pages, 3);
    }
}
