//! Status, book list and outline views

use crate::error::{Error, Result};
use crate::library::Library;
use crate::meta::{GlobalStats, IngestionRun};
use crate::structure::Outline;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub index_path: String,
    pub embedding_model: String,
    pub generation_enabled: bool,
    pub index_vectors: usize,
    pub index_dimension: Option<usize>,
    /// Positions referenced by stored chunks
    pub referenced_vectors: usize,
    pub needs_reconcile: bool,
    pub db_stats: GlobalStats,
    pub recent_runs: Vec<IngestionRun>,
}

/// Get system status
pub async fn cmd_status(library: &Library) -> Result<StatusInfo> {
    info!("Getting status");
    let config = library.config();

    let (index_vectors, referenced_vectors) = library.index_extent().await?;

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        index_path: config.paths.index_file.display().to_string(),
        embedding_model: library.embedder().model_name().to_string(),
        generation_enabled: library.generator().is_some(),
        index_vectors,
        index_dimension: library.index().dim()?,
        referenced_vectors,
        needs_reconcile: index_vectors != referenced_vectors,
        db_stats: library.db().get_global_stats().await?,
        recent_runs: library.db().recent_runs(5).await?,
    })
}

/// A book with its size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookInfo {
    pub book_id: String,
    pub name: String,
    pub grade_ref: String,
    pub subject_id: Option<String>,
    pub chapters: usize,
    pub chunks: usize,
    pub updated_at: String,
}

/// List all books
pub async fn cmd_books(library: &Library) -> Result<Vec<BookInfo>> {
    let db = library.db();
    let books = db.list_books().await?;
    let mut result = Vec::with_capacity(books.len());

    for book in books {
        let chapters = db.list_chapters(&book.book_id).await?.len();
        let chunks = db.count_book_chunks(&book.book_id).await?;
        result.push(BookInfo {
            book_id: book.book_id,
            name: book.name,
            grade_ref: book.grade_ref,
            subject_id: book.subject_id,
            chapters,
            chunks,
            updated_at: book.updated_at,
        });
    }

    Ok(result)
}

/// A book's chapter/lesson tree with current chunk counts
pub async fn cmd_outline(library: &Library, book_id: &str) -> Result<Outline> {
    let db = library.db();
    let book = db
        .get_book(book_id)
        .await?
        .ok_or_else(|| Error::BookNotFound(book_id.to_string()))?;

    let mut outline = match book.structure_json.as_deref() {
        Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
            warn!("Stored outline for {} is unreadable: {}", book_id, e);
            Outline::default()
        }),
        None => Outline::default(),
    };
    outline.apply_chunk_counts(&db.chunk_counts_by_scope(book_id).await?);
    Ok(outline)
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 syllabus Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!("\nVector index: {}", status.index_path);
    println!("  Vectors: {}", status.index_vectors);
    match status.index_dimension {
        Some(dim) => println!("  Dimension: {}", dim),
        None => println!("  Dimension: (not created - run 'syllabus ingest')"),
    }
    let consistency = if status.needs_reconcile {
        format!(
            "⚠ Store references {} positions; reconciles on next write",
            status.referenced_vectors
        )
    } else {
        "✓ In sync with the document store".to_string()
    };
    println!("  Status: {}", consistency);
    println!("\nEmbedding Model: {}", status.embedding_model);
    println!(
        "Generation: {}",
        if status.generation_enabled { "enabled" } else { "disabled (no API key)" }
    );
    println!("\nDatabase Stats:");
    println!("  Books: {}", status.db_stats.book_count);
    println!("  Chapters: {}", status.db_stats.chapter_count);
    println!("  Lessons: {}", status.db_stats.lesson_count);
    println!("  Chunks: {}", status.db_stats.chunk_count);

    if !status.recent_runs.is_empty() {
        println!("\nRecent runs:");
        for run in &status.recent_runs {
            println!(
                "  {} {} [{}] {}",
                run.started_at,
                run.operation,
                run.status,
                run.book_id.as_deref().unwrap_or("-")
            );
        }
    }
}

/// Print books list to console
pub fn print_books(books: &[BookInfo]) {
    println!("\n📚 Books\n");

    if books.is_empty() {
        println!("No books yet. Use 'syllabus ingest' to add one.");
        return;
    }

    for book in books {
        println!("• {}", book.name);
        println!("  ID: {}", book.book_id);
        println!("  Grade: {}", book.grade_ref);
        if let Some(subject) = &book.subject_id {
            println!("  Subject: {}", subject);
        }
        println!("  Chapters: {}, Chunks: {}", book.chapters, book.chunks);
        println!("  Updated: {}", book.updated_at);
        println!();
    }
}

fn page_range(start: Option<u32>, end: Option<u32>) -> String {
    match (start, end) {
        (Some(s), Some(e)) if s != e => format!("pp. {}-{}", s, e),
        (Some(s), _) => format!("p. {}", s),
        _ => "no pages".to_string(),
    }
}

/// Print a book outline to console
pub fn print_outline(outline: &Outline) {
    println!("\n📖 Outline (from {})\n", outline.source);

    if outline.chapters.is_empty() {
        println!("No chapters detected.");
        return;
    }

    for chapter in &outline.chapters {
        println!(
            "{}. {} [{}, {} chunks]",
            chapter.order + 1,
            chapter.title,
            page_range(chapter.start_page, chapter.end_page),
            chapter.chunk_count
        );
        for lesson in &chapter.lessons {
            println!(
                "   {}.{} {} [{}, {} chunks]",
                chapter.order + 1,
                lesson.order + 1,
                lesson.title,
                page_range(lesson.page, lesson.end_page),
                lesson.chunk_count
            );
        }
    }
}
