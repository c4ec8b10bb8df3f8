//! Document store using SQLite
//!
//! This module handles all local storage besides the vector blob:
//! - Books, chapters and lessons (keyed by content-addressed ids)
//! - Chunks (passages keyed by `embedding_index`, with their stored vectors)
//! - Ingestion runs (history and stats)
//!
//! Multi-row writes for one ingestion go through the `*_in` associated
//! functions, which take a connection so callers can run them inside a
//! transaction.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(Error::Config(format!("Unknown run status: {}", s))),
        }
    }
}

/// Kind of mutation recorded in `ingestion_runs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOperation {
    Ingest,
    Delete,
    Rebuild,
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOperation::Ingest => write!(f, "ingest"),
            RunOperation::Delete => write!(f, "delete"),
            RunOperation::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// A book
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Book {
    pub book_id: String,
    pub name: String,
    /// Resolved grade id
    pub grade_ref: String,
    pub subject_id: Option<String>,
    pub structure_json: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Book {
    pub fn new(book_id: String, name: String, grade_ref: String, subject_id: Option<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            book_id,
            name,
            grade_ref,
            subject_id,
            structure_json: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub chapter_id: String,
    pub book_id: String,
    pub title: String,
    pub ord: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Lesson {
    pub lesson_id: String,
    pub chapter_id: String,
    pub book_id: String,
    pub title: String,
    pub page: Option<i64>,
    pub ord: i64,
}

/// A stored passage (without its vector)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub embedding_index: i64,
    pub chunk_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub lesson_id: Option<String>,
    pub page: i64,
    pub grade_ref: String,
    pub book_name: String,
    pub text: String,
    pub created_at: String,
}

const CHUNK_COLUMNS: &str = "embedding_index, chunk_id, book_id, chapter_id, lesson_id, page, \
                             grade_ref, book_name, text, created_at";

/// An ingestion run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: String,
    pub book_id: Option<String>,
    pub operation: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub pages: i64,
    pub chunks_created: i64,
    pub error: Option<String>,
}

impl IngestionRun {
    pub fn new(book_id: Option<String>, operation: RunOperation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            book_id,
            operation: operation.to_string(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            pages: 0,
            chunks_created: 0,
            error: None,
        }
    }
}

/// Rows removed when a book is cleared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedCounts {
    pub removed_chunks: usize,
    pub removed_chapters: usize,
    pub removed_lessons: usize,
}

/// Global statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub book_count: usize,
    pub chapter_count: usize,
    pub lesson_count: usize,
    pub chunk_count: usize,
}

/// Encode a vector as a little-endian `f32` blob
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a little-endian `f32` blob
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::IndexCorrupt(format!(
            "stored vector has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Document store handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the document store
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::connect_path(&config.paths.db_file).await
    }

    async fn connect_path(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create database with path directly, initializing the schema if needed
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db = Self::connect_path(db_path).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }
        Ok(db)
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='books'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    /// Begin a write transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ===== Book Operations =====

    pub async fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE book_id = ?")
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(book)
    }

    pub async fn list_books(&self) -> Result<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>("SELECT * FROM books ORDER BY name, grade_ref")
            .fetch_all(&self.pool)
            .await?;
        Ok(books)
    }

    /// Insert or update a book; `created_at` survives re-ingestion
    pub async fn upsert_book_in(conn: &mut SqliteConnection, book: &Book) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO books (book_id, name, grade_ref, subject_id, structure_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                name = excluded.name,
                grade_ref = excluded.grade_ref,
                subject_id = excluded.subject_id,
                structure_json = excluded.structure_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&book.book_id)
        .bind(&book.name)
        .bind(&book.grade_ref)
        .bind(&book.subject_id)
        .bind(&book.structure_json)
        .bind(&book.created_at)
        .bind(&book.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Delete a book's chunks, lessons and chapters, and the book row itself
    /// unless `keep_book` is set.
    pub async fn clear_book_in(
        conn: &mut SqliteConnection,
        book_id: &str,
        keep_book: bool,
    ) -> Result<RemovedCounts> {
        let chunks = sqlx::query("DELETE FROM chunks WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        let lessons = sqlx::query("DELETE FROM lessons WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        let chapters = sqlx::query("DELETE FROM chapters WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        if !keep_book {
            sqlx::query("DELETE FROM books WHERE book_id = ?")
                .bind(book_id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(RemovedCounts {
            removed_chunks: chunks as usize,
            removed_chapters: chapters as usize,
            removed_lessons: lessons as usize,
        })
    }

    // ===== Chapter / Lesson Operations =====

    pub async fn insert_chapter_in(conn: &mut SqliteConnection, chapter: &Chapter) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO chapters (chapter_id, book_id, title, ord) VALUES (?, ?, ?, ?)",
        )
        .bind(&chapter.chapter_id)
        .bind(&chapter.book_id)
        .bind(&chapter.title)
        .bind(chapter.ord)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn insert_lesson_in(conn: &mut SqliteConnection, lesson: &Lesson) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO lessons (lesson_id, chapter_id, book_id, title, page, ord)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lesson.lesson_id)
        .bind(&lesson.chapter_id)
        .bind(&lesson.book_id)
        .bind(&lesson.title)
        .bind(lesson.page)
        .bind(lesson.ord)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get_chapter(&self, chapter_id: &str) -> Result<Option<Chapter>> {
        let chapter = sqlx::query_as::<_, Chapter>("SELECT * FROM chapters WHERE chapter_id = ?")
            .bind(chapter_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chapter)
    }

    pub async fn get_lesson(&self, lesson_id: &str) -> Result<Option<Lesson>> {
        let lesson = sqlx::query_as::<_, Lesson>("SELECT * FROM lessons WHERE lesson_id = ?")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lesson)
    }

    pub async fn list_chapters(&self, book_id: &str) -> Result<Vec<Chapter>> {
        let chapters = sqlx::query_as::<_, Chapter>(
            "SELECT * FROM chapters WHERE book_id = ? ORDER BY ord",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chapters)
    }

    pub async fn list_lessons(&self, chapter_id: &str) -> Result<Vec<Lesson>> {
        let lessons = sqlx::query_as::<_, Lesson>(
            "SELECT * FROM lessons WHERE chapter_id = ? ORDER BY ord",
        )
        .bind(chapter_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lessons)
    }

    // ===== Chunk Operations =====

    pub async fn insert_chunk_in(
        conn: &mut SqliteConnection,
        chunk: &Chunk,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (embedding_index, chunk_id, book_id, chapter_id, lesson_id, page, grade_ref, book_name, text, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.embedding_index)
        .bind(&chunk.chunk_id)
        .bind(&chunk.book_id)
        .bind(&chunk.chapter_id)
        .bind(&chunk.lesson_id)
        .bind(chunk.page)
        .bind(&chunk.grade_ref)
        .bind(&chunk.book_name)
        .bind(&chunk.text)
        .bind(encode_vector(embedding))
        .bind(&chunk.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Chunks for the given index positions, in the same order; positions
    /// without a stored chunk are skipped.
    pub async fn chunks_by_indices(&self, indices: &[i64]) -> Result<Vec<Chunk>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = indices.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT {} FROM chunks WHERE embedding_index IN ({})",
            CHUNK_COLUMNS, placeholders
        );

        let mut query_builder = sqlx::query_as::<_, Chunk>(&query);
        for idx in indices {
            query_builder = query_builder.bind(idx);
        }
        let rows = query_builder.fetch_all(&self.pool).await?;

        let mut by_index: HashMap<i64, Chunk> =
            rows.into_iter().map(|c| (c.embedding_index, c)).collect();
        Ok(indices.iter().filter_map(|i| by_index.remove(i)).collect())
    }

    pub async fn list_book_chunks(&self, book_id: &str) -> Result<Vec<Chunk>> {
        let query = format!(
            "SELECT {} FROM chunks WHERE book_id = ? ORDER BY embedding_index",
            CHUNK_COLUMNS
        );
        let chunks = sqlx::query_as::<_, Chunk>(&query)
            .bind(book_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(chunks)
    }

    pub async fn count_book_chunks(&self, book_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE book_id = ?")
            .bind(book_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Chunk counts per (chapter, lesson) tag for one book
    pub async fn chunk_counts_by_scope(
        &self,
        book_id: &str,
    ) -> Result<HashMap<(Option<String>, Option<String>), usize>> {
        let rows: Vec<(Option<String>, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT chapter_id, lesson_id, COUNT(*) FROM chunks
            WHERE book_id = ?
            GROUP BY chapter_id, lesson_id
            "#,
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(c, l, n)| ((c, l), n as usize))
            .collect())
    }

    /// Highest assigned `embedding_index`
    pub async fn max_embedding_index(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(embedding_index) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    pub async fn max_embedding_index_in(conn: &mut SqliteConnection) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(embedding_index) FROM chunks")
            .fetch_one(conn)
            .await?;
        Ok(max)
    }

    /// Every stored vector, ordered by `embedding_index`
    pub async fn stored_vectors_in(conn: &mut SqliteConnection) -> Result<Vec<(i64, Vec<f32>)>> {
        let rows: Vec<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT embedding_index, embedding FROM chunks ORDER BY embedding_index")
                .fetch_all(conn)
                .await?;

        rows.into_iter()
            .map(|(idx, blob)| Ok((idx, decode_vector(&blob)?)))
            .collect()
    }

    /// Move a chunk to a new index position. Callers renumber in ascending
    /// order so the target position is always free.
    pub async fn renumber_chunk_in(conn: &mut SqliteConnection, from: i64, to: i64) -> Result<()> {
        if from == to {
            return Ok(());
        }
        sqlx::query("UPDATE chunks SET embedding_index = ? WHERE embedding_index = ?")
            .bind(to)
            .bind(from)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ===== Ingestion Run Operations =====

    pub async fn start_run(
        &self,
        book_id: Option<&str>,
        operation: RunOperation,
    ) -> Result<IngestionRun> {
        let run = IngestionRun::new(book_id.map(str::to_string), operation);
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (id, book_id, operation, started_at, status, pages, chunks_created)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.book_id)
        .bind(&run.operation)
        .bind(&run.started_at)
        .bind(&run.status)
        .bind(run.pages)
        .bind(run.chunks_created)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn complete_run(
        &self,
        id: &str,
        status: RunStatus,
        pages: usize,
        chunks_created: usize,
        error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_runs SET
                completed_at = ?,
                status = ?,
                pages = ?,
                chunks_created = ?,
                error = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.to_string())
        .bind(pages as i64)
        .bind(chunks_created as i64)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let runs = sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    // ===== Statistics =====

    async fn count_rows(&self, table: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn get_global_stats(&self) -> Result<GlobalStats> {
        Ok(GlobalStats {
            book_count: self.count_rows("books").await?,
            chapter_count: self.count_rows("chapters").await?,
            lesson_count: self.count_rows("lessons").await?,
            chunk_count: self.count_rows("chunks").await?,
        })
    }
}
