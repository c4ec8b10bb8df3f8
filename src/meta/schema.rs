//! SQLite schema definition

/// SQL schema for the document store
pub const SCHEMA_SQL: &str = r#"
-- Books: one row per (normalized name, grade)
CREATE TABLE IF NOT EXISTS books (
    book_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    grade_ref TEXT NOT NULL,
    subject_id TEXT,
    structure_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Chapters: ordered within a book
CREATE TABLE IF NOT EXISTS chapters (
    chapter_id TEXT PRIMARY KEY,
    book_id TEXT NOT NULL REFERENCES books(book_id),
    title TEXT NOT NULL,
    ord INTEGER NOT NULL
);

-- Lessons: ordered within a chapter
CREATE TABLE IF NOT EXISTS lessons (
    lesson_id TEXT PRIMARY KEY,
    chapter_id TEXT NOT NULL REFERENCES chapters(chapter_id),
    book_id TEXT NOT NULL REFERENCES books(book_id),
    title TEXT NOT NULL,
    page INTEGER,
    ord INTEGER NOT NULL
);

-- Chunks: passages keyed by their position in the vector index
CREATE TABLE IF NOT EXISTS chunks (
    embedding_index INTEGER PRIMARY KEY,
    chunk_id TEXT NOT NULL,
    book_id TEXT NOT NULL REFERENCES books(book_id),
    chapter_id TEXT,
    lesson_id TEXT,
    page INTEGER NOT NULL,
    grade_ref TEXT NOT NULL,
    book_name TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(book_id, chunk_id)
);

-- Ingestion runs: ingest/delete/rebuild history
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id TEXT PRIMARY KEY,
    book_id TEXT,
    operation TEXT NOT NULL DEFAULT 'ingest',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    pages INTEGER DEFAULT 0,
    chunks_created INTEGER DEFAULT 0,
    error TEXT
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_chapters_book ON chapters(book_id, ord);
CREATE INDEX IF NOT EXISTS idx_lessons_chapter ON lessons(chapter_id, ord);
CREATE INDEX IF NOT EXISTS idx_lessons_book ON lessons(book_id);
CREATE INDEX IF NOT EXISTS idx_chunks_book ON chunks(book_id);
CREATE INDEX IF NOT EXISTS idx_chunks_scope ON chunks(book_id, chapter_id, lesson_id);
CREATE INDEX IF NOT EXISTS idx_runs_book ON ingestion_runs(book_id);
"#;
