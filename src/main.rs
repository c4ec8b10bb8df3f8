//! syllabus CLI entry point

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use syllabus::{
    commands::{
        cmd_books, cmd_delete, cmd_ingest, cmd_init, cmd_outline, cmd_query, cmd_rebuild,
        cmd_status, print_books, print_delete_stats, print_ingest_stats, print_init_result,
        print_outline, print_query_response, print_rebuild_stats, print_status, IngestRequest,
        InitOptions, QueryRequest,
    },
    config::Config,
    error::{Error, Result},
    ids::GradeRef,
    library::Library,
    progress::LogWriterFactory,
};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "syllabus")]
#[command(version, about = "Textbook PDF ingestion and scoped retrieval", long_about = None)]
struct Cli {
    /// Path to config file (or its directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize syllabus configuration and database
    Init {
        /// Overwrite an existing config with defaults
        #[arg(long)]
        force: bool,
    },

    #[command(flatten)]
    Library(LibraryCommand),
}

/// Commands that run against an initialized library
#[derive(Subcommand)]
enum LibraryCommand {
    /// Ingest a textbook PDF
    Ingest {
        /// URL, file:// URL or local path of the PDF
        source: String,

        /// Book name
        #[arg(short, long)]
        name: String,

        /// Grade number
        #[arg(long, conflicts_with = "grade_id", required_unless_present = "grade_id")]
        grade: Option<u32>,

        /// Existing grade id
        #[arg(long)]
        grade_id: Option<String>,

        /// Subject id
        #[arg(long)]
        subject: Option<String>,

        /// Ignore any cached parse of this PDF
        #[arg(long)]
        force_reparse: bool,

        /// Delete all cached parses first
        #[arg(long)]
        force_clear_cache: bool,
    },

    /// Ask a question scoped to a book, chapter or lesson
    Query {
        /// Free-text intent
        content: String,

        /// Book id
        #[arg(long)]
        book: String,

        /// Chapter id
        #[arg(long)]
        chapter: Option<String>,

        /// Lesson id
        #[arg(long)]
        lesson: Option<String>,

        /// Require the book to belong to this subject
        #[arg(long)]
        subject: Option<String>,

        /// Number of passages to retrieve
        #[arg(short)]
        k: Option<usize>,
    },

    /// Delete a book and rebuild the index
    Delete {
        /// Book id (see 'syllabus books')
        book_id: String,
    },

    /// Rebuild the vector index from stored passages
    Rebuild,

    /// Show system status
    Status,

    /// List ingested books
    Books,

    /// Show a book's chapter and lesson outline
    Outline {
        /// Book id
        book_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    let base_dir = base_dir(cli.config.as_deref());

    match cli.command {
        // Init does not need an existing library
        Commands::Init { force } => {
            let result = cmd_init(InitOptions { base_dir, force }).await?;
            output(cli.json, &result, print_init_result)
        }
        Commands::Library(command) => {
            let config = Config::load_from(Some(base_dir))?;
            if !config.is_initialized() {
                return Err(Error::NotInitialized);
            }
            let library = Library::open(config).await?;
            run_library_command(&library, command, cli.json).await
        }
    }
}

async fn run_library_command(library: &Library, command: LibraryCommand, json: bool) -> Result<()> {
    match command {
        LibraryCommand::Ingest {
            source,
            name,
            grade,
            grade_id,
            subject,
            force_reparse,
            force_clear_cache,
        } => {
            let grade = match (grade, grade_id) {
                (Some(n), _) => GradeRef::Number(n),
                (None, Some(id)) if !id.trim().is_empty() => GradeRef::Id(id),
                _ => {
                    return Err(Error::Config(
                        "Either --grade or a non-empty --grade-id is required".to_string(),
                    ))
                }
            };
            let request = IngestRequest {
                source,
                book_name: name,
                grade,
                subject_id: subject,
                force_reparse,
                force_clear_cache,
            };
            let stats = cmd_ingest(library, request).await?;
            output(json, &stats, print_ingest_stats)
        }

        LibraryCommand::Query {
            content,
            book,
            chapter,
            lesson,
            subject,
            k,
        } => {
            let request = QueryRequest {
                book_id: book,
                chapter_id: chapter,
                lesson_id: lesson,
                subject_id: subject,
                content,
                k,
            };
            let response = cmd_query(library, request).await?;
            output(json, &response, print_query_response)
        }

        LibraryCommand::Delete { book_id } => {
            let stats = cmd_delete(library, &book_id).await?;
            output(json, &stats, print_delete_stats)
        }

        LibraryCommand::Rebuild => {
            let stats = cmd_rebuild(library).await?;
            output(json, &stats, print_rebuild_stats)
        }

        LibraryCommand::Status => {
            let status = cmd_status(library).await?;
            output(json, &status, print_status)
        }

        LibraryCommand::Books => {
            let books = cmd_books(library).await?;
            output(json, &books, |b: &Vec<_>| print_books(b))
        }

        LibraryCommand::Outline { book_id } => {
            let outline = cmd_outline(library, &book_id).await?;
            output(json, &outline, print_outline)
        }
    }
}

/// Base directory from `--config`, which may name the file or its directory
fn base_dir(config: Option<&Path>) -> PathBuf {
    match config {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(Config::default_base_dir),
        Some(path) => path.to_path_buf(),
        None => Config::default_base_dir(),
    }
}

fn output<T: Serialize>(json: bool, value: &T, print: impl Fn(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}
