//! Delete command implementation

use crate::error::{Error, Result};
use crate::library::Library;
use crate::meta::{MetaDb, RemovedCounts, RunOperation, RunStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteStats {
    pub book_id: String,
    #[serde(flatten)]
    pub removed: RemovedCounts,
    pub index_vectors_before: usize,
    pub index_vectors_after: usize,
}

/// Remove a book and everything under it, then rebuild the index
pub async fn cmd_delete(library: &Library, book_id: &str) -> Result<DeleteStats> {
    let guard = library.lock_writes().await;

    if library.db().get_book(book_id).await?.is_none() {
        return Err(Error::BookNotFound(book_id.to_string()));
    }

    let run = library
        .db()
        .start_run(Some(book_id), RunOperation::Delete)
        .await?;

    let result = async {
        let mut tx = library.db().begin().await?;
        let removed = MetaDb::clear_book_in(&mut tx, book_id, false).await?;
        tx.commit().await?;
        Ok::<_, Error>(removed)
    }
    .await;

    let removed = match result {
        Ok(removed) => {
            library
                .db()
                .complete_run(&run.id, RunStatus::Completed, 0, 0, None)
                .await?;
            removed
        }
        Err(e) => {
            warn!("Delete of {} failed: {}", book_id, e);
            library
                .db()
                .complete_run(&run.id, RunStatus::Failed, 0, 0, Some(e.to_string()))
                .await?;
            return Err(e);
        }
    };

    let rebuild = library.rebuild(&guard).await?;
    info!(
        "Deleted {}: {} chunks, {} chapters, {} lessons",
        book_id, removed.removed_chunks, removed.removed_chapters, removed.removed_lessons
    );

    Ok(DeleteStats {
        book_id: book_id.to_string(),
        removed,
        index_vectors_before: rebuild.vectors_before,
        index_vectors_after: rebuild.vectors_after,
    })
}

/// Print delete stats to console
pub fn print_delete_stats(stats: &DeleteStats) {
    println!("\n🗑  Deleted {}\n", stats.book_id);
    println!("Chunks removed: {}", stats.removed.removed_chunks);
    println!("Chapters removed: {}", stats.removed.removed_chapters);
    println!("Lessons removed: {}", stats.removed.removed_lessons);
    println!(
        "Index: {} -> {} vectors",
        stats.index_vectors_before, stats.index_vectors_after
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ingest::{cmd_ingest, IngestRequest};
    use crate::ids::{self, GradeRef};
    use crate::library::tests::{open_test_library, test_config};
    use crate::testing::{synthetic_pdf, FakeEmbedder};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ingest_request(source: &str, name: &str) -> IngestRequest {
        IngestRequest {
            source: source.to_string(),
            book_name: name.to_string(),
            grade: GradeRef::Number(3),
            subject_id: None,
            force_reparse: false,
            force_clear_cache: false,
        }
    }

    #[tokio::test]
    async fn test_delete_shrinks_index_by_book_chunks() {
        let tmp = TempDir::new().unwrap();
        let pdf = synthetic_pdf(&[
            &[(24.0, "Chapter 1: Numbers"), (11.0, "Counting to ten")],
            &[(11.0, "Adding small numbers")],
        ]);
        let path = tmp.path().join("math.pdf");
        std::fs::write(&path, pdf).unwrap();
        let source = path.display().to_string();

        let library =
            open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;
        let first = cmd_ingest(&library, ingest_request(&source, "Math A")).await.unwrap();
        let second = cmd_ingest(&library, ingest_request(&source, "Math B")).await.unwrap();
        let total = first.chunks_created + second.chunks_created;
        assert_eq!(library.index().len().unwrap(), total);

        let book_a = ids::book_id("Math A", &GradeRef::Number(3));
        let stats = cmd_delete(&library, &book_a).await.unwrap();

        assert_eq!(stats.removed.removed_chunks, first.chunks_created);
        assert_eq!(stats.removed.removed_chapters, 1);
        assert_eq!(stats.index_vectors_before, total);
        assert_eq!(stats.index_vectors_after, total - first.chunks_created);
        assert_eq!(library.index().len().unwrap(), second.chunks_created);
        assert!(library.db().get_book(&book_a).await.unwrap().is_none());

        // The surviving book was renumbered from zero and still lines up
        let book_b = ids::book_id("Math B", &GradeRef::Number(3));
        let chunks = library.db().list_book_chunks(&book_b).await.unwrap();
        let snapshot = library.index().snapshot().unwrap().unwrap();
        let embedder = FakeEmbedder::new(8);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.embedding_index, i as i64);
            assert_eq!(
                snapshot.vector(i).unwrap(),
                embedder.vector_for(&chunk.text).as_slice()
            );
        }
    }

    #[tokio::test]
    async fn test_readers_see_rebuild_as_one_step() {
        let tmp = TempDir::new().unwrap();
        let pdf = synthetic_pdf(&[
            &[(24.0, "Chapter 1: Numbers"), (11.0, "Counting to ten")],
            &[(11.0, "Adding small numbers")],
        ]);
        let path = tmp.path().join("math.pdf");
        std::fs::write(&path, pdf).unwrap();
        let source = path.display().to_string();

        let library =
            open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;
        let first = cmd_ingest(&library, ingest_request(&source, "Math A")).await.unwrap();
        let second = cmd_ingest(&library, ingest_request(&source, "Math B")).await.unwrap();
        let total = first.chunks_created + second.chunks_created;
        let book_a = ids::book_id("Math A", &GradeRef::Number(3));
        let book_b = ids::book_id("Math B", &GradeRef::Number(3));
        let old_positions: Vec<i64> = (first.chunks_created..total).map(|i| i as i64).collect();

        let kept = second.chunks_created;

        let view = library.read_view().await;
        let (lib, positions, survivor) = (&library, &old_positions, &book_b);
        let reader = async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            // The rebuild waits, so the old numbering still joins
            assert_eq!(lib.index().len().unwrap(), total);
            let chunks = lib.db().chunks_by_indices(positions).await.unwrap();
            assert_eq!(chunks.len(), kept);
            assert!(chunks.iter().all(|c| &c.book_id == survivor));
            drop(view);
        };
        let (stats, ()) = tokio::join!(cmd_delete(&library, &book_a), reader);
        stats.unwrap();

        assert_eq!(library.index().len().unwrap(), kept);
        let chunks = library.db().chunks_by_indices(&[0]).await.unwrap();
        assert_eq!(chunks[0].book_id, book_b);
    }

    #[tokio::test]
    async fn test_delete_unknown_book() {
        let tmp = TempDir::new().unwrap();
        let library =
            open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(8)), None).await;
        let err = cmd_delete(&library, "missing").await.unwrap_err();
        assert!(matches!(err, Error::BookNotFound(id) if id == "missing"));
    }
}
