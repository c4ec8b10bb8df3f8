//! The library handle
//!
//! [`Library`] bundles everything ingestion and retrieval share: the
//! document store, the vector index, and the external service clients. It is
//! opened once, reconciles the index against the store on open, and
//! serializes every mutation through one write lock. Queries hold a read
//! view across search and join; a rebuild renumbers the store and swaps the
//! index under the matching write view, so readers see both or neither.

use crate::cache::ParseCache;
use crate::config::Config;
use crate::embed::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::extract::PdfExtractor;
use crate::generate::{create_generator, Generator};
use crate::index::VectorIndex;
use crate::meta::{MetaDb, RunOperation, RunStatus};
use crate::structure::StructureRecoverer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{info, warn};

/// Proof that the caller holds the library's write lock
pub type WriteGuard<'a> = MutexGuard<'a, ()>;

/// Held by readers while index positions are joined to stored chunks
pub type ReadView<'a> = RwLockReadGuard<'a, ()>;

/// What startup reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    Consistent,
    /// Dropped vectors that no committed chunk references
    Truncated { from: usize, to: usize },
    /// Recreated the index from stored chunk vectors
    Rebuilt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildStats {
    pub vectors_before: usize,
    pub vectors_after: usize,
    pub duration_seconds: f64,
}

pub struct Library {
    config: Config,
    db: MetaDb,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    extractor: PdfExtractor,
    structure: StructureRecoverer,
    cache: ParseCache,
    writes: Mutex<()>,
    views: RwLock<()>,
}

impl Library {
    /// Open an initialized library with the configured services
    pub async fn open(config: Config) -> Result<Self> {
        if !config.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let extractor = PdfExtractor::from_config(&config.extract);
        Self::with_services(config, embedder, generator, extractor).await
    }

    /// Open with explicit service implementations
    pub async fn with_services(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
        extractor: PdfExtractor,
    ) -> Result<Self> {
        let db = MetaDb::connect(&config).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }
        let index = VectorIndex::open(&config.paths.index_file)?;
        let structure = StructureRecoverer::new(config.structure.clone(), generator.clone())?;
        let cache = ParseCache::new(&config.paths.cache_dir);

        let library = Self {
            config,
            db,
            index,
            embedder,
            generator,
            extractor,
            structure,
            cache,
            writes: Mutex::new(()),
            views: RwLock::new(()),
        };

        let guard = library.lock_writes().await;
        library.reconcile(&guard).await?;
        drop(guard);

        Ok(library)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &MetaDb {
        &self.db
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn generator(&self) -> Option<&dyn Generator> {
        self.generator.as_deref()
    }

    pub fn extractor(&self) -> &PdfExtractor {
        &self.extractor
    }

    pub fn structure(&self) -> &StructureRecoverer {
        &self.structure
    }

    pub fn cache(&self) -> &ParseCache {
        &self.cache
    }

    /// Serialize ingest, delete and rebuild
    pub async fn lock_writes(&self) -> WriteGuard<'_> {
        self.writes.lock().await
    }

    /// Pin the current index numbering for a search plus join
    pub async fn read_view(&self) -> ReadView<'_> {
        self.views.read().await
    }

    /// Vectors in the index vs. positions referenced by the store
    pub async fn index_extent(&self) -> Result<(usize, usize)> {
        let vectors = self.index.len()?;
        let referenced = self
            .db
            .max_embedding_index()
            .await?
            .map(|max| max as usize + 1)
            .unwrap_or(0);
        Ok((vectors, referenced))
    }

    /// Bring the index back in line with the committed chunks
    pub async fn reconcile(&self, guard: &WriteGuard<'_>) -> Result<Reconciliation> {
        let (vectors, referenced) = self.index_extent().await?;

        if vectors > referenced {
            warn!(
                "Index has {} vectors but only {} are committed; truncating",
                vectors, referenced
            );
            self.index.truncate(referenced)?;
            return Ok(Reconciliation::Truncated {
                from: vectors,
                to: referenced,
            });
        }

        if vectors < referenced {
            warn!(
                "Store references {} positions but index has {} vectors; rebuilding",
                referenced, vectors
            );
            self.rebuild(guard).await?;
            return Ok(Reconciliation::Rebuilt);
        }

        Ok(Reconciliation::Consistent)
    }

    /// Recreate the index from every stored chunk vector, renumbering chunks
    /// densely in their current order. The new index is persisted before the
    /// renumbering commits.
    pub async fn rebuild(&self, _guard: &WriteGuard<'_>) -> Result<RebuildStats> {
        let started = Instant::now();
        let vectors_before = self.index.len()?;
        let run = self.db.start_run(None, RunOperation::Rebuild).await?;

        let result = self.rebuild_inner().await;
        match &result {
            Ok(count) => {
                self.db
                    .complete_run(&run.id, RunStatus::Completed, 0, *count, None)
                    .await?
            }
            Err(e) => {
                self.db
                    .complete_run(&run.id, RunStatus::Failed, 0, 0, Some(e.to_string()))
                    .await?
            }
        }
        let vectors_after = result?;

        info!(
            "Rebuilt vector index: {} -> {} vectors",
            vectors_before, vectors_after
        );
        Ok(RebuildStats {
            vectors_before,
            vectors_after,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    async fn rebuild_inner(&self) -> Result<usize> {
        // Taken before the transaction so a waiting reader never holds a
        // connection the rebuild needs
        let _view = self.views.write().await;
        let previous = self.index.snapshot()?;

        let mut tx = self.db.begin().await?;
        let stored = MetaDb::stored_vectors_in(&mut tx).await?;

        let mut vectors = Vec::with_capacity(stored.len());
        for (position, (embedding_index, vector)) in stored.into_iter().enumerate() {
            MetaDb::renumber_chunk_in(&mut tx, embedding_index, position as i64).await?;
            vectors.push(vector);
        }

        let dim = self.index.dim()?.or_else(|| self.embedder.dimension());
        self.index.replace(dim, &vectors)?;
        if let Err(e) = tx.commit().await {
            warn!("Rebuild commit failed, restoring previous index: {}", e);
            self.index.restore(previous)?;
            return Err(e.into());
        }
        Ok(vectors.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ids::chunk_id;
    use crate::meta::{Book, Chunk};
    use crate::testing::{FakeEmbedder, FakeOcr, FakeRasterizer};
    use tempfile::TempDir;

    pub(crate) fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.structure.use_llm_refinement = false;
        config
    }

    pub(crate) async fn open_test_library(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Library {
        let extractor = PdfExtractor::new(
            config.extract.clone(),
            Arc::new(FakeRasterizer::default()),
            Arc::new(FakeOcr),
        );
        Library::with_services(config, embedder, generator, extractor)
            .await
            .unwrap()
    }

    fn chunk(idx: i64) -> Chunk {
        Chunk {
            embedding_index: idx,
            chunk_id: chunk_id(idx as usize),
            book_id: "book".to_string(),
            chapter_id: None,
            lesson_id: None,
            page: 1,
            grade_ref: "g".to_string(),
            book_name: "Book".to_string(),
            text: format!("chunk {}", idx),
            created_at: "now".to_string(),
        }
    }

    async fn insert_chunks(library: &Library, indices: &[i64]) {
        let mut tx = library.db().begin().await.unwrap();
        let book = Book::new("book".to_string(), "Book".to_string(), "g".to_string(), None);
        MetaDb::upsert_book_in(&mut tx, &book).await.unwrap();
        for &idx in indices {
            let vector = vec![idx as f32, 0.0];
            MetaDb::insert_chunk_in(&mut tx, &chunk(idx), &vector)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_empty_is_consistent() {
        let tmp = TempDir::new().unwrap();
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(2)), None).await;

        assert_eq!(library.index_extent().await.unwrap(), (0, 0));
        let guard = library.lock_writes().await;
        assert_eq!(
            library.reconcile(&guard).await.unwrap(),
            Reconciliation::Consistent
        );
    }

    #[tokio::test]
    async fn test_reconcile_truncates_uncommitted_vectors() {
        let tmp = TempDir::new().unwrap();
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(2)), None).await;

        insert_chunks(&library, &[0, 1]).await;
        library.index().ensure(2).unwrap();
        library
            .index()
            .append(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![9.0, 9.0]])
            .unwrap();

        let guard = library.lock_writes().await;
        assert_eq!(
            library.reconcile(&guard).await.unwrap(),
            Reconciliation::Truncated { from: 3, to: 2 }
        );
        assert_eq!(library.index().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_rebuilds_missing_vectors_on_open() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        {
            let library =
                open_test_library(config.clone(), Arc::new(FakeEmbedder::new(2)), None).await;
            insert_chunks(&library, &[0, 1, 2]).await;
        }

        // Reopening finds 3 referenced positions and no index
        let library = open_test_library(config, Arc::new(FakeEmbedder::new(2)), None).await;
        assert_eq!(library.index_extent().await.unwrap(), (3, 3));
        let snapshot = library.index().snapshot().unwrap().unwrap();
        assert_eq!(snapshot.vector(2).unwrap(), &[2.0, 0.0]);
    }

    #[tokio::test]
    async fn test_rebuild_renumbers_densely() {
        let tmp = TempDir::new().unwrap();
        let library = open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(2)), None).await;
        insert_chunks(&library, &[0, 3, 7]).await;

        let guard = library.lock_writes().await;
        let stats = library.rebuild(&guard).await.unwrap();
        assert_eq!(stats.vectors_after, 3);

        let chunks = library.db().list_book_chunks("book").await.unwrap();
        let indices: Vec<i64> = chunks.iter().map(|c| c.embedding_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // Order survives: the chunk formerly at 7 is now last
        assert_eq!(chunks[2].text, "chunk 7");
        let snapshot = library.index().snapshot().unwrap().unwrap();
        assert_eq!(snapshot.vector(2).unwrap(), &[7.0, 0.0]);

        let runs = library.db().recent_runs(5).await.unwrap();
        assert!(runs.iter().any(|r| r.operation == "rebuild" && r.status == "completed"));
    }
}
