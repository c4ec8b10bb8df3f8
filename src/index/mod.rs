//! Persisted, append-only vector index
//!
//! [`VectorIndex`] owns the on-disk blob and an in-memory snapshot. Writers
//! build a new [`FlatIndex`], persist it, then swap the snapshot, so a reader
//! holding an `Arc` never observes a partially written index. Callers must
//! serialize writers (see `Library`).

mod flat;

pub use flat::*;

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// A neighbor that survived sentinel and bounds filtering
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

pub struct VectorIndex {
    path: PathBuf,
    current: RwLock<Option<Arc<FlatIndex>>>,
}

impl VectorIndex {
    /// Load the persisted index if present
    pub fn open(path: &Path) -> Result<Self> {
        let current = if path.exists() {
            let index = FlatIndex::read_from(path)?;
            info!(
                "Loaded vector index: {} vectors, dimension {}",
                index.len(),
                index.dim()
            );
            Some(Arc::new(index))
        } else {
            debug!("No vector index at {:?}", path);
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, if an index exists
    pub fn snapshot(&self) -> Result<Option<Arc<FlatIndex>>> {
        let guard = self
            .current
            .read()
            .map_err(|_| Error::Other("vector index lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.map(|i| i.len()).unwrap_or(0))
    }

    pub fn dim(&self) -> Result<Option<usize>> {
        Ok(self.snapshot()?.map(|i| i.dim()))
    }

    fn install(&self, index: Option<FlatIndex>) -> Result<()> {
        self.restore(index.map(Arc::new))
    }

    /// Make sure an index of dimension `dim` exists, creating and persisting
    /// an empty one if needed. The dimension is fixed at first creation.
    pub fn ensure(&self, dim: usize) -> Result<()> {
        match self.snapshot()? {
            Some(index) if index.dim() != dim => Err(Error::DimensionMismatch {
                expected: index.dim(),
                actual: dim,
            }),
            Some(_) => Ok(()),
            None => {
                info!("Creating vector index with dimension {}", dim);
                self.install(Some(FlatIndex::new(dim)))
            }
        }
    }

    /// Append vectors in order and persist. Returns the position of the first
    /// appended vector.
    pub fn append(&self, vectors: &[Vec<f32>]) -> Result<usize> {
        let current = self.snapshot()?.ok_or_else(|| {
            Error::IndexCorrupt("append before the index was created".to_string())
        })?;

        let start = current.len();
        if vectors.is_empty() {
            return Ok(start);
        }

        let mut next = (*current).clone();
        next.add(vectors)?;
        self.install(Some(next))?;

        debug!("Appended {} vectors at position {}", vectors.len(), start);
        Ok(start)
    }

    /// Drop uncommitted trailing vectors
    pub fn truncate(&self, len: usize) -> Result<()> {
        if let Some(current) = self.snapshot()? {
            if current.len() > len {
                let mut next = (*current).clone();
                next.truncate(len);
                self.install(Some(next))?;
            }
        }
        Ok(())
    }

    /// Replace the whole index with `vectors`, in order.
    ///
    /// With no vectors and no known dimension the blob is removed.
    pub fn replace(&self, dim: Option<usize>, vectors: &[Vec<f32>]) -> Result<()> {
        let dim = dim
            .or_else(|| vectors.first().map(|v| v.len()))
            .or(self.dim()?);

        let Some(dim) = dim else {
            return self.install(None);
        };

        let mut next = FlatIndex::new(dim);
        next.add(vectors)?;
        self.install(Some(next))
    }

    /// Put back a snapshot taken earlier, on disk and in memory
    pub fn restore(&self, snapshot: Option<Arc<FlatIndex>>) -> Result<()> {
        match &snapshot {
            Some(index) => index.write_to(&self.path)?,
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
            }
        }

        let mut guard = self
            .current
            .write()
            .map_err(|_| Error::Other("vector index lock poisoned".to_string()))?;
        *guard = snapshot;
        Ok(())
    }

    /// Top-k neighbors with sentinel and out-of-range positions removed
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let Some(index) = self.snapshot()? else {
            return Ok(Vec::new());
        };
        if k == 0 || index.is_empty() {
            return Ok(Vec::new());
        }

        let hits = index.search(query, k)?;
        let len = index.len() as i64;
        Ok(hits
            .indices
            .iter()
            .zip(hits.distances.iter())
            .filter(|(i, _)| **i >= 0 && **i < len)
            .map(|(i, d)| Neighbor {
                position: *i as usize,
                distance: *d,
            })
            .collect())
    }
}
