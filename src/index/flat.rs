//! Exact (flat) L2 vector index and its on-disk blob format
//!
//! Layout: 8-byte magic, `u32` dimension, `u64` vector count, then
//! `count * dim` little-endian `f32` values. Positions are dense and never
//! reordered.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 8] = b"SYLFLAT1";
const HEADER_LEN: usize = 8 + 4 + 8;

/// Raw search output: parallel distance/index lists, padded with `-1`
/// indices when fewer than `k` vectors exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub distances: Vec<f32>,
    pub indices: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors at the end, in order
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: bad.len(),
            });
        }
        self.data.reserve(vectors.len() * self.dim);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    /// Drop every vector at position `len` and beyond
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dim);
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    /// Top-k nearest neighbors by squared Euclidean distance
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchHits> {
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dim.max(1))
            .enumerate()
            .map(|(i, v)| (squared_l2(query, v), i))
            .collect();

        let take = k.min(scored.len());
        if take < scored.len() && take > 0 {
            scored.select_nth_unstable_by(take - 1, compare_hits);
        }
        scored.truncate(take);
        scored.sort_by(compare_hits);

        let mut hits = SearchHits {
            distances: scored.iter().map(|(d, _)| *d).collect(),
            indices: scored.iter().map(|(_, i)| *i as i64).collect(),
        };
        while hits.indices.len() < k {
            hits.distances.push(f32::MAX);
            hits.indices.push(-1);
        }
        Ok(hits)
    }

    /// Write the blob through a temp file in the same directory, then rename
    /// it over `path` so readers never see a partial file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(self.dim as u32).to_le_bytes());
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(Error::IndexCorrupt("missing or invalid header".to_string()));
        }

        let dim = read_u32(&bytes[8..12]) as usize;
        let count = read_u64(&bytes[12..20]) as usize;
        let body = &bytes[HEADER_LEN..];

        let expected = count
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| Error::IndexCorrupt("vector count overflows".to_string()))?;
        if dim == 0 || body.len() != expected {
            return Err(Error::IndexCorrupt(format!(
                "expected {} vectors of dimension {} ({} bytes), found {} bytes",
                count,
                dim,
                expected,
                body.len()
            )));
        }

        let data = body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { dim, data })
    }
}

fn compare_hits(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_le_bytes(arr)
}
