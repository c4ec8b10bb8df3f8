//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - An OpenAI-compatible HTTP backend (and FastEmbed behind `local-embed`)
//! - Order-preserving batch processing

mod http_backend;

#[cfg(feature = "local-embed")]
mod fastembed_impl;

pub use http_backend::*;

#[cfg(feature = "local-embed")]
pub use fastembed_impl::*;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::progress::{advance_progress, finish_progress, start_progress};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; output order matches input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimension, when known ahead of the first call
    fn dimension(&self) -> Option<usize>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend.as_str() {
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        #[cfg(feature = "local-embed")]
        "fastembed" => Ok(Arc::new(FastEmbedder::new(config)?)),
        other => Err(Error::Config(format!(
            "Embedding backend '{}' is not available in this build",
            other
        ))),
    }
}

/// Embed a single query string
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(vec![text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Embedding("No embedding returned".to_string()))
}

/// Helper to embed in batches with progress.
///
/// Vectors are concatenated in request order. Any failed batch, or a batch
/// that returns the wrong number of vectors, fails the whole call.
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut all_embeddings = Vec::with_capacity(texts.len());
    let batches = texts.len().div_ceil(batch_size);
    let progress = start_progress(batches, "Embedding batches");

    for (i, chunk) in texts.chunks(batch_size).enumerate() {
        let batch_texts: Vec<String> = chunk.to_vec();
        let embeddings = embedder.embed(batch_texts).await?;
        if embeddings.len() != chunk.len() {
            return Err(Error::Embedding(format!(
                "Batch {} returned {} vectors for {} texts",
                i,
                embeddings.len(),
                chunk.len()
            )));
        }
        debug!("Embedded batch {}/{}", i + 1, batches);
        all_embeddings.extend(embeddings);
        advance_progress(&progress);
    }

    finish_progress(progress, "Embedding complete");
    Ok(all_embeddings)
}
