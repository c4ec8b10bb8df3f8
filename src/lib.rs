//! syllabus - textbook PDF ingestion and scoped retrieval
//!
//! This crate provides:
//! - PDF text extraction with an OCR fallback, and chapter/lesson recovery
//!   from headings or the table of contents
//! - Chunking, embedding and a persisted flat L2 vector index kept in
//!   lockstep with a SQLite passage store
//! - Scope-filtered, relevance-gated retrieval feeding a text-generation
//!   service

pub mod cache;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod embed;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod generate;
pub mod ids;
pub mod index;
pub mod library;
pub mod meta;
pub mod progress;
pub mod service;
pub mod structure;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use library::Library;
