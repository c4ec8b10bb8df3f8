//! Configuration management for syllabus
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Text-embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Text-generation service configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// PDF extraction configuration
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Structure recovery configuration
    #[serde(default)]
    pub structure: StructureConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend: "http" (OpenAI-compatible service) or "fastembed" (local, feature `local-embed`)
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Base URL of the OpenAI-compatible embedding service
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Expected embedding dimension (checked against service output when set)
    #[serde(default)]
    pub dimension: Option<usize>,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Environment variable name holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Retries per batch before the run is aborted
    #[serde(default = "default_service_retries")]
    pub retries: usize,
}

/// Generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of the OpenAI-compatible chat service
    #[serde(default = "default_generation_url")]
    pub url: String,

    /// Chat model name
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Environment variable name holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Retries per call
    #[serde(default = "default_service_retries")]
    pub retries: usize,
}

/// PDF extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// OCR language (Tesseract code, e.g. "vie", "eng")
    #[serde(default = "default_extract_language")]
    pub language: String,

    /// Use the text layer when the first pages have one
    #[serde(default = "default_prefer_text")]
    pub prefer_text: bool,

    /// Always OCR, regardless of the text layer
    #[serde(default = "default_force_ocr")]
    pub force_ocr: bool,

    /// Rasterization resolution for OCR
    #[serde(default = "default_ocr_dpi")]
    pub ocr_dpi: u32,

    /// Leading pages probed for extractable text
    #[serde(default = "default_text_probe_pages")]
    pub text_probe_pages: usize,

    /// Rasterizer executable
    #[serde(default = "default_pdftoppm_bin")]
    pub pdftoppm_bin: String,

    /// OCR executable
    #[serde(default = "default_tesseract_bin")]
    pub tesseract_bin: String,
}

/// Structure recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureConfig {
    /// Leading pages scanned for a table-of-contents marker
    #[serde(default = "default_toc_scan_pages")]
    pub toc_scan_pages: usize,

    /// Maximum number of pages a table of contents may span
    #[serde(default = "default_toc_max_pages")]
    pub toc_max_pages: usize,

    /// Headings longer than this are shortened
    #[serde(default = "default_max_heading_chars")]
    pub max_heading_chars: usize,

    /// Offset added to printed TOC page numbers to get PDF page numbers
    #[serde(default)]
    pub toc_page_offset: i32,

    /// Refine noisy headings and TOCs with the generation service
    #[serde(default = "default_use_llm_refinement")]
    pub use_llm_refinement: bool,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Target chunk size in words
    #[serde(default = "default_chunk_size_words")]
    pub size_words: usize,

    /// Overlap between neighboring chunks in words
    #[serde(default = "default_chunk_overlap_words")]
    pub overlap_words: usize,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Timeout for fetching the source PDF
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Leading pages inspected when validating a cached parse
    #[serde(default = "default_cache_check_pages")]
    pub cache_check_pages: usize,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results
    #[serde(default = "default_query_k")]
    pub default_k: usize,

    /// Multiplier applied to k before scope filtering
    #[serde(default = "default_query_oversample")]
    pub oversample: usize,

    /// Best-distance threshold above which a query is ungrounded
    #[serde(default = "default_query_max_distance")]
    pub max_distance: f32,

    /// Passages placed in the grounding prompt
    #[serde(default = "default_query_context_passages")]
    pub context_passages: usize,

    /// Sources cited in the response
    #[serde(default = "default_query_max_sources")]
    pub max_sources: usize,

    /// Ranking bonus for each structure tag a passage carries
    #[serde(default = "default_query_tag_bonus")]
    pub tag_bonus: f32,

    /// Passage excerpt length in the prompt
    #[serde(default = "default_query_passage_chars")]
    pub passage_chars: usize,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for syllabus data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite document store
    pub db_file: PathBuf,

    /// Path to the persisted vector index
    pub index_file: PathBuf,

    /// Directory for cached parses
    pub cache_dir: PathBuf,
}

impl PathsConfig {
    fn under(base: PathBuf, config_file: PathBuf) -> Self {
        Self {
            config_file,
            db_file: base.join("metadata.db"),
            index_file: base.join("index.flat"),
            cache_dir: base.join("cache"),
            base_dir: base,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: None,
            batch_size: default_embedding_batch_size(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_embedding_timeout(),
            retries: default_service_retries(),
        }
    }
}

impl EmbeddingConfig {
    /// Get the embedding API key from environment
    pub fn api_key(&self) -> Option<String> {
        read_key(&self.api_key_env)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_generation_url(),
            model: default_generation_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generation_timeout(),
            retries: default_service_retries(),
        }
    }
}

impl GenerationConfig {
    /// Get the generation API key from environment
    pub fn api_key(&self) -> Option<String> {
        read_key(&self.api_key_env)
    }
}

fn read_key(env: &str) -> Option<String> {
    if env.is_empty() {
        return None;
    }
    std::env::var(env).ok().filter(|k| !k.trim().is_empty())
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            language: default_extract_language(),
            prefer_text: default_prefer_text(),
            force_ocr: default_force_ocr(),
            ocr_dpi: default_ocr_dpi(),
            text_probe_pages: default_text_probe_pages(),
            pdftoppm_bin: default_pdftoppm_bin(),
            tesseract_bin: default_tesseract_bin(),
        }
    }
}

impl ExtractConfig {
    /// Whether OCR is forced, by config or by `SYLLABUS_FORCE_OCR`
    pub fn ocr_forced(&self) -> bool {
        self.force_ocr
            || std::env::var("SYLLABUS_FORCE_OCR")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
    }
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            toc_scan_pages: default_toc_scan_pages(),
            toc_max_pages: default_toc_max_pages(),
            max_heading_chars: default_max_heading_chars(),
            toc_page_offset: 0,
            use_llm_refinement: default_use_llm_refinement(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size_words: default_chunk_size_words(),
            overlap_words: default_chunk_overlap_words(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            cache_check_pages: default_cache_check_pages(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_query_k(),
            oversample: default_query_oversample(),
            max_distance: default_query_max_distance(),
            context_passages: default_query_context_passages(),
            max_sources: default_query_max_sources(),
            tag_bonus: default_query_tag_bonus(),
            passage_chars: default_query_passage_chars(),
        }
    }
}

impl Config {
    /// Get the default base directory for syllabus (~/.syllabus)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".syllabus")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig::under(base.clone(), base.join("config.toml"));
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(base, config_path.to_path_buf());

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if syllabus is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk.size_words == 0 {
            return Err(Error::Config("chunk.size_words must be positive".to_string()));
        }

        if self.chunk.overlap_words >= self.chunk.size_words {
            return Err(Error::Config(
                "chunk.overlap_words must be < chunk.size_words".to_string(),
            ));
        }

        if !matches!(self.embedding.backend.as_str(), "http" | "fastembed") {
            return Err(Error::Config(format!(
                "Unknown embedding backend '{}'; expected 'http' or 'fastembed'",
                self.embedding.backend
            )));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        if self.embedding.dimension == Some(0) {
            return Err(Error::Config(
                "embedding.dimension must be positive when set".to_string(),
            ));
        }

        if self.extract.text_probe_pages == 0 {
            return Err(Error::Config(
                "extract.text_probe_pages must be positive".to_string(),
            ));
        }

        if self.structure.max_heading_chars < 8 {
            return Err(Error::Config(
                "structure.max_heading_chars must be at least 8".to_string(),
            ));
        }

        if self.query.oversample == 0 {
            return Err(Error::Config("query.oversample must be >= 1".to_string()));
        }

        if self.query.default_k == 0 {
            return Err(Error::Config("query.default_k must be positive".to_string()));
        }

        if !self.query.max_distance.is_finite() || self.query.max_distance < 0.0 {
            return Err(Error::Config(
                "query.max_distance must be a non-negative number".to_string(),
            ));
        }

        if self.query.tag_bonus < 0.0 {
            return Err(Error::Config(
                "query.tag_bonus must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

/// Get the database URL for sqlx
pub fn database_url(config: &Config) -> String {
    format!("sqlite://{}?mode=rwc", config.paths.db_file.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunk.size_words, 800);
        assert_eq!(config.chunk.overlap_words, 100);
        assert_eq!(config.query.oversample, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.generation.model = "test-model".to_string();
        config.query.max_distance = 0.75;

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.generation.model, "test-model");
        assert_eq!(loaded.query.max_distance, 0.75);
        assert_eq!(loaded.paths.index_file, tmp.path().join("index.flat"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[chunk]\nsize_words = 200\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.chunk.size_words, 200);
        assert_eq!(config.chunk.overlap_words, 100);
        assert_eq!(config.paths.cache_dir, tmp.path().join("cache"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.chunk.overlap_words = config.chunk.size_words;
        assert!(config.validate().is_err());

        config.chunk.overlap_words = 10;
        assert!(config.validate().is_ok());

        config.query.oversample = 0;
        assert!(config.validate().is_err());
        config.query.oversample = 3;

        config.query.max_distance = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
