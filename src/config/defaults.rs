//! Default values for configuration

/// Default embedding backend
pub fn default_embedding_backend() -> String {
    "http".to_string()
}

/// Default embedding service base URL (OpenAI-compatible)
pub fn default_embedding_url() -> String {
    std::env::var("SYLLABUS_EMBEDDING_URL").unwrap_or_else(|_| "https://api.openai.com".to_string())
}

/// Default embedding model
pub fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    100
}

/// Default environment variable holding the service API key
pub fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Default timeout for a single embedding request
pub fn default_embedding_timeout() -> u64 {
    60
}

/// Default generation service base URL (OpenAI-compatible)
pub fn default_generation_url() -> String {
    std::env::var("SYLLABUS_GENERATION_URL")
        .unwrap_or_else(|_| "https://api.openai.com".to_string())
}

/// Default chat model
pub fn default_generation_model() -> String {
    "gpt-4-turbo".to_string()
}

/// Default timeout for a single generation request
pub fn default_generation_timeout() -> u64 {
    120
}

/// Default retry count for service calls
pub fn default_service_retries() -> usize {
    2
}

/// Default OCR language (Tesseract code)
pub fn default_extract_language() -> String {
    "vie".to_string()
}

/// Default: prefer the text layer when present
pub fn default_prefer_text() -> bool {
    true
}

/// Default: OCR only when the text layer is missing
pub fn default_force_ocr() -> bool {
    false
}

/// Default rasterization DPI for OCR
pub fn default_ocr_dpi() -> u32 {
    300
}

/// Default number of leading pages probed for a text layer
pub fn default_text_probe_pages() -> usize {
    3
}

/// Default rasterizer binary
pub fn default_pdftoppm_bin() -> String {
    "pdftoppm".to_string()
}

/// Default OCR binary
pub fn default_tesseract_bin() -> String {
    "tesseract".to_string()
}

/// Default number of leading pages scanned for a table of contents
pub fn default_toc_scan_pages() -> usize {
    15
}

/// Default number of pages a table of contents may span
pub fn default_toc_max_pages() -> usize {
    4
}

/// Default heading length cap (characters)
pub fn default_max_heading_chars() -> usize {
    80
}

/// Default: ask the generation service to clean headings and TOCs
pub fn default_use_llm_refinement() -> bool {
    true
}

/// Default chunk size in words
pub fn default_chunk_size_words() -> usize {
    800
}

/// Default chunk overlap in words
pub fn default_chunk_overlap_words() -> usize {
    100
}

/// Default PDF fetch timeout in seconds
pub fn default_fetch_timeout() -> u64 {
    120
}

/// Default number of leading pages inspected by the cache sanity check
pub fn default_cache_check_pages() -> usize {
    30
}

/// Default number of query results
pub fn default_query_k() -> usize {
    8
}

/// Default oversampling factor for scope post-filtering
pub fn default_query_oversample() -> usize {
    5
}

/// Default relevance gate (squared L2 distance)
pub fn default_query_max_distance() -> f32 {
    1.0
}

/// Default number of passages placed in the grounding prompt
pub fn default_query_context_passages() -> usize {
    5
}

/// Default number of cited sources
pub fn default_query_max_sources() -> usize {
    3
}

/// Default ranking bonus per structure tag (chapter, lesson)
pub fn default_query_tag_bonus() -> f32 {
    0.05
}

/// Default passage excerpt length in the prompt (characters)
pub fn default_query_passage_chars() -> usize {
    1200
}
