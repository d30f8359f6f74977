//! Default values for configuration

/// Default poll interval when a topic is empty (milliseconds)
pub fn default_queue_poll_interval_ms() -> u64 {
    500
}

/// Default visibility lease for a received message (seconds)
pub fn default_queue_lease_secs() -> u64 {
    60
}

/// Default number of deliveries before a message is treated as poison
pub fn default_queue_max_deliveries() -> u32 {
    5
}

/// Default number of messages pulled per receive call
pub fn default_queue_batch_size() -> usize {
    1
}

/// Default initial retry delay (milliseconds)
pub fn default_retry_initial_delay_ms() -> u64 {
    1000
}

/// Default maximum retry delay (milliseconds)
pub fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// Default attempt ceiling for one external call
pub fn default_retry_max_attempts() -> u32 {
    5
}

/// Default maximum tokens per chunk
pub fn default_chunk_max_tokens() -> usize {
    1000
}

/// Default overlap tokens between chunks
pub fn default_chunk_overlap_tokens() -> usize {
    200
}

/// Default perceptual hash edge length (hash has size*size bits)
pub fn default_dedupe_hash_size() -> u32 {
    8
}

/// Default near-duplicate tolerance (0 means identical hashes only)
pub fn default_dedupe_max_distance() -> u32 {
    0
}

/// Default width of the rendered full-page raster (pixels)
pub fn default_render_width() -> u32 {
    1600
}

/// Default model service URL
pub fn default_llm_url() -> String {
    std::env::var("DECKFLOW_LLM_URL").unwrap_or_else(|_| "http://127.0.0.1:7998".to_string())
}

/// Default image analysis model
pub fn default_image_analysis_model() -> String {
    "gpt-4.1-mini".to_string()
}

/// Default explanation model
pub fn default_explanation_model() -> String {
    "gpt-4.1".to_string()
}

/// Default summary model
pub fn default_summary_model() -> String {
    "gpt-4.1".to_string()
}

/// Default request timeout for model calls (seconds)
pub fn default_llm_timeout() -> u64 {
    120
}

/// Default rate limit for model calls (requests per second)
pub fn default_llm_requests_per_second() -> u32 {
    5
}

/// Default embedding backend URL
pub fn default_embedding_url() -> String {
    std::env::var("DECKFLOW_EMBEDDING_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default embedding model
pub fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// Default embedding dimension
pub fn default_embedding_dimension() -> usize {
    1536
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    64
}

/// Default blob store directory name (relative to the base dir)
pub fn default_storage_dir() -> String {
    "blobs".to_string()
}
