//! SQLite schema definition

/// SQL schema for the pipeline database
pub const SCHEMA_SQL: &str = r#"
-- Lectures: one uploaded document and its processing state
CREATE TABLE IF NOT EXISTS lectures (
    id TEXT PRIMARY KEY,
    title TEXT,
    document_location TEXT,
    status TEXT NOT NULL,
    total_slides INTEGER NOT NULL DEFAULT 0,
    processed_slides INTEGER NOT NULL DEFAULT 0,
    total_sub_images INTEGER NOT NULL DEFAULT 0,
    processed_sub_images INTEGER NOT NULL DEFAULT 0,
    embeddings_complete INTEGER NOT NULL DEFAULT 0,
    error_details TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    CHECK (processed_slides <= total_slides),
    CHECK (processed_sub_images <= total_sub_images)
);

-- Slides: one row per page
CREATE TABLE IF NOT EXISTS slides (
    id TEXT PRIMARY KEY,
    lecture_id TEXT NOT NULL REFERENCES lectures(id) ON DELETE CASCADE,
    slide_number INTEGER NOT NULL,
    raw_text TEXT NOT NULL DEFAULT '',
    image_location TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(lecture_id, slide_number)
);

-- Chunks: token-bounded text windows of a slide
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    lecture_id TEXT NOT NULL REFERENCES lectures(id) ON DELETE CASCADE,
    slide_id TEXT NOT NULL REFERENCES slides(id) ON DELETE CASCADE,
    slide_number INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL,
    chunk_text TEXT NOT NULL,
    chunk_hash TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(slide_id, chunk_index)
);

-- Slide images: full-page renders and embedded sub-images
CREATE TABLE IF NOT EXISTS slide_images (
    id TEXT PRIMARY KEY,
    lecture_id TEXT NOT NULL REFERENCES lectures(id) ON DELETE CASCADE,
    slide_id TEXT NOT NULL REFERENCES slides(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    image_hash TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    image_type TEXT,
    ocr_text TEXT,
    alt_text TEXT,
    analyzed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(slide_id, storage_path)
);

-- Explanations: at most one per slide
CREATE TABLE IF NOT EXISTS explanations (
    id TEXT PRIMARY KEY,
    lecture_id TEXT NOT NULL REFERENCES lectures(id) ON DELETE CASCADE,
    slide_id TEXT NOT NULL UNIQUE REFERENCES slides(id) ON DELETE CASCADE,
    slide_number INTEGER NOT NULL,
    content TEXT NOT NULL,
    one_liner TEXT NOT NULL,
    slide_purpose TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Summaries: at most one per lecture
CREATE TABLE IF NOT EXISTS summaries (
    lecture_id TEXT PRIMARY KEY REFERENCES lectures(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Embeddings: one vector per chunk (little-endian f32)
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    lecture_id TEXT NOT NULL REFERENCES lectures(id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL
);

-- Dead-letter records: append-only, for manual inspection
CREATE TABLE IF NOT EXISTS dead_letter_messages (
    id TEXT PRIMARY KEY,
    subscription_name TEXT NOT NULL,
    message_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    attributes TEXT,
    status TEXT NOT NULL DEFAULT 'unprocessed',
    received_at TEXT NOT NULL
);

-- Queue messages: one table for every topic
CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    attributes TEXT,
    enqueued_at TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_slides_lecture ON slides(lecture_id);
CREATE INDEX IF NOT EXISTS idx_chunks_lecture ON chunks(lecture_id);
CREATE INDEX IF NOT EXISTS idx_slide_images_hash ON slide_images(lecture_id, image_hash);
CREATE INDEX IF NOT EXISTS idx_slide_images_slide ON slide_images(slide_id);
CREATE INDEX IF NOT EXISTS idx_explanations_lecture ON explanations(lecture_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_lecture ON embeddings(lecture_id);
CREATE INDEX IF NOT EXISTS idx_queue_topic_visible ON queue_messages(topic, visible_at);
"#;
