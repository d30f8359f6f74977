//! Custom error types for deckflow

use thiserror::Error;

/// Main error type for deckflow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Document error: {0}")]
    Deck(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Model service error: {0}")]
    Llm(String),

    #[error("Malformed message on '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("Lecture not found: {0}")]
    LectureNotFound(String),

    #[error("Stage '{stage}' exhausted its retries: {message}")]
    RetriesExhausted { stage: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not initialized: run 'deckflow init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Parse and configuration failures are permanent; everything that talks
    /// to another process (model services, storage, the database) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
            ),
            Error::Queue(_)
            | Error::Blob(_)
            | Error::Embedding(_)
            | Error::Llm(_)
            | Error::Io(_)
            | Error::Http(_) => true,
            Error::Config(_)
            | Error::Deck(_)
            | Error::Image(_)
            | Error::MalformedMessage { .. }
            | Error::LectureNotFound(_)
            | Error::RetriesExhausted { .. }
            | Error::UrlParse(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::NotInitialized
            | Error::Other(_) => false,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for deckflow
pub type Result<T> = std::result::Result<T, Error>;
