//! Reading uploaded slide decks page by page

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::PdfiumDeckReader;

use crate::error::{Error, Result};
use std::sync::Arc;

/// A raster image embedded in a page
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub bytes: Vec<u8>,
    /// File extension matching the encoding of `bytes`
    pub extension: String,
}

/// One page of a deck
#[derive(Debug, Clone)]
pub struct DeckPage {
    /// Extracted text, already sanitized
    pub text: String,
    /// Full-page raster as PNG
    pub render: Vec<u8>,
    pub images: Vec<EmbeddedImage>,
}

/// Walks a document and yields its pages.
///
/// Implementations are blocking; callers run them on the blocking pool.
pub trait DeckReader: Send + Sync {
    fn read(&self, bytes: &[u8], render_width: u32) -> Result<Vec<DeckPage>>;
}

/// Reader used when the crate is built without a document backend
#[derive(Debug, Default)]
pub struct UnsupportedDeckReader;

impl DeckReader for UnsupportedDeckReader {
    fn read(&self, _bytes: &[u8], _render_width: u32) -> Result<Vec<DeckPage>> {
        Err(Error::Deck(
            "deckflow was built without document support; rebuild with --features pdf".to_string(),
        ))
    }
}

/// The reader compiled into this build
pub fn default_reader() -> Arc<dyn DeckReader> {
    #[cfg(feature = "pdf")]
    {
        Arc::new(PdfiumDeckReader::new())
    }
    #[cfg(not(feature = "pdf"))]
    {
        Arc::new(UnsupportedDeckReader)
    }
}

/// Strip NUL and other control characters that the database or the model
/// services reject; newlines and tabs are kept.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}
