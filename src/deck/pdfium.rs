//! PDF decks through pdfium

use super::{sanitize_text, DeckPage, DeckReader, EmbeddedImage};
use crate::error::{Error, Result};
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium};
use std::io::Cursor;
use std::sync::OnceLock;
use tracing::{debug, error};

static PDFIUM: OnceLock<Option<Pdfium>> = OnceLock::new();

fn pdfium() -> Result<&'static Pdfium> {
    PDFIUM
        .get_or_init(|| {
            Pdfium::bind_to_system_library()
                .map(Pdfium::new)
                .map_err(|err| error!("Failed to bind pdfium: {:?}", err))
                .ok()
        })
        .as_ref()
        .ok_or_else(|| Error::Deck("pdfium library is not available".to_string()))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Reads PDF decks with the system pdfium library
#[derive(Debug, Default)]
pub struct PdfiumDeckReader;

impl PdfiumDeckReader {
    pub fn new() -> Self {
        Self
    }
}

impl DeckReader for PdfiumDeckReader {
    fn read(&self, bytes: &[u8], render_width: u32) -> Result<Vec<DeckPage>> {
        let pdfium = pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| Error::Deck(format!("Failed to open PDF: {:?}", e)))?;

        let render_config = PdfRenderConfig::new().set_target_width(render_width as i32);

        let mut pages = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let text = page.text().map(|t| t.all()).unwrap_or_default();

            let render = page
                .render_with_config(&render_config)
                .map_err(|e| Error::Deck(format!("Failed to render page {}: {:?}", index + 1, e)))?
                .as_image();

            let mut images = Vec::new();
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                match image_object.get_raw_image() {
                    Ok(raw) => images.push(EmbeddedImage {
                        bytes: encode_png(&raw)?,
                        extension: "png".to_string(),
                    }),
                    Err(e) => debug!(page = index + 1, "Skipping unreadable image: {:?}", e),
                }
            }

            pages.push(DeckPage {
                text: sanitize_text(&text),
                render: encode_png(&render)?,
                images,
            });
        }

        debug!(pages = pages.len(), "Read PDF deck");
        Ok(pages)
    }
}
