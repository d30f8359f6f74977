//! Vision and language model services
//!
//! The pipeline treats the models as opaque request/response services. Each
//! worker makes exactly one call per job through the [`SlideModel`] trait.

mod http_backend;
mod rate_limit;

pub use http_backend::*;
pub use rate_limit::*;

use crate::error::Result;
use crate::meta::ImageType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Result of analyzing one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAnalysis {
    pub image_type: ImageType,
    pub ocr_text: String,
    pub alt_text: String,
}

/// What a slide is for within the deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlidePurpose {
    Cover,
    Header,
    Content,
    Error,
}

impl std::fmt::Display for SlidePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlidePurpose::Cover => write!(f, "cover"),
            SlidePurpose::Header => write!(f, "header"),
            SlidePurpose::Content => write!(f, "content"),
            SlidePurpose::Error => write!(f, "error"),
        }
    }
}

impl FromStr for SlidePurpose {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cover" => Ok(SlidePurpose::Cover),
            "header" => Ok(SlidePurpose::Header),
            "content" => Ok(SlidePurpose::Content),
            "error" => Ok(SlidePurpose::Error),
            _ => Err(crate::error::Error::Config(format!("Unknown slide purpose: {}", s))),
        }
    }
}

/// Inputs for explaining one slide
#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub image: Vec<u8>,
    pub image_mime: String,
    pub slide_number: u32,
    pub total_slides: u32,
    pub previous_text: Option<String>,
    pub next_text: Option<String>,
}

/// Result of explaining one slide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideExplanation {
    pub explanation: String,
    pub one_liner: String,
    pub slide_purpose: SlidePurpose,
}

/// One slide's explanation as input to the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideNote {
    pub slide_number: i64,
    pub one_liner: String,
    pub explanation: String,
}

/// The external model service
#[async_trait]
pub trait SlideModel: Send + Sync {
    /// Classify an image and transcribe any text in it
    async fn analyze_image(&self, image: &[u8], mime: &str) -> Result<ImageAnalysis>;

    /// Explain a slide given its render and neighbouring text
    async fn explain_slide(&self, request: &ExplainRequest) -> Result<SlideExplanation>;

    /// Synthesize one document from every slide explanation
    async fn summarize(&self, notes: &[SlideNote]) -> Result<String>;
}

/// Parse an image type reported by a model, treating unknown labels as content
pub fn parse_image_type(value: &str) -> ImageType {
    value.parse().unwrap_or(ImageType::Content)
}

/// Parse a slide purpose reported by a model, treating unknown labels as content
pub fn parse_slide_purpose(value: &str) -> SlidePurpose {
    value.parse().unwrap_or(SlidePurpose::Content)
}
