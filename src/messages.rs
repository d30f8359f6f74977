//! Message payloads exchanged between pipeline stages
//!
//! Every job is a small JSON document published to a named topic. The shapes
//! here are the stable contract between the ingestion dispatcher and the
//! workers it fans out to.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Topic names
pub mod topics {
    pub const INGESTION: &str = "ingestion";
    pub const IMAGE_ANALYSIS: &str = "image-analysis";
    pub const EXPLANATION: &str = "explanation";
    pub const EMBEDDING: &str = "embedding";
    pub const SUMMARY: &str = "summary";

    /// All job topics, in pipeline order
    pub const ALL: [&str; 5] = [INGESTION, IMAGE_ANALYSIS, EXPLANATION, EMBEDDING, SUMMARY];

    /// Dead-letter topic for a job topic
    pub fn dead_letter(topic: &str) -> String {
        format!("{}-dead-letter", topic)
    }
}

/// Stage names written into `error_details.stage`
pub mod stages {
    pub const INGESTION: &str = "ingestion";
    pub const IMAGE_ANALYSIS: &str = "image_analysis";
    pub const EXPLANATION: &str = "explanation";
    pub const EMBEDDING: &str = "embedding";
    pub const SUMMARY: &str = "summary";
}

/// A job payload bound to one topic
pub trait JobMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;

    /// The lecture this job belongs to
    fn lecture_id(&self) -> Uuid;

    fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::MalformedMessage {
            topic: Self::TOPIC.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A document has been uploaded and awaits parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub lecture_id: Uuid,
    pub document_location: String,
}

/// Analyze one unique image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAnalysisJob {
    pub image_id: Uuid,
    pub lecture_id: Uuid,
    pub image_hash: String,
}

/// Embed every chunk of a lecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub lecture_id: Uuid,
}

/// Explain one slide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationJob {
    pub lecture_id: Uuid,
    pub slide_id: Uuid,
    pub slide_number: u32,
    pub total_slides: u32,
    pub slide_image_location: String,
}

/// Summarize a fully explained lecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryJob {
    pub lecture_id: Uuid,
}

impl JobMessage for IngestionJob {
    const TOPIC: &'static str = topics::INGESTION;
    fn lecture_id(&self) -> Uuid {
        self.lecture_id
    }
}

impl JobMessage for ImageAnalysisJob {
    const TOPIC: &'static str = topics::IMAGE_ANALYSIS;
    fn lecture_id(&self) -> Uuid {
        self.lecture_id
    }
}

impl JobMessage for EmbeddingJob {
    const TOPIC: &'static str = topics::EMBEDDING;
    fn lecture_id(&self) -> Uuid {
        self.lecture_id
    }
}

impl JobMessage for ExplanationJob {
    const TOPIC: &'static str = topics::EXPLANATION;
    fn lecture_id(&self) -> Uuid {
        self.lecture_id
    }
}

impl JobMessage for SummaryJob {
    const TOPIC: &'static str = topics::SUMMARY;
    fn lecture_id(&self) -> Uuid {
        self.lecture_id
    }
}

/// Push envelope delivered to the dead-letter sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    pub subscription: String,
}

/// Inner message of a push envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded payload
    #[serde(default)]
    pub data: String,
    #[serde(default, alias = "messageId")]
    pub message_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}
