use super::{
    parse_image_type, parse_slide_purpose, ExplainRequest, GlobalRateLimiter, ImageAnalysis,
    SlideExplanation, SlideModel, SlideNote,
};
use crate::config::LlmConfig;
use crate::embedding_backend::status_error;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize)]
struct AnalyzeImageRequest<'a> {
    model: &'a str,
    image_base64: String,
    image_mime: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeImageResponse {
    #[serde(rename = "type", alias = "image_type")]
    image_type: String,
    #[serde(default)]
    ocr_text: String,
    #[serde(default)]
    alt_text: String,
}

#[derive(Debug, Serialize)]
struct ExplainSlideRequest<'a> {
    model: &'a str,
    image_base64: String,
    image_mime: &'a str,
    slide_number: u32,
    total_slides: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_slide_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_slide_text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ExplainSlideResponse {
    explanation: String,
    #[serde(default)]
    one_liner: String,
    #[serde(default)]
    slide_purpose: String,
}

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    model: &'a str,
    explanations: &'a [SlideNote],
}

#[derive(Debug, Deserialize)]
struct SummarizeResponse {
    #[serde(alias = "content")]
    summary: String,
}

/// Model service spoken to over JSON/HTTP
pub struct HttpSlideModel {
    client: Client,
    base_url: Url,
    limiter: GlobalRateLimiter,
    image_analysis_model: String,
    explanation_model: String,
    summary_model: String,
}

impl HttpSlideModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self {
            client,
            base_url,
            limiter: GlobalRateLimiter::new(config.requests_per_second),
            image_analysis_model: config.image_analysis_model.clone(),
            explanation_model: config.explanation_model.clone(),
            summary_model: config.summary_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid model service URL: {}", e)))
    }

    async fn post<Req: Serialize + ?Sized, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = self.endpoint(path)?;
        self.limiter.wait().await;
        debug!(%url, "Calling model service");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("model service", status, &body));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| Error::Llm(format!("Invalid model response: {}", e)))
    }
}

#[async_trait]
impl SlideModel for HttpSlideModel {
    async fn analyze_image(&self, image: &[u8], mime: &str) -> Result<ImageAnalysis> {
        let request = AnalyzeImageRequest {
            model: &self.image_analysis_model,
            image_base64: STANDARD.encode(image),
            image_mime: mime,
        };
        let response: AnalyzeImageResponse = self.post("/v1/images/analyze", &request).await?;
        Ok(ImageAnalysis {
            image_type: parse_image_type(&response.image_type),
            ocr_text: response.ocr_text,
            alt_text: response.alt_text,
        })
    }

    async fn explain_slide(&self, request: &ExplainRequest) -> Result<SlideExplanation> {
        let body = ExplainSlideRequest {
            model: &self.explanation_model,
            image_base64: STANDARD.encode(&request.image),
            image_mime: &request.image_mime,
            slide_number: request.slide_number,
            total_slides: request.total_slides,
            previous_slide_text: request.previous_text.as_deref(),
            next_slide_text: request.next_text.as_deref(),
        };
        let response: ExplainSlideResponse = self.post("/v1/slides/explain", &body).await?;
        Ok(SlideExplanation {
            explanation: response.explanation,
            one_liner: response.one_liner,
            slide_purpose: parse_slide_purpose(&response.slide_purpose),
        })
    }

    async fn summarize(&self, notes: &[SlideNote]) -> Result<String> {
        let body = SummarizeRequest {
            model: &self.summary_model,
            explanations: notes,
        };
        let response: SummarizeResponse = self.post("/v1/lectures/summarize", &body).await?;
        Ok(response.summary)
    }
}
