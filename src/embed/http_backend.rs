use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::embedding_backend::EmbeddingBackendClient;
use crate::error::{Error, Result};
use async_trait::async_trait;

pub struct HttpEmbedder {
    client: EmbeddingBackendClient,
    model_id: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = EmbeddingBackendClient::new(&config.url)?;
        Ok(Self {
            client,
            model_id: config.model.clone(),
            dimension: config.dimension,
        })
    }

    fn validate_dimensions(&self, embeddings: &[Vec<f32>]) -> Result<()> {
        if let Some(mismatch) = embeddings.iter().find(|vec| vec.len() != self.dimension) {
            return Err(Error::Other(format!(
                "Embedding dimension mismatch for model '{}': expected {}, got {}",
                self.model_id,
                self.dimension,
                mismatch.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self.client.embed_text(&self.model_id, texts).await?;
        self.validate_dimensions(&embeddings)?;
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String, dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            url,
            model: "test-model".to_string(),
            dimension,
            batch_size: 2,
        }
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": [[1.0, 2.0, 3.0]]})),
            )
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&config(server.uri(), 4)).unwrap();
        let err = embedder.embed(vec!["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("expected 4, got 3"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_input_skips_request() {
        // No mock mounted: any request would fail
        let server = MockServer::start().await;
        let embedder = HttpEmbedder::new(&config(server.uri(), 3)).unwrap();
        assert!(embedder.embed(Vec::new()).await.unwrap().is_empty());
        assert_eq!(embedder.model_name(), "test-model");
    }
}
