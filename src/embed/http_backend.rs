use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::service::{ServiceClient, ServiceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
struct EmbedTextRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
            EmbeddingResponse::Data { mut data } => {
                // OpenAI tags each item with its input position
                data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
                data.into_iter().map(|d| d.embedding).collect()
            }
        }
    }
}

pub struct HttpEmbedder {
    client: ServiceClient,
    model_id: String,
    dimension: Option<usize>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = ServiceClient::new(
            ServiceKind::Embedding,
            &config.url,
            config.api_key(),
            Duration::from_secs(config.timeout_secs),
            config.retries,
        )?;
        Ok(Self {
            client,
            model_id: config.model.clone(),
            dimension: config.dimension,
        })
    }

    fn validate_dimensions(&self, embeddings: &[Vec<f32>]) -> Result<()> {
        let expected = match self.dimension {
            Some(d) => d,
            None => match embeddings.first() {
                Some(first) => first.len(),
                None => return Ok(()),
            },
        };
        if let Some(mismatch) = embeddings.iter().find(|vec| vec.len() != expected) {
            return Err(Error::Embedding(format!(
                "Embedding dimension mismatch for model '{}': expected {}, got {}",
                self.model_id,
                expected,
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

        let request = EmbedTextRequest {
            model: self.model_id.clone(),
            input: texts,
        };
        let parsed: EmbeddingResponse = self.client.post_json("v1/embeddings", &request).await?;
        let embeddings = parsed.into_embeddings();
        self.validate_dimensions(&embeddings)?;
        Ok(embeddings)
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, dimension: Option<usize>) -> EmbeddingConfig {
        EmbeddingConfig {
            url: url.to_string(),
            dimension,
            retries: 0,
            api_key_env: String::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_openai_data_sorted_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&config(&server.uri(), None)).unwrap();
        let out = embedder
            .embed(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_plain_embeddings_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5, 0.5, 0.5]]})),
            )
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&config(&server.uri(), Some(3))).unwrap();
        let out = embedder.embed(vec!["x".to_string()]).await.unwrap();
        assert_eq!(out[0].len(), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5, 0.5]]})),
            )
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&config(&server.uri(), Some(3))).unwrap();
        assert!(embedder.embed(vec!["x".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_server_error_is_embedding_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&config(&server.uri(), None)).unwrap();
        let err = embedder.embed(vec!["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }
}
