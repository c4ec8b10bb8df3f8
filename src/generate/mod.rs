//! Text-generation service client
//!
//! Used for heading compression, TOC normalization and grounded answers.
//! When no API key is configured there is no generator, and every caller
//! falls back to its own heuristic or empty result.

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::service::{ServiceClient, ServiceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Trait for text-generation providers
#[async_trait]
pub trait Generator: Send + Sync {
    /// Complete a single system + user exchange
    async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Message,
}

/// OpenAI-compatible chat completions client
pub struct ChatGenerator {
    client: ServiceClient,
    model: String,
}

impl ChatGenerator {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let client = ServiceClient::new(
            ServiceKind::Generation,
            &config.url,
            Some(api_key),
            Duration::from_secs(config.timeout_secs),
            config.retries,
        )?;
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Generator for ChatGenerator {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!("Calling generation model {}", self.model);
        let response: ChatResponse = self
            .client
            .post_json("v1/chat/completions", &request)
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Generation("Response contained no choices".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Create a generator if credentials are available
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn Generator>>> {
    match config.api_key() {
        Some(key) => {
            info!("Generation enabled with model {}", config.model);
            Ok(Some(Arc::new(ChatGenerator::new(config, key)?)))
        }
        None => {
            info!(
                "No API key in ${}; generation disabled",
                config.api_key_env
            );
            Ok(None)
        }
    }
}

/// Pull the first JSON object out of a reply that may wrap it in prose or
/// a code fence.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> GenerationConfig {
        GenerationConfig {
            url: url.to_string(),
            retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_json_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "temperature": 0.0,
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"sections\": []}"}}]
            })))
            .mount(&server)
            .await;

        let generator = ChatGenerator::new(&config(&server.uri()), "k".to_string()).unwrap();
        let reply = generator.complete("sys", "user", 0.0, true).await.unwrap();
        assert_eq!(reply, "{\"sections\": []}");
    }

    #[tokio::test]
    async fn test_empty_choices_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let generator = ChatGenerator::new(&config(&server.uri()), "k".to_string()).unwrap();
        let err = generator.complete("s", "u", 0.0, false).await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[test]
    fn test_missing_key_disables_generation() {
        let config = GenerationConfig {
            api_key_env: "SYLLABUS_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert!(create_generator(&config).unwrap().is_none());
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(
            extract_json_object("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}")
        );
        assert_eq!(extract_json_object("no json here"), None);
    }
}
