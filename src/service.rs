//! HTTP plumbing shared by the embedding and generation clients
//!
//! Both talk to OpenAI-compatible services: JSON POSTs with optional bearer
//! auth, a per-client timeout and a small fixed retry budget.

use crate::error::{Error, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Which error variant a failed call maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Embedding,
    Generation,
}

impl ServiceKind {
    fn error(self, message: String) -> Error {
        match self {
            ServiceKind::Embedding => Error::Embedding(message),
            ServiceKind::Generation => Error::Generation(message),
        }
    }
}

pub struct ServiceClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    retries: usize,
    kind: ServiceKind,
}

impl ServiceClient {
    pub fn new(
        kind: ServiceKind,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        retries: usize,
    ) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            retries,
            kind,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("Invalid service URL: {}", e)))
    }

    /// POST `body` as JSON to `path` and decode the JSON response
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        self.send_with_retry(request).await
    }

    async fn send_with_retry<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.retries {
            let req = request
                .try_clone()
                .ok_or_else(|| self.kind.error("Failed to clone service request".to_string()))?;
            match req.send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(ok) => match ok.json::<T>().await {
                        Ok(parsed) => return Ok(parsed),
                        Err(e) => {
                            return Err(self
                                .kind
                                .error(format!("Malformed service response: {}", e)))
                        }
                    },
                    Err(e) => last_err = Some(self.kind.error(e.to_string())),
                },
                Err(e) => last_err = Some(self.kind.error(e.to_string())),
            }

            if attempt < self.retries {
                debug!("Service call failed (attempt {}), retrying", attempt + 1);
                tokio::time::sleep(Duration::from_millis(200 * (attempt + 1) as u64)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| self.kind.error("Service request failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Echo {
        ok: bool,
    }

    #[tokio::test]
    async fn test_post_json_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ping"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = ServiceClient::new(
            ServiceKind::Generation,
            &server.uri(),
            Some("secret".to_string()),
            Duration::from_secs(5),
            0,
        )
        .unwrap();
        let echo: Echo = client.post_json("/v1/ping", &json!({})).await.unwrap();
        assert!(echo.ok);
    }

    #[tokio::test]
    async fn test_retries_then_maps_error_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = ServiceClient::new(
            ServiceKind::Embedding,
            &server.uri(),
            None,
            Duration::from_secs(5),
            2,
        )
        .unwrap();
        let result: Result<Echo> = client.post_json("v1/embeddings", &json!({})).await;
        assert!(matches!(result, Err(Error::Embedding(_))));
    }
}
