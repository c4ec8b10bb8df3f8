//! Source PDF fetching
//!
//! A source is an `http(s)://` URL, a `file://` URL, or a local path. Every
//! failure is an [`Error::Fetch`], which aborts the ingestion.

use crate::error::{Error, Result};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const USER_AGENT: &str = concat!("syllabus/", env!("CARGO_PKG_VERSION"));

/// Where a PDF comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfSource {
    Remote(Url),
    Local(PathBuf),
}

impl PdfSource {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(Error::Fetch("Empty PDF source".to_string()));
        }

        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(PdfSource::Remote(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(PdfSource::Local)
                .map_err(|_| Error::Fetch(format!("Invalid file URL: {}", source))),
            // Windows drive letters parse as one-letter schemes
            Ok(url) if url.scheme().len() > 1 => Err(Error::Fetch(format!(
                "Unsupported source scheme '{}'",
                url.scheme()
            ))),
            _ => Ok(PdfSource::Local(PathBuf::from(source))),
        }
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Fetch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, source: &PdfSource) -> Result<Vec<u8>> {
        let bytes = match source {
            PdfSource::Remote(url) => {
                info!("Downloading {}", url);
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(Error::Fetch(format!("HTTP {}: {}", status, url)));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?
                    .to_vec()
            }
            PdfSource::Local(path) => tokio::fs::read(path)
                .await
                .map_err(|e| Error::Fetch(format!("{}: {}", path.display(), e)))?,
        };

        if bytes.is_empty() {
            return Err(Error::Fetch("Source is empty".to_string()));
        }
        debug!("Fetched {} bytes", bytes.len());
        Ok(bytes)
    }
}
