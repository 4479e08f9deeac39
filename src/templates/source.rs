use crate::error::TemplateError;
use crate::types::{TemplateMetadata, TemplatesIndex, WebhookTemplate};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const INDEX_FILE: &str = "index.json";

/// The remote template catalog.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_index(&self) -> Result<TemplatesIndex, TemplateError>;
    async fn fetch_template(&self, metadata: &TemplateMetadata) -> Result<WebhookTemplate, TemplateError>;
}

/// Catalog served over HTTP: `<base>/index.json` plus one document per
/// template at `<base>/<metadata.file>`.
pub struct HttpTemplateSource {
    client: reqwest::Client,
    base_url: reqwest::Url,
    timeout: Duration,
}

impl HttpTemplateSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TemplateError> {
        // Without a trailing slash `Url::join` would replace the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = reqwest::Url::parse(&normalized)
            .map_err(|e| TemplateError::Remote(format!("invalid catalog URL {base_url:?}: {e}")))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, relative: &str) -> Result<T, TemplateError> {
        if relative.starts_with('/') || relative.split('/').any(|seg| seg == "..") || relative.contains("://") {
            return Err(TemplateError::InvalidToken {
                field: "file",
                value: relative.to_string(),
            });
        }
        let url = self
            .base_url
            .join(relative)
            .map_err(|e| TemplateError::Remote(format!("invalid catalog path {relative:?}: {e}")))?;

        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TemplateError::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TemplateError::RemoteStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TemplateError::Remote(format!("decoding {url}: {e}")))
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch_index(&self) -> Result<TemplatesIndex, TemplateError> {
        self.get_json(INDEX_FILE).await
    }

    async fn fetch_template(&self, metadata: &TemplateMetadata) -> Result<WebhookTemplate, TemplateError> {
        self.get_json(&metadata.file).await
    }
}
