use crate::error::ReplayError;
use crate::types::{CaptureRecord, HeaderEntry};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::{Duration, Instant};

/// Upper bound on response bytes kept from a replay.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Headers the HTTP client owns; copying them from a capture would corrupt the replay.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-connection",
];

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status: u16,
    pub status_text: String,
    /// Sorted by name; repeated values keep their order.
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
    pub body_truncated: bool,
    pub duration: Duration,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult, ReplayError>;
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_body_bytes: MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    fn build(&self, request: &DispatchRequest) -> Result<reqwest::RequestBuilder, ReplayError> {
        let method_name = if request.method.is_empty() {
            "GET".to_string()
        } else {
            request.method.to_ascii_uppercase()
        };
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ReplayError::InvalidMethod(request.method.clone()))?;

        let url = reqwest::Url::parse(&request.url).map_err(|e| ReplayError::InvalidUrl {
            url: request.url.clone(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ReplayError::InvalidUrl {
                url: request.url.clone(),
                message: format!("unsupported scheme {:?}", url.scheme()),
            });
        }

        let mut headers = HeaderMap::new();
        for entry in &request.headers {
            let name = HeaderName::from_bytes(entry.key.as_bytes())
                .map_err(|_| ReplayError::InvalidHeader(entry.key.clone()))?;
            let value = HeaderValue::from_str(&entry.value)
                .map_err(|_| ReplayError::InvalidHeader(entry.key.clone()))?;
            headers.append(name, value);
        }

        Ok(self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body.clone()))
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult, ReplayError> {
        if request.timeout.is_zero() {
            return Err(ReplayError::InvalidTimeout);
        }
        let builder = self.build(&request)?;
        let timeout = request.timeout;

        // Dropping the future on expiry aborts the underlying connection.
        let exchange = async {
            let started = Instant::now();
            let mut response = builder
                .send()
                .await
                .map_err(|e| ReplayError::from_reqwest(e, timeout))?;
            let duration = started.elapsed();

            let status = response.status();
            let headers = flatten_headers(response.headers());

            let mut body = Vec::new();
            let mut body_truncated = false;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| ReplayError::from_reqwest(e, timeout))?
            {
                let room = self.max_body_bytes - body.len();
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    body_truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }

            Ok::<_, ReplayError>(DispatchResult {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
                body,
                body_truncated,
                duration,
            })
        };

        let result = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ReplayError::DeadlineExceeded(timeout))?;

        if let Ok(result) = &result {
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                status = result.status,
                duration_ms = result.duration.as_millis() as u64,
                truncated = result.body_truncated,
                "dispatched request"
            );
        }
        result
    }
}

/// Flatten a header map into `(name, value)` pairs sorted by name, keeping
/// every value of a repeated header in its original order. Bytes that are not
/// UTF-8 become U+FFFD.
pub fn flatten_headers(headers: &HeaderMap) -> Vec<HeaderEntry> {
    let mut names: Vec<&HeaderName> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    names
        .into_iter()
        .flat_map(|name| {
            headers.get_all(name).iter().map(move |value| {
                let text = String::from_utf8_lossy(value.as_bytes());
                if let std::borrow::Cow::Owned(_) = text {
                    tracing::debug!(header = %name, raw = ?value, "header value is not UTF-8; invalid bytes replaced");
                }
                HeaderEntry::new(name.as_str(), text)
            })
        })
        .collect()
}

/// Build a replay of a stored capture against `target_url`.
pub fn request_from_capture(
    record: &CaptureRecord,
    target_url: &str,
    timeout: Duration,
) -> Result<DispatchRequest, base64::DecodeError> {
    let headers = record
        .headers
        .iter()
        .filter(|h| !HOP_BY_HOP.iter().any(|hop| h.key.eq_ignore_ascii_case(hop)))
        .cloned()
        .collect();

    Ok(DispatchRequest {
        method: record.method.clone(),
        url: target_url.to_string(),
        headers,
        body: record.decode_body()?,
        timeout,
    })
}
