use crate::capture::detect::{DetectionContext, ProviderDetector, UNKNOWN_PROVIDER};
use crate::capture::store::CaptureRepository;
use crate::error::{IngestError, RelayError};
use crate::replay::{request_from_capture, Dispatcher};
use crate::types::{header_value, CaptureFile, HeaderEntry};
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;

/// Bodies above this size are never previewed, even when they are JSON.
pub const MAX_PREVIEW_BYTES: usize = 64 * 1024;

pub const CAPTURE_TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An inbound request as seen by the capture server.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: Vec<HeaderEntry>,
    pub remote_addr: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub file: CaptureFile,
    /// Set when the capture was stored but the relay hook failed.
    pub relay_error: Option<RelayError>,
}

/// Notified with every capture after it has been stored.
#[async_trait]
pub trait RelayHook: Send + Sync {
    async fn relay(&self, file: &CaptureFile) -> Result<(), RelayError>;
}

/// Forwards each stored capture to a fixed URL.
pub struct ForwardRelay {
    dispatcher: Arc<dyn Dispatcher>,
    target: String,
    timeout: Duration,
}

impl ForwardRelay {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RelayHook for ForwardRelay {
    async fn relay(&self, file: &CaptureFile) -> Result<(), RelayError> {
        let request = request_from_capture(&file.record, &self.target, self.timeout)
            .map_err(|e| RelayError(format!("undecodable body: {e}")))?;
        let result = self
            .dispatcher
            .dispatch(request)
            .await
            .map_err(|e| RelayError(e.to_string()))?;
        tracing::info!(id = %file.record.id, target = %self.target, status = result.status, "relayed capture");
        Ok(())
    }
}

pub struct IngestService {
    store: Arc<dyn CaptureRepository>,
    detector: Option<Arc<dyn ProviderDetector>>,
    relay: Option<Arc<dyn RelayHook>>,
}

impl IngestService {
    /// The store is mandatory; detection and relaying are opt-in.
    pub fn new(store: Arc<dyn CaptureRepository>) -> Self {
        Self {
            store,
            detector: None,
            relay: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProviderDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayHook>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn store(&self) -> &Arc<dyn CaptureRepository> {
        &self.store
    }

    /// Store the request, then notify the relay hook. A relay failure is
    /// reported next to the stored capture and never undoes it.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let file = self.store_capture(request).await?;
        let relay_error = self.relay(&file).await;
        Ok(IngestOutcome { file, relay_error })
    }

    /// Detect, shape and persist a capture without running the relay hook.
    pub async fn store_capture(&self, request: IngestRequest) -> Result<CaptureFile, IngestError> {
        let method = request.method.to_ascii_uppercase();
        let content_type = header_value(&request.headers, "content-type")
            .unwrap_or_default()
            .to_string();

        let provider = self
            .detector
            .as_ref()
            .and_then(|detector| {
                detector.detect(&DetectionContext {
                    method: &method,
                    path: &request.path,
                    headers: &request.headers,
                    body: &request.body,
                })
            })
            .map(|result| {
                tracing::debug!(provider = %result.provider, confidence = result.confidence, "detected provider");
                result.provider
            })
            .filter(|provider| !provider.is_empty())
            .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string());

        let mut record = self.store.build_base_record(CAPTURE_TOOL_VERSION);
        record.parsed_json_preview = json_preview(&content_type, &request.body);
        record.method = method;
        record.url = request.url;
        record.path = request.path;
        record.headers = request.headers;
        record.remote_addr = request.remote_addr;
        record.content_type = content_type;
        record.content_length = request.body.len() as u64;
        record.raw_body = base64::engine::general_purpose::STANDARD.encode(&request.body);
        record.provider = provider;

        let store = self.store.clone();
        let file = match tokio::task::spawn_blocking(move || store.save(record)).await {
            Ok(saved) => saved?,
            Err(e) if e.is_cancelled() => return Err(IngestError::Cancelled),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        };
        tracing::info!(
            id = %file.record.id,
            method = %file.record.method,
            path = %file.record.path,
            provider = %file.record.provider,
            bytes = file.record.content_length,
            "captured request"
        );
        Ok(file)
    }

    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Run the relay hook for an already stored capture.
    pub async fn relay(&self, file: &CaptureFile) -> Option<RelayError> {
        let relay = self.relay.as_ref()?;
        let err = relay.relay(file).await.err()?;
        tracing::warn!(id = %file.record.id, error = %err, "relay failed; capture kept");
        Some(err)
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == "application/json" || media_type.ends_with("+json")
}

/// The body itself, unmodified, when it is small, declared JSON and valid JSON.
fn json_preview(content_type: &str, body: &[u8]) -> Option<Box<serde_json::value::RawValue>> {
    if body.is_empty() || body.len() > MAX_PREVIEW_BYTES || !is_json_content_type(content_type) {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;
    serde_json::value::RawValue::from_string(text.to_string()).ok()
}
