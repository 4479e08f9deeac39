use crate::capture::ingest::{IngestRequest, IngestService};
use crate::error::{IngestError, ServerError};
use crate::replay::flatten_headers;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds any free port; [`CaptureServer::start`] reports the real one.
    pub port: u16,
    pub max_body_bytes: usize,
    /// Bounds body read plus ingestion for a single request.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_body_bytes: MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct ServerState {
    ingest: Arc<IngestService>,
    shutdown: watch::Receiver<bool>,
    max_body_bytes: usize,
    request_timeout: Duration,
}

type Outcome = Option<Result<(), ServerError>>;

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    outcome_tx: Arc<watch::Sender<Outcome>>,
    abort: AbortHandle,
}

/// Accepts any method on any path and stores each request as a capture.
pub struct CaptureServer {
    config: ServerConfig,
    ingest: Arc<IngestService>,
    running: Option<Running>,
}

impl CaptureServer {
    pub fn new(config: ServerConfig, ingest: Arc<IngestService>) -> Self {
        Self {
            config,
            ingest,
            running: None,
        }
    }

    /// Bind and begin serving in the background. Returns the bound port;
    /// serve failures surface later through [`CaptureServer::wait`].
    pub async fn start(&mut self) -> Result<u16, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        self.ingest
            .store()
            .ensure_storage_dir()
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| ServerError::Bind {
            addr: addr.clone(),
            message: e.to_string(),
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| ServerError::Bind {
                addr: addr.clone(),
                message: e.to_string(),
            })?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcome_tx, _) = watch::channel::<Outcome>(None);
        let outcome_tx = Arc::new(outcome_tx);

        let state = ServerState {
            ingest: self.ingest.clone(),
            shutdown: shutdown_rx.clone(),
            max_body_bytes: self.config.max_body_bytes,
            request_timeout: self.config.request_timeout,
        };
        let app = Router::new().fallback(handle_capture).with_state(state);

        let task_outcome = outcome_tx.clone();
        let mut signal_rx = shutdown_rx;
        let task = tokio::spawn(async move {
            let signal = async move {
                // A dropped sender also means "stop".
                let _ = signal_rx.wait_for(|stop| *stop).await;
            };
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()));

            if let Err(e) = &result {
                tracing::error!(error = %e, "capture server exited");
            }
            record_outcome(&task_outcome, result);
        });
        let abort = task.abort_handle();
        tokio::spawn(supervise(task, outcome_tx.clone()));

        tracing::info!(port, host = %self.config.host, "capture server listening");
        self.running = Some(Running {
            port,
            shutdown_tx,
            outcome_tx,
            abort,
        });
        Ok(port)
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    /// Stop accepting connections and let in-flight requests finish within `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let running = self.running.as_ref().ok_or(ServerError::NotStarted)?;
        running.shutdown_tx.send_replace(true);

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                running.abort.abort();
                record_outcome(&running.outcome_tx, Err(ServerError::ShutdownTimeout));
                tracing::warn!(?grace, "capture server aborted after shutdown deadline");
                // The serve loop may have finished first; report whatever was recorded.
                self.wait().await
            }
        }
    }

    /// Block until the serve loop has exited. Every call yields the same outcome.
    pub async fn wait(&self) -> Result<(), ServerError> {
        let running = self.running.as_ref().ok_or(ServerError::NotStarted)?;
        let mut rx = running.outcome_tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ServerError::Serve("serve loop vanished".to_string()))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Ok(()),
        }
    }
}

/// Records an outcome for a serve task that ended without recording one
/// itself, so waiters never hang on a panicked or aborted loop.
async fn supervise(task: JoinHandle<()>, outcome_tx: Arc<watch::Sender<Outcome>>) {
    if let Err(e) = task.await {
        let err = if e.is_cancelled() {
            ServerError::ShutdownTimeout
        } else {
            ServerError::Serve(format!("serve task panicked: {e}"))
        };
        record_outcome(&outcome_tx, Err(err));
    }
}

/// First write wins; later outcomes are dropped.
fn record_outcome(tx: &watch::Sender<Outcome>, result: Result<(), ServerError>) {
    tx.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    });
}

#[derive(Serialize)]
struct CapturedBody {
    status: &'static str,
    id: String,
    provider: String,
    file: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Read(axum::Error),
}

/// Read at most `limit + 1` bytes; seeing the extra byte means the body is too large.
async fn read_bounded(body: Body, limit: usize) -> Result<Vec<u8>, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        let room = limit + 1 - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() > limit {
            return Err(BodyError::TooLarge);
        }
    }
    Ok(buf)
}

async fn handle_capture(
    State(state): State<ServerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if *state.shutdown.borrow() {
        return error_response(StatusCode::REQUEST_TIMEOUT, "server is shutting down");
    }
    let deadline = tokio::time::Instant::now() + state.request_timeout;
    let (parts, body) = request.into_parts();

    let body = match tokio::time::timeout_at(deadline, read_bounded(body, state.max_body_bytes)).await {
        Err(_) => return error_response(StatusCode::REQUEST_TIMEOUT, "timed out reading request body"),
        Ok(Err(BodyError::TooLarge)) => {
            tracing::warn!(%remote, limit = state.max_body_bytes, "rejected oversized request body");
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", state.max_body_bytes),
            );
        }
        Ok(Err(BodyError::Read(e))) => {
            return error_response(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}"))
        }
        Ok(Ok(body)) => body,
    };

    let request = IngestRequest {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        path: parts.uri.path().to_string(),
        headers: flatten_headers(&parts.headers),
        remote_addr: remote.to_string(),
        body,
    };

    // The deadline covers storing only; the relay runs detached so a slow
    // downstream can neither delay nor cancel the answer for a stored capture.
    match tokio::time::timeout_at(deadline, state.ingest.store_capture(request)).await {
        Err(_) | Ok(Err(IngestError::Cancelled)) => {
            error_response(StatusCode::REQUEST_TIMEOUT, "capture cancelled before it was stored")
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to store capture");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Ok(Ok(file)) => {
            if state.ingest.has_relay() {
                let ingest = state.ingest.clone();
                let stored = file.clone();
                tokio::spawn(async move {
                    ingest.relay(&stored).await;
                });
            }
            Json(CapturedBody {
                status: "captured",
                id: file.record.id,
                provider: file.record.provider,
                file: file.path.display().to_string(),
            })
            .into_response()
        }
    }
}
