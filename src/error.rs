use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid limit {0}: must be positive")]
    InvalidLimit(usize),
    #[error("capture selector must not be empty")]
    InvalidSelector,
    #[error("capture not found: {0}")]
    CaptureNotFound(String),
    #[error("selector {selector:?} is ambiguous: matches {}", matches.join(", "))]
    AmbiguousSelector {
        selector: String,
        matches: Vec<String>,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize capture: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt capture file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("capture was cancelled before it could be stored")]
    Cancelled,
}

/// Failure of the downstream relay hook. Never undoes a stored capture.
#[derive(Debug, thiserror::Error)]
#[error("relay failed: {0}")]
pub struct RelayError(pub String);

/// Terminal and lifecycle errors of the capture server. Cloneable so the
/// serve loop's outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("capture server has not been started")]
    NotStarted,
    #[error("capture server was already started")]
    AlreadyStarted,
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },
    #[error("capture server failed: {0}")]
    Serve(String),
    #[error("capture server did not drain before the shutdown deadline")]
    ShutdownTimeout,
}

/// A signing key the MAC implementation refused.
#[derive(Debug, thiserror::Error)]
#[error("cannot sign payload: {0}")]
pub struct SigningError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("invalid target URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ReplayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReplayError::DeadlineExceeded(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ReplayError::DeadlineExceeded(timeout)
        } else if err.is_connect() {
            ReplayError::Connect(err.to_string())
        } else {
            ReplayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid template {field} {value:?}: expected 1-128 of [A-Za-z0-9._-]")]
    InvalidToken { field: &'static str, value: String },
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("template id {id:?} exists for several providers: {}", providers.join(", "))]
    AmbiguousTemplate { id: String, providers: Vec<String> },
    #[error("no template catalog URL configured")]
    NoCatalog,
    #[error("template catalog request failed: {0}")]
    Remote(String),
    #[error("template catalog returned {status} for {url}")]
    RemoteStatus { url: String, status: u16 },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode template data: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt template file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl TemplateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TemplateError::Io {
            path: path.into(),
            source,
        }
    }
}
