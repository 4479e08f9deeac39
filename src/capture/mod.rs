//! Inbound side: storage, provider detection, ingestion and the HTTP listener.

pub mod detect;
pub mod ingest;
pub mod server;
pub mod store;

pub use detect::{DetectorRegistry, ProviderDetector};
pub use ingest::{IngestService, RelayHook};
pub use server::{CaptureServer, ServerConfig};
pub use store::{CaptureRepository, FileCaptureStore};
