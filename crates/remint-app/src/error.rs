//! Application-level error type shared across binaries and services.

use thiserror::Error;

use crate::config;
use crate::server;
use crate::services::blob_store::BlobError;
use crate::services::synthesis::SynthesisError;
use crate::services::vision::VisionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
    #[error(transparent)]
    BlobStore(#[from] BlobError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
