//! Clients for the external systems the pipeline coordinates.
//!
//! Everything here talks to the outside world (object storage, the
//! vision/text model, the image generators) behind narrow trait seams so
//! the orchestrator and the tests never depend on a concrete provider.

pub mod blob_store;
pub mod synthesis;
pub mod vision;

pub use blob_store::{BlobError, BlobStore, KeyPrefix, S3BlobStore};
pub use synthesis::{
    AccessTokenSource, ImageModel, ServiceAccountTokens, StaticToken, SynthesisClient,
    SynthesisError,
};
pub use vision::{PromptModel, VisionClient, VisionError};
