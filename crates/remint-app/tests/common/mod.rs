//! Shared doubles and builders for the integration specs.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use url::Url;

use remint_app::pipeline::orchestrator::Orchestrator;
use remint_app::pipeline::{AspectRatio, PromptOutcome, StoredAsset, UploadedImage};
use remint_app::server::{AppState, AppStateHandle};
use remint_app::services::blob_store::{BlobError, BlobStore, KeyPrefix, object_key};
use remint_app::services::synthesis::{ImageModel, SynthesisError};
use remint_app::services::vision::{PromptModel, VisionError};

pub const TEST_FOLDER: &str = "internaluse";

/// In-memory blob store shared between a spec and the state under test.
#[derive(Clone, Default)]
pub struct SharedBlobStore {
    pub objects: Arc<Mutex<HashMap<String, (String, Bytes)>>>,
    pub public_base_url: String,
}

impl SharedBlobStore {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            public_base_url: public_base_url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for SharedBlobStore {
    async fn upload(
        &self,
        bytes: Bytes,
        mime: &str,
        prefix: KeyPrefix,
        ext: Option<&str>,
    ) -> Result<StoredAsset, BlobError> {
        let key = object_key(TEST_FOLDER, prefix, mime, ext);
        let url = format!("{}{key}", self.public_base_url);
        self.objects
            .lock()
            .await
            .insert(key.clone(), (mime.to_string(), bytes));
        Ok(StoredAsset { key, url })
    }
}

/// Scripted reply for one prompting stage.
#[derive(Clone)]
pub enum ScriptedReply {
    Outcome(PromptOutcome),
    HttpError(u16, String),
}

impl ScriptedReply {
    fn materialize(&self) -> Result<PromptOutcome, VisionError> {
        match self {
            ScriptedReply::Outcome(outcome) => Ok(outcome.clone()),
            ScriptedReply::HttpError(status, body) => Err(VisionError::Http {
                status: *status,
                body: body.clone(),
            }),
        }
    }
}

pub struct StubPromptModel {
    pub stage1: ScriptedReply,
    pub stage2: Option<ScriptedReply>,
}

#[async_trait::async_trait]
impl PromptModel for StubPromptModel {
    async fn reconstruct_prompt(
        &self,
        _image_bytes: &[u8],
        _mime: &str,
    ) -> Result<PromptOutcome, VisionError> {
        self.stage1.materialize()
    }

    async fn apply_instructions(
        &self,
        _base_prompt: &str,
        _instructions: &str,
        _references: &[UploadedImage],
    ) -> Result<PromptOutcome, VisionError> {
        self.stage2
            .as_ref()
            .expect("stage 2 must only run when scripted")
            .materialize()
    }
}

#[derive(Clone)]
pub enum ScriptedImage {
    Bytes(&'static [u8]),
    Error(String),
}

pub struct StubImageModel {
    pub reply: ScriptedImage,
    pub seen_aspect: Arc<std::sync::Mutex<Option<Option<AspectRatio>>>>,
}

impl StubImageModel {
    pub fn new(reply: ScriptedImage) -> Self {
        Self {
            reply,
            seen_aspect: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

#[async_trait::async_trait]
impl ImageModel for StubImageModel {
    async fn generate(
        &self,
        _prompt: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Bytes, SynthesisError> {
        *self.seen_aspect.lock().unwrap() = Some(aspect_ratio);
        match &self.reply {
            ScriptedImage::Bytes(bytes) => Ok(Bytes::from_static(bytes)),
            ScriptedImage::Error(message) => Err(SynthesisError::Primary {
                status: 500,
                message: message.clone(),
            }),
        }
    }
}

/// Assemble an [`AppState`] around test doubles.
pub fn test_state(
    store: SharedBlobStore,
    prompts: StubPromptModel,
    images: StubImageModel,
    public_base_url: &str,
) -> AppStateHandle {
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(prompts),
        Arc::new(images),
        "png",
    );
    Arc::new(AppState {
        orchestrator,
        proxy_http: reqwest::Client::new(),
        public_base_url: Url::parse(public_base_url).expect("valid base url"),
        max_reference_images: 2,
    })
}

/// Hand-rolled multipart/form-data body builder.
pub struct MultipartBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBuilder {
    pub fn new() -> Self {
        Self {
            boundary: "remint-spec-boundary".to_string(),
            body: Vec::new(),
        }
    }

    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        self.body
            .extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Returns the content-type header value and the finished body.
    pub fn build(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}
