//! Domain types flowing through the image regeneration pipeline.

pub mod orchestrator;

use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString};

/// Upper bound for a single uploaded image, in bytes.
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Upper bound for base image plus all reference images combined.
pub const MAX_PAYLOAD_BYTES: usize = 50 * 1024 * 1024;

/// MIME types the pipeline accepts for uploaded images.
pub const ACCEPTED_IMAGE_MIME: [&str; 5] = [
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
    "image/gif",
];

/// Closed set of aspect ratios understood by the synthesis providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumString, EnumIter,
)]
pub enum AspectRatio {
    #[serde(rename = "21:9")]
    #[strum(serialize = "21:9")]
    Wide21x9,
    #[serde(rename = "16:9")]
    #[strum(serialize = "16:9")]
    Wide16x9,
    #[serde(rename = "3:2")]
    #[strum(serialize = "3:2")]
    Landscape3x2,
    #[serde(rename = "4:3")]
    #[strum(serialize = "4:3")]
    Landscape4x3,
    #[serde(rename = "5:4")]
    #[strum(serialize = "5:4")]
    Landscape5x4,
    #[default]
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    #[strum(serialize = "4:5")]
    Portrait4x5,
    #[serde(rename = "3:4")]
    #[strum(serialize = "3:4")]
    Portrait3x4,
    #[serde(rename = "2:3")]
    #[strum(serialize = "2:3")]
    Portrait2x3,
    #[serde(rename = "9:16")]
    #[strum(serialize = "9:16")]
    Tall9x16,
}

impl AspectRatio {
    /// The `w:h` spelling sent on provider wires.
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Wide21x9 => "21:9",
            AspectRatio::Wide16x9 => "16:9",
            AspectRatio::Landscape3x2 => "3:2",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Landscape5x4 => "5:4",
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Portrait2x3 => "2:3",
            AspectRatio::Tall9x16 => "9:16",
        }
    }

    /// Lenient parse used when speaking to the fallback provider: unknown
    /// values collapse to the default instead of failing.
    pub fn parse_or_default(value: &str) -> Self {
        Self::from_str(value.trim()).unwrap_or_default()
    }
}

/// One decoded multipart image file.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub mime: String,
    pub file_name: Option<String>,
}

impl UploadedImage {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Validated input for one pipeline invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub base_image: UploadedImage,
    pub reference_images: Vec<UploadedImage>,
    /// Trimmed instructions; `None` when the field was absent or whitespace.
    pub user_instructions: Option<String>,
    pub aspect_ratio: AspectRatio,
}

/// Structured result of a vision/text model call.
///
/// `generated` is `false` when the model refused or returned unusable
/// content; downstream stages must not run in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub prompt: String,
    pub generated: bool,
}

impl PromptOutcome {
    pub fn generated(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            generated: true,
        }
    }

    pub fn refused(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            generated: false,
        }
    }
}

/// An immutable object persisted to the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub key: String,
    pub url: String,
}

/// Terminal payload returned for every accepted request, complete or
/// short-circuited. Nullable fields record how far the pipeline got.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub base_image_url: Option<String>,
    pub base_image_key: Option<String>,
    pub reference_image_urls: Vec<String>,
    pub reference_image_keys: Vec<String>,
    pub prompt1: Option<String>,
    pub prompt2: Option<String>,
    pub output_image_url: Option<String>,
    pub output_image_key: Option<String>,
    pub step2_executed: bool,
    #[serde(rename = "isPromptGenerated")]
    pub prompt_generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
