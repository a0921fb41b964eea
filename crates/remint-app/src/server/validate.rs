//! Multipart decoding and request validation for the image-flow endpoint.
//!
//! A request is rejected wholesale when any file fails validation; all
//! findings are collected into one structured 400 so the client sees every
//! problem at once.

use std::str::FromStr;

use axum::{
    Json,
    extract::Multipart,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::pipeline::{
    ACCEPTED_IMAGE_MIME, AspectRatio, MAX_IMAGE_BYTES, MAX_PAYLOAD_BYTES, PipelineRequest,
    UploadedImage,
};

pub const FIELD_BASE_IMAGE: &str = "baseImage";
pub const FIELD_REFERENCE_IMAGES: &str = "referenceImages";
pub const FIELD_USER_PROMPT: &str = "userPrompt";
pub const FIELD_ASPECT_RATIO: &str = "aspectRatio";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Structured 400 body: `{ "message": ..., "issues": [...] }`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRejection {
    pub message: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationRejection {
    fn new(message: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self {
            message: message.into(),
            issues,
        }
    }

    fn malformed(detail: impl Into<String>) -> Self {
        Self::new(
            "failed to read multipart body",
            vec![ValidationIssue {
                field: "body".to_string(),
                message: detail.into(),
            }],
        )
    }
}

impl IntoResponse for ValidationRejection {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

fn issue(field: &str, message: impl Into<String>) -> ValidationIssue {
    debug_assert!(!field.is_empty());
    ValidationIssue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Decode the multipart body into a validated [`PipelineRequest`].
pub async fn decode_multipart(
    mut multipart: Multipart,
    max_reference_images: usize,
) -> Result<PipelineRequest, ValidationRejection> {
    debug_assert!(MAX_IMAGE_BYTES <= MAX_PAYLOAD_BYTES);

    let mut base_image: Option<UploadedImage> = None;
    let mut reference_images: Vec<UploadedImage> = Vec::new();
    let mut user_prompt: Option<String> = None;
    let mut aspect_ratio: Option<AspectRatio> = None;
    let mut issues: Vec<ValidationIssue> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ValidationRejection::malformed(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FIELD_BASE_IMAGE => {
                let image = read_image_field(field, FIELD_BASE_IMAGE, &mut issues).await?;
                if base_image.is_some() {
                    issues.push(issue(
                        FIELD_BASE_IMAGE,
                        "exactly one base image must be provided",
                    ));
                } else {
                    base_image = image;
                }
            }
            FIELD_REFERENCE_IMAGES => {
                if let Some(image) =
                    read_image_field(field, FIELD_REFERENCE_IMAGES, &mut issues).await?
                {
                    reference_images.push(image);
                }
            }
            FIELD_USER_PROMPT => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ValidationRejection::malformed(err.to_string()))?;
                user_prompt = Some(text);
            }
            FIELD_ASPECT_RATIO => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ValidationRejection::malformed(err.to_string()))?;
                match AspectRatio::from_str(text.trim()) {
                    Ok(ratio) => aspect_ratio = Some(ratio),
                    Err(_) => issues.push(issue(
                        FIELD_ASPECT_RATIO,
                        format!("`{text}` is not a supported aspect ratio"),
                    )),
                }
            }
            // Unknown fields are ignored, not rejected.
            _ => {}
        }
    }

    if base_image.is_none() {
        issues.push(issue(FIELD_BASE_IMAGE, "a base image file is required"));
    }

    if reference_images.len() > max_reference_images {
        issues.push(issue(
            FIELD_REFERENCE_IMAGES,
            format!(
                "at most {max_reference_images} reference images are allowed (got {})",
                reference_images.len()
            ),
        ));
    }

    let aggregate: usize = base_image.iter().map(UploadedImage::size).sum::<usize>()
        + reference_images.iter().map(UploadedImage::size).sum::<usize>();
    if aggregate > MAX_PAYLOAD_BYTES {
        issues.push(issue(
            "body",
            format!(
                "combined image payload of {aggregate} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit"
            ),
        ));
    }

    if !issues.is_empty() {
        return Err(ValidationRejection::new("request validation failed", issues));
    }

    let base_image = base_image.expect("checked above");

    Ok(PipelineRequest {
        base_image,
        reference_images,
        user_instructions: normalize_prompt(user_prompt),
        aspect_ratio: aspect_ratio.unwrap_or_default(),
    })
}

async fn read_image_field(
    field: axum::extract::multipart::Field<'_>,
    field_name: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Result<Option<UploadedImage>, ValidationRejection> {
    let file_name = field.file_name().map(str::to_string);
    let mime = field.content_type().unwrap_or_default().to_string();
    let bytes = field
        .bytes()
        .await
        .map_err(|err| ValidationRejection::malformed(err.to_string()))?;

    let display_name = file_name.as_deref().unwrap_or("<unnamed>");

    if !ACCEPTED_IMAGE_MIME.contains(&mime.as_str()) {
        issues.push(issue(
            field_name,
            format!("file `{display_name}` has unsupported type `{mime}`"),
        ));
        return Ok(None);
    }

    if bytes.len() > MAX_IMAGE_BYTES {
        issues.push(issue(
            field_name,
            format!(
                "file `{display_name}` is {} bytes, above the {MAX_IMAGE_BYTES} byte limit",
                bytes.len()
            ),
        ));
        return Ok(None);
    }

    Ok(Some(UploadedImage {
        bytes,
        mime,
        file_name,
    }))
}

/// Trim the prompt; whitespace-only input counts as "not provided".
pub fn normalize_prompt(raw: Option<String>) -> Option<String> {
    raw.and_then(|text| {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
