//! Image synthesis with primary-provider quota fallback.
//!
//! One primary attempt against the Vertex `generateContent` endpoint; when
//! the failure classifies as quota exhaustion, exactly one attempt against
//! the Key-scheme fallback provider. Every other primary error propagates
//! unchanged. No backoff, no retries.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{FallbackImageConfig, PrimaryImageConfig};
use crate::pipeline::AspectRatio;

/// Model served through the primary Vertex project.
const PRIMARY_MODEL_ID: &str = "gemini-2.5-flash-image";
const VERTEX_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// gRPC numeric code for RESOURCE_EXHAUSTED as surfaced in REST error bodies.
const RESOURCE_EXHAUSTED_CODE: i64 = 8;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("primary image provider returned HTTP {status}: {message}")]
    Primary { status: u16, message: String },
    #[error("primary image provider reply carried no inline image data")]
    MissingInlineData,
    #[error("failed to decode inline image data: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("image provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to obtain provider access token: {0}")]
    Auth(String),
    #[error("primary quota exhausted and no fallback API key is configured")]
    FallbackUnavailable,
    #[error("fallback image provider returned HTTP {status}: {message}")]
    Fallback { status: u16, message: String },
    #[error("fallback image provider returned no image references")]
    FallbackEmptyImages,
}

/// Seam between the orchestrator and image generation.
#[async_trait::async_trait]
pub trait ImageModel: Send + Sync {
    /// Generate one image. `None` aspect ratio falls back to the configured
    /// default.
    async fn generate(
        &self,
        prompt: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Bytes, SynthesisError>;
}

/// Source of bearer tokens for the primary provider. The production source
/// mints tokens from the service-account credentials file; tests inject a
/// static token.
#[async_trait::async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SynthesisError>;
}

pub struct ServiceAccountTokens {
    account: gcp_auth::CustomServiceAccount,
}

impl ServiceAccountTokens {
    pub fn from_credentials_file(
        path: &std::path::Path,
    ) -> Result<Self, SynthesisError> {
        let account = gcp_auth::CustomServiceAccount::from_file(path)
            .map_err(|err| SynthesisError::Auth(err.to_string()))?;
        Ok(Self { account })
    }
}

#[async_trait::async_trait]
impl AccessTokenSource for ServiceAccountTokens {
    async fn bearer_token(&self) -> Result<String, SynthesisError> {
        use gcp_auth::TokenProvider;
        let token = self
            .account
            .token(&[VERTEX_SCOPE])
            .await
            .map_err(|err| SynthesisError::Auth(err.to_string()))?;
        Ok(token.as_str().to_string())
    }
}

/// Static token source for tests and mock endpoints.
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl AccessTokenSource for StaticToken {
    async fn bearer_token(&self) -> Result<String, SynthesisError> {
        Ok(self.0.clone())
    }
}

pub struct SynthesisClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    project_id: String,
    location: String,
    endpoint_base: String,
    fallback_api_key: Option<String>,
    fallback_url: String,
    default_aspect_ratio: AspectRatio,
    output_format: String,
}

impl SynthesisClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        primary: &PrimaryImageConfig,
        fallback: &FallbackImageConfig,
        output_format: impl Into<String>,
    ) -> Self {
        let endpoint_base = primary.endpoint_override.clone().unwrap_or_else(|| {
            format!("https://{}-aiplatform.googleapis.com", primary.location)
        });
        let fallback_url = format!(
            "{}/{}",
            fallback.endpoint.trim_end_matches('/'),
            fallback.model_id
        );
        Self {
            http,
            tokens,
            project_id: primary.project_id.clone(),
            location: primary.location.clone(),
            endpoint_base,
            fallback_api_key: fallback.api_key.clone(),
            fallback_url,
            // Unknown configured defaults collapse to 1:1 rather than failing.
            default_aspect_ratio: AspectRatio::parse_or_default(&fallback.aspect_ratio),
            output_format: output_format.into(),
        }
    }

    fn primary_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            self.endpoint_base.trim_end_matches('/'),
            self.project_id,
            self.location,
            PRIMARY_MODEL_ID
        )
    }

    async fn generate_primary(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Bytes, SynthesisError> {
        let token = self.tokens.bearer_token().await?;
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": aspect_ratio.as_str() }
            }
        });

        let response = self
            .http
            .post(self.primary_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Primary {
                status: status.as_u16(),
                message: body,
            });
        }

        let reply: GenerateContentResponse = response.json().await?;
        let inline = reply
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .find_map(|part| part.inline_data)
            })
            .ok_or(SynthesisError::MissingInlineData)?;

        Ok(Bytes::from(BASE64_STANDARD.decode(inline.data)?))
    }

    async fn generate_fallback(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Bytes, SynthesisError> {
        let api_key = self
            .fallback_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SynthesisError::FallbackUnavailable)?;

        let body = json!({
            "prompt": prompt,
            "num_images": 1,
            "aspect_ratio": aspect_ratio.as_str(),
            "output_format": self.output_format,
        });

        let response = self
            .http
            .post(&self.fallback_url)
            .header(reqwest::header::AUTHORIZATION, format!("Key {api_key}"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Fallback {
                status: status.as_u16(),
                message,
            });
        }

        let reply: FallbackResponse = response.json().await?;
        let image_url = reply
            .images
            .into_iter()
            .next()
            .map(|image| image.url)
            .ok_or(SynthesisError::FallbackEmptyImages)?;

        let image = self.http.get(&image_url).send().await?;
        let status = image.status();
        if !status.is_success() {
            return Err(SynthesisError::Fallback {
                status: status.as_u16(),
                message: format!("image download from {image_url} failed"),
            });
        }
        Ok(image.bytes().await?)
    }
}

#[async_trait::async_trait]
impl ImageModel for SynthesisClient {
    async fn generate(
        &self,
        prompt: &str,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<Bytes, SynthesisError> {
        let effective = aspect_ratio.unwrap_or(self.default_aspect_ratio);

        match self.generate_primary(prompt, effective).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_quota_exhausted() => {
                tracing::warn!("primary quota exhausted; using fallback");
                self.generate_fallback(prompt, effective).await
            }
            Err(err) => Err(err),
        }
    }
}

impl SynthesisError {
    fn is_quota_exhausted(&self) -> bool {
        match self {
            SynthesisError::Primary { message, .. } => classify_quota_exhausted(message),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CandidatePart {
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Deserialize)]
struct FallbackResponse {
    #[serde(default)]
    images: Vec<FallbackImage>,
}

#[derive(Debug, Deserialize)]
struct FallbackImage {
    url: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ErrorBody {
    code: Option<i64>,
    status: Option<String>,
    message: Option<String>,
    details: serde_json::Value,
}

/// Classify an upstream error body as quota exhaustion: the gRPC numeric
/// code, the textual status, or `RESOURCE_EXHAUSTED` / `QUOTA` anywhere in
/// the concatenated details and message.
pub fn classify_quota_exhausted(body: &str) -> bool {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        let upper = body.to_uppercase();
        return upper.contains("RESOURCE_EXHAUSTED") || upper.contains("QUOTA");
    };

    if envelope.error.code == Some(RESOURCE_EXHAUSTED_CODE) {
        return true;
    }
    if envelope.error.status.as_deref() == Some("RESOURCE_EXHAUSTED") {
        return true;
    }
    let mut haystack = envelope.error.details.to_string();
    haystack.push_str(envelope.error.message.as_deref().unwrap_or_default());
    let upper = haystack.to_uppercase();
    upper.contains("RESOURCE_EXHAUSTED") || upper.contains("QUOTA")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_detected_by_numeric_code() {
        let body = r#"{"error": {"code": 8, "message": "limit reached"}}"#;
        assert!(classify_quota_exhausted(body));
    }

    #[test]
    fn quota_detected_by_status_field() {
        let body = r#"{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "x"}}"#;
        assert!(classify_quota_exhausted(body));
    }

    #[test]
    fn quota_detected_by_message_text() {
        let body = r#"{"error": {"code": 429, "message": "Quota exceeded for model"}}"#;
        assert!(classify_quota_exhausted(body));
    }

    #[test]
    fn quota_detected_by_details_text() {
        let body = r#"{"error": {"code": 429, "details": [{"reason": "RATE_LIMIT_EXCEEDED", "metadata": {"quota_limit": "GenerateContentRequestsPerMinute"}}]}}"#;
        assert!(classify_quota_exhausted(body));
    }

    #[test]
    fn ordinary_errors_are_not_quota() {
        let body = r#"{"error": {"code": 400, "status": "INVALID_ARGUMENT", "message": "bad prompt"}}"#;
        assert!(!classify_quota_exhausted(body));

        let body = r#"{"error": {"code": 500, "status": "INTERNAL", "message": "boom"}}"#;
        assert!(!classify_quota_exhausted(body));
    }

    #[test]
    fn unparseable_body_falls_back_to_text_scan() {
        assert!(classify_quota_exhausted("upstream says: quota exceeded"));
        assert!(!classify_quota_exhausted("plain internal error"));
    }
}
