//! Process-wide configuration, read once at startup.
//!
//! Defaults are set through the builder; the exact environment variable
//! names of the deployment contract are mapped onto nested fields with
//! explicit overrides, then the result is validated so that a missing
//! required credential fails the process before it binds a socket.

use std::{env, path::PathBuf};

use config::{Config, ConfigError};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::services::vision::{DEFAULT_IMAGE_UNDERSTAND_PROMPT, DEFAULT_PROMPT_EDITOR_PROMPT};

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_STORAGE_FOLDER: &str = "internaluse";
pub const DEFAULT_OUTPUT_FORMAT: &str = "png";
pub const DEFAULT_MAX_REFERENCE_IMAGES: usize = 2;
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";
pub const DEFAULT_VISION_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_FALLBACK_ENDPOINT: &str = "https://fal.run";
pub const DEFAULT_FALLBACK_MODEL_ID: &str = "fal-ai/gemini-25-flash-image";
pub const DEFAULT_FALLBACK_ASPECT_RATIO: &str = "1:1";

const MAX_REFERENCE_IMAGES_CEILING: usize = 16;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] ConfigError),
    #[error("missing required environment variable {0}")]
    MissingRequired(&'static str),
    #[error("credentials file {path} does not exist")]
    MissingCredentialsFile { path: PathBuf },
    #[error("invalid public base URL `{url}`: {reason}")]
    InvalidPublicBaseUrl { url: String, reason: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub vision: VisionConfig,
    pub synthesis: SynthesisConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub system_prompt_image_understand: String,
    pub system_prompt_prompt_editor: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    pub primary: PrimaryImageConfig,
    pub fallback: FallbackImageConfig,
    /// File extension (and `image/<fmt>` MIME) for generated images.
    pub output_format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrimaryImageConfig {
    pub project_id: String,
    pub location: String,
    /// Path to the service-account credentials file, absolute after load.
    pub credentials_path: PathBuf,
    /// Test hook: replaces the `https://<location>-aiplatform.googleapis.com`
    /// base when set.
    #[serde(default)]
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackImageConfig {
    /// Absent keys are a lazy failure, surfaced only when the fallback is
    /// actually needed.
    #[serde(default)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model_id: String,
    pub aspect_ratio: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub endpoint: String,
    pub public_base_url: String,
    pub folder: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub max_reference_images: usize,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let mut builder = Config::builder()
        .set_default("server.port", i64::from(DEFAULT_PORT))?
        .set_default("vision.api_key", "")?
        .set_default("vision.model", DEFAULT_VISION_MODEL)?
        .set_default("vision.base_url", DEFAULT_VISION_BASE_URL)?
        .set_default(
            "vision.system_prompt_image_understand",
            DEFAULT_IMAGE_UNDERSTAND_PROMPT,
        )?
        .set_default(
            "vision.system_prompt_prompt_editor",
            DEFAULT_PROMPT_EDITOR_PROMPT,
        )?
        .set_default("synthesis.primary.project_id", "")?
        .set_default("synthesis.primary.location", "")?
        .set_default("synthesis.primary.credentials_path", "")?
        .set_default("synthesis.fallback.endpoint", DEFAULT_FALLBACK_ENDPOINT)?
        .set_default("synthesis.fallback.model_id", DEFAULT_FALLBACK_MODEL_ID)?
        .set_default(
            "synthesis.fallback.aspect_ratio",
            DEFAULT_FALLBACK_ASPECT_RATIO,
        )?
        .set_default("synthesis.output_format", DEFAULT_OUTPUT_FORMAT)?
        .set_default("storage.access_key", "")?
        .set_default("storage.secret_key", "")?
        .set_default("storage.bucket", "")?
        .set_default("storage.endpoint", "")?
        .set_default("storage.public_base_url", "")?
        .set_default("storage.folder", DEFAULT_STORAGE_FOLDER)?
        .set_default(
            "limits.max_reference_images",
            DEFAULT_MAX_REFERENCE_IMAGES as i64,
        )?;

    for (key, var) in ENV_BINDINGS {
        debug_assert!(!key.is_empty());
        builder = builder.set_override_option(*key, env::var(var).ok())?;
    }

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    normalize_config(&mut cfg)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Deployment-contract environment variables, mapped onto config fields.
const ENV_BINDINGS: &[(&str, &str)] = &[
    ("server.port", "PORT"),
    ("vision.api_key", "OPENAI_API_KEY"),
    ("vision.model", "OPENAI_MODEL"),
    ("vision.base_url", "OPENAI_BASE_URL"),
    (
        "vision.system_prompt_image_understand",
        "SYSTEM_PROMPT_IMAGE_UNDERSTAND",
    ),
    (
        "vision.system_prompt_prompt_editor",
        "SYSTEM_PROMPT_PROMPT_EDITOR",
    ),
    ("synthesis.primary.project_id", "GOOGLE_VERTEX_PROJECT_ID"),
    ("synthesis.primary.location", "GOOGLE_VERTEX_LOCATION"),
    (
        "synthesis.primary.credentials_path",
        "GOOGLE_APPLICATION_CREDENTIALS",
    ),
    (
        "synthesis.primary.endpoint_override",
        "VERTEX_ENDPOINT_OVERRIDE",
    ),
    ("synthesis.fallback.api_key", "FAL_API_KEY"),
    ("synthesis.fallback.endpoint", "FAL_GEMINI_ENDPOINT"),
    ("synthesis.fallback.model_id", "FAL_GEMINI_MODEL_ID"),
    ("synthesis.fallback.aspect_ratio", "FAL_GEMINI_ASPECT_RATIO"),
    ("synthesis.output_format", "IMAGE_OUTPUT_FORMAT"),
    ("storage.access_key", "S3_ACCESS_KEY"),
    ("storage.secret_key", "S3_SECRET_KEY"),
    ("storage.bucket", "S3_BUCKET_NAME"),
    ("storage.endpoint", "S3_ENDPOINT_URL"),
    ("storage.public_base_url", "S3_PUBLIC_LINK"),
    ("storage.folder", "S3_FOLDER"),
    ("limits.max_reference_images", "MAX_REFERENCE_IMAGES"),
];

fn normalize_config(cfg: &mut AppConfig) -> Result<(), AppConfigError> {
    // The proxy and the blob adapter both resolve keys against the public
    // base URL; a trailing slash keeps `Url::join` from eating the last path
    // segment.
    if !cfg.storage.public_base_url.is_empty() && !cfg.storage.public_base_url.ends_with('/') {
        cfg.storage.public_base_url.push('/');
    }

    // Relative credential paths are resolved against the working directory
    // once, at startup, so later provider calls never depend on cwd.
    let raw = cfg.synthesis.primary.credentials_path.clone();
    if !raw.as_os_str().is_empty() && raw.is_relative() {
        let cwd = env::current_dir()
            .map_err(|err| invalid_config(format!("failed to resolve working directory: {err}")))?;
        cfg.synthesis.primary.credentials_path = cwd.join(raw);
    }

    Ok(())
}

fn validate_config(cfg: &AppConfig) -> Result<(), AppConfigError> {
    debug_assert!(DEFAULT_MAX_REFERENCE_IMAGES <= MAX_REFERENCE_IMAGES_CEILING);

    require(&cfg.vision.api_key, "OPENAI_API_KEY")?;
    require(&cfg.storage.access_key, "S3_ACCESS_KEY")?;
    require(&cfg.storage.secret_key, "S3_SECRET_KEY")?;
    require(&cfg.storage.bucket, "S3_BUCKET_NAME")?;
    require(&cfg.storage.endpoint, "S3_ENDPOINT_URL")?;
    require(&cfg.storage.public_base_url, "S3_PUBLIC_LINK")?;
    require(&cfg.synthesis.primary.project_id, "GOOGLE_VERTEX_PROJECT_ID")?;
    require(&cfg.synthesis.primary.location, "GOOGLE_VERTEX_LOCATION")?;

    let credentials = &cfg.synthesis.primary.credentials_path;
    if credentials.as_os_str().is_empty() {
        return Err(AppConfigError::MissingRequired(
            "GOOGLE_APPLICATION_CREDENTIALS",
        ));
    }
    if !credentials.exists() {
        return Err(AppConfigError::MissingCredentialsFile {
            path: credentials.clone(),
        });
    }

    Url::parse(&cfg.storage.public_base_url).map_err(|err| {
        AppConfigError::InvalidPublicBaseUrl {
            url: cfg.storage.public_base_url.clone(),
            reason: err.to_string(),
        }
    })?;

    if cfg.limits.max_reference_images > MAX_REFERENCE_IMAGES_CEILING {
        return Err(invalid_config(format!(
            "MAX_REFERENCE_IMAGES supports at most {MAX_REFERENCE_IMAGES_CEILING}"
        )));
    }

    if cfg.synthesis.output_format.is_empty()
        || !cfg
            .synthesis
            .output_format
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
    {
        return Err(invalid_config(format!(
            "IMAGE_OUTPUT_FORMAT `{}` must be a bare file extension",
            cfg.synthesis.output_format
        )));
    }

    Ok(())
}

fn invalid_config<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(ConfigError::Message(message.into()))
}

fn require(value: &str, var: &'static str) -> Result<(), AppConfigError> {
    debug_assert!(!var.is_empty());
    if value.trim().is_empty() {
        return Err(AppConfigError::MissingRequired(var));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> AppConfig {
        AppConfig {
            server: ServerConfig { port: DEFAULT_PORT },
            vision: VisionConfig {
                api_key: "sk-test".to_string(),
                model: DEFAULT_VISION_MODEL.to_string(),
                base_url: DEFAULT_VISION_BASE_URL.to_string(),
                system_prompt_image_understand: DEFAULT_IMAGE_UNDERSTAND_PROMPT.to_string(),
                system_prompt_prompt_editor: DEFAULT_PROMPT_EDITOR_PROMPT.to_string(),
            },
            synthesis: SynthesisConfig {
                primary: PrimaryImageConfig {
                    project_id: "proj".to_string(),
                    location: "us-central1".to_string(),
                    credentials_path: PathBuf::from("/tmp"),
                    endpoint_override: None,
                },
                fallback: FallbackImageConfig {
                    api_key: None,
                    endpoint: DEFAULT_FALLBACK_ENDPOINT.to_string(),
                    model_id: DEFAULT_FALLBACK_MODEL_ID.to_string(),
                    aspect_ratio: DEFAULT_FALLBACK_ASPECT_RATIO.to_string(),
                },
                output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            },
            storage: StorageConfig {
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
                bucket: "bucket".to_string(),
                endpoint: "https://s3.example.com".to_string(),
                public_base_url: "https://cdn.example.com/".to_string(),
                folder: DEFAULT_STORAGE_FOLDER.to_string(),
            },
            limits: LimitsConfig {
                max_reference_images: DEFAULT_MAX_REFERENCE_IMAGES,
            },
        }
    }

    #[test]
    fn minimal_config_passes_validation() {
        let cfg = minimal_config();
        validate_config(&cfg).expect("complete config must validate");
    }

    #[test]
    fn missing_vision_key_is_fatal() {
        let mut cfg = minimal_config();
        cfg.vision.api_key = String::new();
        let err = validate_config(&cfg).expect_err("empty key must fail");
        assert!(matches!(
            err,
            AppConfigError::MissingRequired("OPENAI_API_KEY")
        ));
    }

    #[test]
    fn missing_fallback_key_is_not_fatal() {
        let mut cfg = minimal_config();
        cfg.synthesis.fallback.api_key = None;
        validate_config(&cfg).expect("fallback credentials are lazy");
    }

    #[test]
    fn missing_credentials_file_is_fatal() {
        let mut cfg = minimal_config();
        cfg.synthesis.primary.credentials_path = PathBuf::from("/nonexistent/creds.json");
        let err = validate_config(&cfg).expect_err("absent file must fail");
        assert!(matches!(
            err,
            AppConfigError::MissingCredentialsFile { .. }
        ));
    }

    #[test]
    fn public_base_url_gains_trailing_slash() {
        let mut cfg = minimal_config();
        cfg.storage.public_base_url = "https://cdn.example.com/assets".to_string();
        normalize_config(&mut cfg).expect("normalization must succeed");
        assert_eq!(cfg.storage.public_base_url, "https://cdn.example.com/assets/");
    }

    #[test]
    fn bad_output_format_is_rejected() {
        let mut cfg = minimal_config();
        cfg.synthesis.output_format = "../png".to_string();
        assert!(validate_config(&cfg).is_err());
    }
}
