//! The staged request flow: upload inputs, reconstruct a prompt, optionally
//! apply instructions, synthesize, upload the output.
//!
//! Every failure short-circuits and returns whatever partial state has
//! accumulated; artifacts already uploaded stay referenced in the response
//! so clients can inspect or retry. The only locally recovered condition is
//! skipping stage 2 when no instructions were given.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::pipeline::{PipelineRequest, PipelineResponse};
use crate::services::blob_store::{BlobStore, KeyPrefix};
use crate::services::synthesis::ImageModel;
use crate::services::vision::PromptModel;

/// Prompts shorter than this (after trimming) are unusable.
const MIN_PROMPT_CHARS: usize = 3;

/// How a pipeline run terminated; the server maps this onto an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// All stages ran; the response carries the output image.
    Completed,
    /// A model refused, replied unusably, or failed; 502 with partial state.
    UpstreamRejected,
    /// The blob store failed; 500 with partial state.
    StorageFailed,
}

#[derive(Debug)]
pub struct FlowOutcome {
    pub status: FlowStatus,
    pub response: PipelineResponse,
}

impl FlowOutcome {
    fn rejected(response: PipelineResponse) -> Self {
        Self {
            status: FlowStatus::UpstreamRejected,
            response,
        }
    }
}

pub struct Orchestrator {
    blob_store: Arc<dyn BlobStore>,
    prompt_model: Arc<dyn PromptModel>,
    image_model: Arc<dyn ImageModel>,
    output_format: String,
}

impl Orchestrator {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        prompt_model: Arc<dyn PromptModel>,
        image_model: Arc<dyn ImageModel>,
        output_format: impl Into<String>,
    ) -> Self {
        Self {
            blob_store,
            prompt_model,
            image_model,
            output_format: output_format.into(),
        }
    }

    pub async fn run(&self, request: PipelineRequest) -> FlowOutcome {
        let mut response = PipelineResponse::default();

        // Upload inputs: base first, then references concurrently.
        let base = match self
            .blob_store
            .upload(
                request.base_image.bytes.clone(),
                &request.base_image.mime,
                KeyPrefix::Inputs,
                None,
            )
            .await
        {
            Ok(asset) => asset,
            Err(err) => {
                tracing::error!(%err, "base image upload failed");
                response.error = Some(format!("failed to store base image: {err}"));
                return FlowOutcome {
                    status: FlowStatus::StorageFailed,
                    response,
                };
            }
        };
        response.base_image_url = Some(base.url);
        response.base_image_key = Some(base.key);

        let reference_uploads = request.reference_images.iter().map(|image| {
            self.blob_store
                .upload(image.bytes.clone(), &image.mime, KeyPrefix::Inputs, None)
        });
        let references = match try_join_all(reference_uploads).await {
            Ok(assets) => assets,
            Err(err) => {
                tracing::error!(%err, "reference image upload failed");
                response.error = Some(format!("failed to store reference image: {err}"));
                return FlowOutcome {
                    status: FlowStatus::StorageFailed,
                    response,
                };
            }
        };
        for asset in references {
            response.reference_image_urls.push(asset.url);
            response.reference_image_keys.push(asset.key);
        }

        // Stage 1: reconstruct a prompt from the base image.
        let outcome = match self
            .prompt_model
            .reconstruct_prompt(&request.base_image.bytes, &request.base_image.mime)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(%err, "prompt reconstruction failed");
                response.error = Some(format!("prompt reconstruction failed: {err}"));
                return FlowOutcome::rejected(response);
            }
        };
        if !outcome.generated {
            response.prompt1 = Some(outcome.prompt);
            response.error =
                Some("the vision model declined to describe the base image".to_string());
            return FlowOutcome::rejected(response);
        }
        let prompt1 = outcome.prompt.trim().to_string();
        if prompt1.chars().count() < MIN_PROMPT_CHARS {
            response.prompt1 = Some(outcome.prompt);
            response.error =
                Some("the vision model returned an invalid prompt for the base image".to_string());
            return FlowOutcome::rejected(response);
        }
        response.prompt1 = Some(prompt1.clone());
        tracing::debug!(chars = prompt1.len(), "stage 1 prompt reconstructed");

        // Stage 2: apply instructions when present, otherwise pass through.
        let prompt2 = match request.user_instructions.as_deref() {
            None => prompt1.clone(),
            Some(instructions) => {
                response.step2_executed = true;
                let outcome = match self
                    .prompt_model
                    .apply_instructions(&prompt1, instructions, &request.reference_images)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::warn!(%err, "prompt edit failed");
                        response.error = Some(format!("prompt edit failed: {err}"));
                        return FlowOutcome::rejected(response);
                    }
                };
                if !outcome.generated {
                    response.prompt2 = Some(outcome.prompt);
                    response.error =
                        Some("the vision model declined to apply the instructions".to_string());
                    return FlowOutcome::rejected(response);
                }
                let trimmed = outcome.prompt.trim().to_string();
                if trimmed.chars().count() < MIN_PROMPT_CHARS {
                    response.prompt2 = Some(outcome.prompt);
                    response.error = Some(
                        "the vision model returned an invalid prompt for the edit".to_string(),
                    );
                    return FlowOutcome::rejected(response);
                }
                trimmed
            }
        };
        response.prompt2 = Some(prompt2.clone());

        // Stage 3: synthesize. Provider fallback lives inside the client.
        let image = match self
            .image_model
            .generate(&prompt2, Some(request.aspect_ratio))
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "image synthesis failed");
                response.error = Some(format!("image synthesis failed: {err}"));
                return FlowOutcome::rejected(response);
            }
        };

        // Upload the output under the configured format.
        let output_mime = format!("image/{}", self.output_format);
        let output = match self
            .blob_store
            .upload(
                image,
                &output_mime,
                KeyPrefix::Outputs,
                Some(&self.output_format),
            )
            .await
        {
            Ok(asset) => asset,
            Err(err) => {
                tracing::error!(%err, "output image upload failed");
                response.error = Some(format!("failed to store generated image: {err}"));
                return FlowOutcome {
                    status: FlowStatus::StorageFailed,
                    response,
                };
            }
        };
        response.output_image_url = Some(output.url);
        response.output_image_key = Some(output.key);
        response.prompt_generated = true;

        FlowOutcome {
            status: FlowStatus::Completed,
            response,
        }
    }
}
