//! Chat-completions client for the vision/text model.
//!
//! Two operations back the prompting stages: reconstructing a prompt from
//! the base image, and rewriting that prompt with user instructions grounded
//! by reference images. Both classify the reply into a [`PromptOutcome`];
//! transport failures stay transport failures and are never folded into a
//! refusal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{PromptOutcome, UploadedImage};

pub const DEFAULT_IMAGE_UNDERSTAND_PROMPT: &str = "\
You are an expert visual analyst for a marketing-image pipeline. You receive a single \
image and must produce a prompt that would let an image-generation model recreate it as \
faithfully as possible.

Describe the scene exhaustively: the subjects and their positions, poses and expressions, \
clothing and props, the setting and background, lighting direction and mood, color palette, \
camera angle and focal length, depth of field, and overall style (photographic, illustrated, \
3D rendered, and so on). Mention any visible text verbatim, including its typography and \
placement.

Write the result as one continuous prompt in plain prose. Do not add commentary, headings, \
or explanations of what you are doing. Output only the prompt itself.";

pub const DEFAULT_PROMPT_EDITOR_PROMPT: &str = "\
You are a prompt editor for a marketing-image pipeline. You receive a base prompt that \
describes an existing image, a set of user instructions, and optionally one or more \
reference images for style or content guidance.

Rewrite the base prompt so that it fully incorporates the user's instructions while \
preserving every detail of the original description that the instructions do not touch. \
When reference images are provided, fold their relevant visual characteristics into the \
rewritten prompt where the instructions call for them.

Keep the rewritten prompt in the same continuous-prose form as the base prompt. Never \
refuse an edit that merely rearranges, restyles, or recolors the described scene.";

/// Appended to the final user fragment of stage-2 requests; pairs with JSON
/// mode on the wire.
const JSON_SHAPE_DIRECTIVE: &str = "\
Respond with a JSON object of the exact shape {\"prompt\": string, \"isPromptGenerated\": boolean}. \
Set isPromptGenerated to true and put the full rewritten prompt in prompt when you produced a \
usable prompt; otherwise set isPromptGenerated to false and explain why in prompt.";

/// Lowercased markers that classify a free-text reply as a refusal.
const REFUSAL_MARKERS: [&str; 5] = [
    "i'm sorry",
    "i can't assist",
    "can't help",
    "cannot",
    "unable to",
];

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("vision model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vision model reply carried no message content")]
    EmptyReply,
}

/// Seam between the orchestrator and the vision/text model, mirroring the
/// two prompting stages.
#[async_trait::async_trait]
pub trait PromptModel: Send + Sync {
    async fn reconstruct_prompt(
        &self,
        image_bytes: &[u8],
        mime: &str,
    ) -> Result<PromptOutcome, VisionError>;

    async fn apply_instructions(
        &self,
        base_prompt: &str,
        instructions: &str,
        references: &[UploadedImage],
    ) -> Result<PromptOutcome, VisionError>;
}

#[derive(Debug, Clone, Builder)]
pub struct VisionClient {
    http: reqwest::Client,
    #[builder(into)]
    api_key: String,
    #[builder(into)]
    model: String,
    /// Base URL up to and excluding `/chat/completions`.
    #[builder(into)]
    base_url: String,
    #[builder(into)]
    system_prompt_image_understand: String,
    #[builder(into)]
    system_prompt_prompt_editor: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Wire shape the stage-2 directive asks the model to emit.
#[derive(Debug, Deserialize)]
struct EditedPromptWire {
    prompt: String,
    #[serde(rename = "isPromptGenerated")]
    is_prompt_generated: bool,
}

impl VisionClient {
    fn data_uri(bytes: &[u8], mime: &str) -> String {
        format!("data:{mime};base64,{}", BASE64_STANDARD.encode(bytes))
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<String, VisionError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Http {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(VisionError::EmptyReply)
    }
}

#[async_trait::async_trait]
impl PromptModel for VisionClient {
    async fn reconstruct_prompt(
        &self,
        image_bytes: &[u8],
        mime: &str,
    ) -> Result<PromptOutcome, VisionError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(self.system_prompt_image_understand.clone()),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: Self::data_uri(image_bytes, mime),
                        },
                    }]),
                },
            ],
            response_format: None,
        };

        let reply = self.send(&request).await?;
        Ok(classify_free_text(&reply))
    }

    async fn apply_instructions(
        &self,
        base_prompt: &str,
        instructions: &str,
        references: &[UploadedImage],
    ) -> Result<PromptOutcome, VisionError> {
        let mut parts = vec![
            ContentPart::Text {
                text: format!("Base prompt:\n{base_prompt}"),
            },
            ContentPart::Text {
                text: format!("User instructions:\n{instructions}"),
            },
        ];
        for (index, reference) in references.iter().enumerate() {
            parts.push(ContentPart::Text {
                text: format!("Reference image #{}", index + 1),
            });
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: Self::data_uri(&reference.bytes, &reference.mime),
                },
            });
        }
        parts.push(ContentPart::Text {
            text: JSON_SHAPE_DIRECTIVE.to_string(),
        });

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(self.system_prompt_prompt_editor.clone()),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(parts),
                },
            ],
            response_format: Some(serde_json::json!({ "type": "json_object" })),
        };

        let reply = self.send(&request).await?;
        Ok(parse_edited_prompt(&reply))
    }
}

/// Classify a free-text reply: refusal markers win, everything else is a
/// generated prompt. Emptiness is judged later by the orchestrator.
pub fn classify_free_text(reply: &str) -> PromptOutcome {
    let trimmed = reply.trim();
    if is_refusal(trimmed) {
        PromptOutcome::refused(trimmed)
    } else {
        PromptOutcome::generated(trimmed)
    }
}

pub fn is_refusal(reply: &str) -> bool {
    let lowered = reply.to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Parse a stage-2 reply: first `{…}` block wins when it matches the
/// expected shape; otherwise fall back to the free-text heuristic.
pub fn parse_edited_prompt(reply: &str) -> PromptOutcome {
    if let Some(block) = first_json_block(reply)
        && let Ok(wire) = serde_json::from_str::<EditedPromptWire>(block)
    {
        return PromptOutcome {
            prompt: wire.prompt.trim().to_string(),
            generated: wire.is_prompt_generated,
        };
    }
    classify_free_text(reply)
}

/// Locate the first balanced `{…}` block, respecting string literals.
fn first_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_markers_classify_refusals() {
        for reply in [
            "I'm sorry, I can't describe this image.",
            "I can't assist with that request.",
            "Unfortunately I am unable to process this content.",
            "This request cannot be completed.",
        ] {
            let outcome = classify_free_text(reply);
            assert!(!outcome.generated, "should refuse: {reply}");
            assert_eq!(outcome.prompt, reply.trim());
        }
    }

    #[test]
    fn plain_prompts_are_generated() {
        let outcome = classify_free_text("  A red bicycle leaning on a brick wall at dusk.  ");
        assert!(outcome.generated);
        assert_eq!(outcome.prompt, "A red bicycle leaning on a brick wall at dusk.");
    }

    #[test]
    fn edited_prompt_parses_structured_reply() {
        let outcome = parse_edited_prompt(
            r#"{"prompt": "  A cat on a windowsill.  ", "isPromptGenerated": true}"#,
        );
        assert!(outcome.generated);
        assert_eq!(outcome.prompt, "A cat on a windowsill.");
    }

    #[test]
    fn edited_prompt_honors_structured_refusal_flag() {
        let outcome = parse_edited_prompt(
            r#"{"prompt": "The requested edit is out of scope.", "isPromptGenerated": false}"#,
        );
        assert!(!outcome.generated);
    }

    #[test]
    fn structured_flag_beats_keyword_false_positive() {
        // "cannot" appears inside a perfectly valid prompt; the JSON flag
        // must win over the keyword heuristic.
        let outcome = parse_edited_prompt(
            r#"{"prompt": "A sign reading 'you cannot park here' on a fence.", "isPromptGenerated": true}"#,
        );
        assert!(outcome.generated);
    }

    #[test]
    fn edited_prompt_falls_back_to_heuristic_on_parse_failure() {
        let refused = parse_edited_prompt("I'm sorry, I can't help with this edit.");
        assert!(!refused.generated);

        let generated = parse_edited_prompt("A plain text reply that is a usable prompt.");
        assert!(generated.generated);
    }

    #[test]
    fn first_json_block_skips_prose_and_braces_in_strings() {
        let text = r#"Here is the result: {"prompt": "curly {brace} inside", "isPromptGenerated": true} trailing"#;
        let block = first_json_block(text).expect("block found");
        let wire: EditedPromptWire = serde_json::from_str(block).expect("parses");
        assert!(wire.is_prompt_generated);
        assert_eq!(wire.prompt, "curly {brace} inside");
    }

    #[test]
    fn data_uri_embeds_mime_and_base64() {
        let uri = VisionClient::data_uri(b"ab", "image/png");
        assert_eq!(uri, "data:image/png;base64,YWI=");
    }
}
