//! External vision-model fallback.
//!
//! Speaks the OpenAI-compatible chat-completions protocol: the image travels as
//! a base64 data URI and the model answers with the code text or `NONE`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use codescan_core::VisionConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::VisionError;

const PROMPT: &str = "Read the barcode or QR code in this image. \
Reply with only the exact encoded text and nothing else. \
If there is no readable code, reply NONE.";

/// Longest error body kept in log messages.
const MAX_ERROR_BODY: usize = 300;

/// Replies longer than this are prose, not a code.
const MAX_CODE_CHARS: usize = 512;

/// Codes may hold a few spaces; a sentence holds more.
const MAX_CODE_WORDS: usize = 3;

/// An image encoded for transport to the vision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl VisionPayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// A network model able to read codes from an image.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means the service answered but saw no code.
    async fn read_code(&self, payload: &VisionPayload) -> Result<Option<String>, VisionError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// reqwest-backed chat-completions client.
pub struct HttpVisionModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpVisionModel {
    pub fn new(config: &VisionConfig) -> Result<Self, VisionError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(VisionError::NotConfigured)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VisionError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn request_body(&self, payload: &VisionPayload) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: payload.data_uri(),
                        },
                    },
                ],
            }],
            max_tokens: 128,
            temperature: 0.0,
        }
    }
}

#[async_trait]
impl VisionModel for HttpVisionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn read_code(&self, payload: &VisionPayload) -> Result<Option<String>, VisionError> {
        tracing::debug!(
            "Sending {} byte {} image to vision model {}",
            payload.bytes.len(),
            payload.mime_type,
            self.model
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(payload))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {}: {}", status, truncate(&body, MAX_ERROR_BODY));
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                VisionError::QuotaExceeded(detail)
            } else {
                VisionError::Unavailable(detail)
            });
        }

        let reply: ChatResponse = response.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| VisionError::InvalidResponse("reply has no message content".into()))?;

        Ok(parse_reply(&content))
    }
}

/// Extract the code text from a model reply.
///
/// `None` for an empty or `NONE` reply, and for anything that reads like an
/// explanation instead of a code: several lines, a sentence or an overlong answer.
pub fn parse_reply(content: &str) -> Option<String> {
    let mut text = content.trim();

    if let Some(inner) = text.strip_prefix("```") {
        // Drop an optional language tag on the opening fence.
        let inner = inner.split_once('\n').map_or(inner, |(_, rest)| rest);
        text = inner.strip_suffix("```").unwrap_or(inner).trim();
    }

    let text = text.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();

    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return None;
    }
    if text.lines().count() > 1
        || text.split_whitespace().count() > MAX_CODE_WORDS
        || text.chars().count() > MAX_CODE_CHARS
    {
        tracing::debug!("Ignoring vision reply that is not a code: {}", truncate(text, 80));
        return None;
    }
    Some(text.to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
