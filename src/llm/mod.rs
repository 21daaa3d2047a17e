mod client;

pub use client::{LlmClient, LlmConfig};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::listing::ImageAsset;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("empty response")]
    Empty,
}

/// Binary attachment forwarded to the inference gateway as a base64 content block.
#[derive(Debug, Clone, Serialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: String,
}

impl From<&ImageAsset> for ImageAttachment {
    fn from(asset: &ImageAsset) -> Self {
        Self {
            mime_type: asset.media_type.clone(),
            data: BASE64.encode(&asset.bytes),
        }
    }
}

/// One call to the inference service.
///
/// `web_search` asks for a search-grounded answer; `output_schema` asks for JSON conforming to
/// the schema. The two are never combined by this crate.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub instruction: String,
    pub images: Vec<ImageAttachment>,
    pub web_search: bool,
    pub output_schema: Option<Value>,
}

impl InferenceRequest {
    pub fn text(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: &[ImageAsset]) -> Self {
        self.images = images.iter().map(ImageAttachment::from).collect();
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

#[derive(Debug, Clone)]
pub struct InferenceReply {
    pub text: String,
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceReply, InferenceError>;
}

/// Parse a schema-constrained reply. Models sometimes wrap JSON in a markdown fence.
pub fn parse_json_reply(reply: &InferenceReply) -> Result<Value, InferenceError> {
    let cleaned = strip_markdown_fence(&reply.text);
    if cleaned.is_empty() {
        return Err(InferenceError::Empty);
    }
    serde_json::from_str(&cleaned).map_err(|err| InferenceError::InvalidResponse(err.to_string()))
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let reply = InferenceReply {
            text: "```json\n{\"isMatch\": true}\n```".into(),
        };
        let value = parse_json_reply(&reply).expect("json");
        assert_eq!(value["isMatch"], Value::Bool(true));
    }

    #[test]
    fn rejects_blank_and_prose() {
        let blank = InferenceReply { text: "  ".into() };
        assert!(matches!(parse_json_reply(&blank), Err(InferenceError::Empty)));
        let prose = InferenceReply {
            text: "Sorry, I cannot help with that.".into(),
        };
        assert!(matches!(
            parse_json_reply(&prose),
            Err(InferenceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn attachment_is_base64() {
        let asset = ImageAsset::new(vec![1, 2, 3], "image/png", "a.png");
        let attachment = ImageAttachment::from(&asset);
        assert_eq!(attachment.data, "AQID");
        assert_eq!(attachment.mime_type, "image/png");
    }
}
