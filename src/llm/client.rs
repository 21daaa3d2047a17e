use super::{ImageAttachment, InferenceError, InferenceReply, InferenceRequest, InferenceService};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub vision_function: String,
    pub research_function: String,
    pub structured_function: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("INFERENCE_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("INFERENCE_API_KEY").ok(),
            model: std::env::var("INFERENCE_MODEL").ok(),
            vision_function: std::env::var("INFERENCE_VISION_FUNCTION")
                .unwrap_or_else(|_| "listing_vision".into()),
            research_function: std::env::var("INFERENCE_RESEARCH_FUNCTION")
                .unwrap_or_else(|_| "marketplace_research".into()),
            structured_function: std::env::var("INFERENCE_STRUCTURED_FUNCTION")
                .unwrap_or_else(|_| "listing_structured".into()),
        }
    }

    // Search grounding lives in its own gateway function; images need a vision-capable one.
    fn function_for(&self, request: &InferenceRequest) -> &str {
        if request.web_search {
            &self.research_function
        } else if !request.images.is_empty() {
            &self.vision_function
        } else {
            &self.structured_function
        }
    }
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl InferenceService for LlmClient {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceReply, InferenceError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(InferenceError::MissingGateway);
        }

        let function_name = self.config.function_for(&request).to_string();
        let body = GatewayRequest::from_inference(function_name, self.config.model.clone(), request);
        debug!(
            target = "atelier.llm",
            function = %body.function_name,
            images = body.input.messages.first().map(|m| m.content.len().saturating_sub(1)).unwrap_or(0),
            structured = body.output_schema.is_some(),
            "inference_request"
        );

        let mut http_request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            http_request = http_request.header("X-API-Key", key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|err| InferenceError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(InferenceError::Http(format!("HTTP {}", response.status())));
        }

        let payload: GatewayResponse = response
            .json()
            .await
            .map_err(|err| InferenceError::InvalidResponse(err.to_string()))?;

        let text = payload.into_text().ok_or(InferenceError::Empty)?;
        Ok(InferenceReply { text })
    }
}

#[derive(Debug, Serialize)]
struct GatewayRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: GatewayInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<Value>,
}

impl GatewayRequest {
    fn from_inference(
        function_name: String,
        model_name: Option<String>,
        request: InferenceRequest,
    ) -> Self {
        let mut content = vec![ContentBlock::Text {
            text: request.instruction,
        }];
        content.extend(request.images.into_iter().map(ContentBlock::image));
        Self {
            function_name,
            model_name,
            input: GatewayInput {
                messages: vec![GatewayMessage {
                    role: "user",
                    content,
                }],
            },
            output_schema: request.output_schema,
        }
    }
}

#[derive(Debug, Serialize)]
struct GatewayInput {
    messages: Vec<GatewayMessage>,
}

#[derive(Debug, Serialize)]
struct GatewayMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { mime_type: String, data: String },
}

impl ContentBlock {
    fn image(attachment: ImageAttachment) -> Self {
        ContentBlock::Image {
            mime_type: attachment.mime_type,
            data: attachment.data,
        }
    }
}

/// Chat functions answer with `content`, JSON functions with `output`.
#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    content: Vec<ResponseContent>,
    #[serde(default)]
    output: Option<JsonOutput>,
}

impl GatewayResponse {
    fn into_text(self) -> Option<String> {
        if let Some(output) = self.output {
            if let Some(raw) = output.raw.filter(|raw| !raw.trim().is_empty()) {
                return Some(raw);
            }
            if let Some(parsed) = output.parsed.filter(|value| !value.is_null()) {
                return Some(parsed.to_string());
            }
        }
        let text = self
            .content
            .into_iter()
            .filter(|item| item.r#type == "text")
            .filter_map(|item| item.text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonOutput {
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    parsed: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> LlmConfig {
        LlmConfig {
            gateway_url: "http://gateway".into(),
            api_key: None,
            model: None,
            vision_function: "vision".into(),
            research_function: "research".into(),
            structured_function: "structured".into(),
        }
    }

    #[test]
    fn routes_requests_to_gateway_functions() {
        let cfg = config();
        let search = InferenceRequest::text("find it").with_web_search();
        assert_eq!(cfg.function_for(&search), "research");
        let mut vision = InferenceRequest::text("look");
        vision.images.push(ImageAttachment {
            mime_type: "image/jpeg".into(),
            data: "AA==".into(),
        });
        assert_eq!(cfg.function_for(&vision), "vision");
        assert_eq!(cfg.function_for(&InferenceRequest::text("write")), "structured");
    }

    #[test]
    fn request_body_carries_images_and_schema() {
        let mut request = InferenceRequest::text("judge").with_schema(json!({"type": "object"}));
        request.images.push(ImageAttachment {
            mime_type: "image/png".into(),
            data: "AQID".into(),
        });
        let body = GatewayRequest::from_inference("vision".into(), None, request);
        let value = serde_json::to_value(&body).unwrap();
        let content = &value["input"]["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["data"], "AQID");
        assert_eq!(value["output_schema"]["type"], "object");
        assert!(value.get("model_name").is_none());
    }

    #[test]
    fn response_prefers_json_output() {
        let payload: GatewayResponse = serde_json::from_value(json!({
            "output": {"raw": "{\"a\":1}", "parsed": {"a": 1}},
            "content": []
        }))
        .unwrap();
        assert_eq!(payload.into_text().as_deref(), Some("{\"a\":1}"));

        let chat: GatewayResponse = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "hello"}, {"type": "tool_call"}]
        }))
        .unwrap();
        assert_eq!(chat.into_text().as_deref(), Some("hello"));

        let empty: GatewayResponse = serde_json::from_value(json!({"content": []})).unwrap();
        assert!(empty.into_text().is_none());
    }
}
