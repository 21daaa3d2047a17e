use crate::listing::{ImageAsset, ListingAttributes, VisualAttributes};
use crate::pipeline::{PipelineError, RunStage, STAGE_INPUT};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One photo sent inline as base64. A `data:` URL prefix is accepted and overrides
/// `media_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageUpload {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    pub data: String,
}

fn default_media_type() -> String {
    "image/jpeg".to_string()
}

impl ImageUpload {
    pub fn into_asset(self, index: usize) -> Result<ImageAsset, PipelineError> {
        let (media_type, payload) = match self.data.strip_prefix("data:") {
            Some(rest) => {
                let (meta, payload) = rest.split_once(',').ok_or_else(|| {
                    PipelineError::invalid_input(STAGE_INPUT, format!("image {index}: malformed data url"))
                })?;
                let media = meta.trim_end_matches(";base64").to_string();
                (media, payload.to_string())
            }
            None => (self.media_type, self.data),
        };
        if !media_type.starts_with("image/") {
            return Err(PipelineError::invalid_input(
                STAGE_INPUT,
                format!("image {index}: unsupported media type {media_type}"),
            ));
        }
        let cleaned: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        let bytes = BASE64.decode(cleaned.as_bytes()).map_err(|err| {
            PipelineError::invalid_input(STAGE_INPUT, format!("image {index}: invalid base64: {err}"))
        })?;
        let filename = self
            .filename
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("image-{index}"));
        Ok(ImageAsset::new(bytes, media_type, filename))
    }
}

#[derive(Debug, Deserialize)]
pub struct ImagesRequest {
    pub images: Vec<ImageUpload>,
}

impl ImagesRequest {
    pub fn into_assets(self) -> Result<Vec<ImageAsset>, PipelineError> {
        self.images
            .into_iter()
            .enumerate()
            .map(|(index, upload)| upload.into_asset(index))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    pub indices: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub session_id: String,
    pub run_id: String,
    pub stage: RunStage,
}

#[derive(Debug, Deserialize)]
pub struct ResearchStageRequest {
    pub attributes: VisualAttributes,
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeStageRequest {
    pub attributes: ListingAttributes,
    #[serde(default)]
    pub master_text: Option<String>,
}

/// Result of a single stage invoked outside a session.
#[derive(Debug, Serialize)]
pub struct StageResponse<T> {
    pub result: T,
    pub report: StageReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineErrorKind;

    fn upload(data: &str) -> ImageUpload {
        ImageUpload {
            filename: None,
            media_type: default_media_type(),
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_plain_and_data_url_uploads() {
        let asset = upload("AQID").into_asset(0).expect("plain");
        assert_eq!(asset.bytes, vec![1, 2, 3]);
        assert_eq!(asset.media_type, "image/jpeg");
        assert_eq!(asset.filename, "image-0");

        let asset = upload("data:image/png;base64,AQ ID").into_asset(1).expect("data url");
        assert_eq!(asset.bytes, vec![1, 2, 3]);
        assert_eq!(asset.media_type, "image/png");
    }

    #[test]
    fn rejects_non_images_and_bad_base64() {
        let err = upload("data:application/pdf;base64,AQID").into_asset(0).expect_err("pdf");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        let err = upload("@@@").into_asset(2).expect_err("base64");
        assert!(err.detail().starts_with("image 2"));
    }
}
