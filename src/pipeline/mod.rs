pub mod aggregator;
pub mod consensus;
pub mod orchestrator;
pub mod synthesizer;
pub mod verifier;

use crate::http::env_secs;
use crate::listing::ImageAsset;
use crate::llm::{InferenceReply, InferenceRequest, InferenceService, LlmClient, LlmConfig};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub use aggregator::{SourceAggregation, SourceAggregator};
pub use consensus::{ConsensusOutcome, ConsensusResolver};
pub use orchestrator::{Orchestrator, RunSnapshot, RunStage, RunTicket};
pub use synthesizer::ContentSynthesizer;
pub use verifier::ConsistencyVerifier;

pub const STAGE_INPUT: &str = "input";
pub const STAGE_VERIFICATION: &str = "verification";
pub const STAGE_RESEARCH: &str = "research";
pub const STAGE_GENERATION: &str = "generation";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_images: usize,
    pub max_rounds: u32,
    pub corroboration_threshold: u32,
    pub dimension_tolerance: f64,
    pub inference_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            max_rounds: 3,
            corroboration_threshold: 3,
            dimension_tolerance: 0.15,
            inference_timeout: Duration::from_secs(90),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            inference_timeout: Duration::from_secs(env_secs("INFERENCE_TIMEOUT_SECS", 90)),
            ..Self::default()
        }
    }
}

/// The four pipeline components wired to one inference service.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub llm: Arc<dyn InferenceService>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, llm: Arc<dyn InferenceService>) -> Self {
        Self {
            config: Arc::new(config),
            llm,
        }
    }

    pub fn from_env() -> Self {
        let llm = LlmClient::new(LlmConfig::from_env());
        Self::new(PipelineConfig::from_env(), Arc::new(llm))
    }

    pub fn verifier(&self) -> ConsistencyVerifier {
        ConsistencyVerifier::new(self.llm.clone(), self.config.inference_timeout)
    }

    pub fn aggregator(&self) -> SourceAggregator {
        SourceAggregator::new(
            self.llm.clone(),
            self.config.inference_timeout,
            self.config.dimension_tolerance,
            self.config.max_rounds,
        )
    }

    pub fn resolver<A: SourceAggregation>(&self, aggregator: A) -> ConsensusResolver<A> {
        ConsensusResolver::new(
            aggregator,
            self.config.max_rounds,
            self.config.corroboration_threshold,
        )
    }

    pub fn synthesizer(&self) -> ContentSynthesizer {
        ContentSynthesizer::new(self.llm.clone(), self.config.inference_timeout)
    }

    /// Input bound for a verification run. Checked before any inference call.
    pub fn validate_images(&self, images: &[ImageAsset]) -> Result<(), PipelineError> {
        if images.is_empty() {
            return Err(PipelineError::invalid_input(STAGE_INPUT, "no images provided"));
        }
        if images.len() > self.config.max_images {
            return Err(PipelineError::invalid_input(
                STAGE_INPUT,
                format!(
                    "too_many_images: {} submitted, at most {} allowed",
                    images.len(),
                    self.config.max_images
                ),
            ));
        }
        if let Some(empty) = images.iter().find(|image| image.bytes.is_empty()) {
            return Err(PipelineError::invalid_input(
                STAGE_INPUT,
                format!("empty_image: {}", empty.filename),
            ));
        }
        Ok(())
    }
}

/// One inference call with an upper bound on waiting. A timeout is reported exactly like a
/// service error.
pub(crate) async fn call_inference(
    llm: &dyn InferenceService,
    stage: &'static str,
    request: InferenceRequest,
    timeout: Duration,
) -> Result<InferenceReply, PipelineError> {
    match tokio::time::timeout(timeout, llm.infer(request)).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(PipelineError::inference(stage, err.to_string())),
        Err(_) => Err(PipelineError::inference(
            stage,
            format!("inference timed out after {}ms", timeout.as_millis()),
        )),
    }
}

#[derive(Debug, Clone, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Inference,
    Conflict,
    NotFound,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn inference(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Inference)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self::with_kind(stage, "run was cancelled", PipelineErrorKind::Cancelled)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// A stage result plus the summary recorded in the run transcript.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    pub fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedInference;
    use crate::llm::{InferenceError, InferenceRequest};

    fn pipeline() -> Pipeline {
        Pipeline::new(
            PipelineConfig::default(),
            Arc::new(ScriptedInference::ok(vec![])),
        )
    }

    fn image(name: &str) -> ImageAsset {
        ImageAsset::new(vec![0xFF, 0xD8], "image/jpeg", name)
    }

    #[test]
    fn image_bounds_are_enforced() {
        let pipeline = pipeline();
        let err = pipeline.validate_images(&[]).expect_err("empty");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), STAGE_INPUT);

        let six: Vec<_> = (0..6).map(|i| image(&format!("{i}.jpg"))).collect();
        let err = pipeline.validate_images(&six).expect_err("six");
        assert!(err.detail().starts_with("too_many_images"));

        assert!(pipeline.validate_images(&six[..5]).is_ok());

        let blank = ImageAsset::new(vec![], "image/jpeg", "blank.jpg");
        let err = pipeline.validate_images(&[blank]).expect_err("blank");
        assert!(err.detail().contains("blank.jpg"));
    }

    #[tokio::test]
    async fn timeout_is_an_inference_failure() {
        let slow = ScriptedInference::ok(vec!["{}".into()]).with_delay(Duration::from_millis(200));
        let err = call_inference(
            &slow,
            STAGE_RESEARCH,
            InferenceRequest::text("hi"),
            Duration::from_millis(10),
        )
        .await
        .expect_err("timeout");
        assert_eq!(err.kind(), PipelineErrorKind::Inference);
        assert_eq!(err.stage(), STAGE_RESEARCH);
        assert!(err.detail().contains("timed out"));
    }

    #[tokio::test]
    async fn service_error_keeps_stage() {
        let failing = ScriptedInference::new(vec![Err(InferenceError::Http("HTTP 503".into()))]);
        let err = call_inference(
            &failing,
            STAGE_GENERATION,
            InferenceRequest::text("hi"),
            Duration::from_secs(1),
        )
        .await
        .expect_err("503");
        assert_eq!(err.stage(), STAGE_GENERATION);
        assert!(err.to_string().contains("HTTP 503"));
    }
}
