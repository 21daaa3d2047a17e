use super::{PipelineError, STAGE_VERIFICATION, StageOutcome, call_inference};
use crate::listing::ingest::{VERDICT_SCHEMA, verdict_from_value};
use crate::listing::{ImageAsset, MatchVerdict};
use crate::llm::{InferenceRequest, InferenceService, parse_json_reply};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::info;

const VERIFY_INSTRUCTION: &str = r#"
You are checking photos for a single e-commerce listing. The attached images are numbered from 0
in the order given. Decide whether every image shows the exact same physical item. Small
differences in lighting, white balance, angle or background are expected and do not make a
mismatch; a different print, cut, colourway, logo or construction detail does.

Return JSON only:
- isMatch: true when all images show the same item.
- confidence: 0-100.
- reason: one or two sentences a seller can act on.
- mismatchedIndices: 0-based indices of the images that do not belong (empty when matched).
- mergedMetadata (when matched): garmentType, fabricTexture, colors (array), pattern, neckline,
  sleeveStyle, brandClues, suggestedName (SEO title), visualSignature (a compact string of the
  most distinguishing visible features, suitable as a marketplace search query).
"#;

pub struct ConsistencyVerifier {
    llm: Arc<dyn InferenceService>,
    timeout: Duration,
}

impl ConsistencyVerifier {
    pub fn new(llm: Arc<dyn InferenceService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Ask the inference service whether `images` depict one item. The service's `isMatch` is
    /// final; no local threshold is applied to `confidence`.
    pub async fn verify(
        &self,
        images: &[ImageAsset],
    ) -> Result<StageOutcome<MatchVerdict>, PipelineError> {
        let instruction = format!(
            "{}\nNumber of images: {}.",
            VERIFY_INSTRUCTION.trim(),
            images.len()
        );
        let request = InferenceRequest::text(instruction)
            .with_images(images)
            .with_schema(VERDICT_SCHEMA.clone());

        let reply = call_inference(self.llm.as_ref(), STAGE_VERIFICATION, request, self.timeout)
            .await?;
        let value = parse_json_reply(&reply)
            .map_err(|err| PipelineError::inference(STAGE_VERIFICATION, err.to_string()))?;
        let verdict = verdict_from_value(value, images.len())
            .map_err(|err| PipelineError::inference(STAGE_VERIFICATION, err.to_string()))?;

        info!(
            target = "atelier.pipeline",
            images = images.len(),
            is_match = verdict.is_match,
            confidence = verdict.confidence,
            "consistency_verdict"
        );

        let output = json!({
            "images": images.iter().map(|image| &image.filename).collect::<Vec<_>>(),
            "is_match": verdict.is_match,
            "confidence": verdict.confidence,
            "mismatched_indices": verdict.mismatched_indices,
            "display_name": verdict.merged_metadata.as_ref().map(|m| &m.display_name),
        });
        Ok(StageOutcome::new(verdict, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedInference;
    use crate::pipeline::PipelineErrorKind;

    fn images(n: usize) -> Vec<ImageAsset> {
        (0..n)
            .map(|i| ImageAsset::new(vec![i as u8 + 1], "image/jpeg", format!("{i}.jpg")))
            .collect()
    }

    fn verifier(llm: Arc<ScriptedInference>) -> ConsistencyVerifier {
        ConsistencyVerifier::new(llm, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn sends_every_image_with_schema() {
        let llm = Arc::new(ScriptedInference::ok(vec![json!({
            "isMatch": true,
            "confidence": 97,
            "reason": "same garment",
            "mismatchedIndices": [],
            "mergedMetadata": {
                "garmentType": "Saree",
                "colors": ["Maroon"],
                "suggestedName": "Maroon Silk Saree",
                "visualSignature": "maroon silk saree gold zari border"
            }
        })
        .to_string()]));
        let outcome = verifier(llm.clone()).verify(&images(3)).await.expect("verify");
        assert!(outcome.value.is_match);
        assert_eq!(outcome.value.confidence, 97);
        assert_eq!(outcome.output["display_name"], "Maroon Silk Saree");

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].images.len(), 3);
        assert!(requests[0].output_schema.is_some());
        assert!(!requests[0].web_search);
    }

    #[tokio::test]
    async fn unparseable_reply_is_inference_failure() {
        let llm = Arc::new(ScriptedInference::ok(vec!["I think they match".into()]));
        let err = verifier(llm).verify(&images(2)).await.expect_err("prose");
        assert_eq!(err.kind(), PipelineErrorKind::Inference);
        assert_eq!(err.stage(), STAGE_VERIFICATION);
    }

    #[tokio::test]
    async fn mismatch_is_not_an_error() {
        let llm = Arc::new(ScriptedInference::ok(vec![json!({
            "isMatch": false,
            "confidence": 88,
            "reason": "image 2 is a different print",
            "mismatchedIndices": [2]
        })
        .to_string()]));
        let outcome = verifier(llm).verify(&images(4)).await.expect("verdict");
        assert!(!outcome.value.is_match);
        assert_eq!(outcome.value.mismatched_indices, vec![2]);
        assert!(outcome.value.merged_metadata.is_none());
    }
}
