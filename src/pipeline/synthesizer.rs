use super::{PipelineError, STAGE_GENERATION, StageOutcome, call_inference};
use crate::listing::ingest::{LISTING_SCHEMA, full_listing_from_value};
use crate::listing::{FullListing, ListingAttributes, Tone};
use crate::llm::{InferenceRequest, InferenceService, parse_json_reply};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::info;

const TONE_GUIDE: &str = "\
- casual: friendly and conversational, short sentences, speaks to everyday wear.
- professional: precise and factual, leads with fabric, fit and specifications.
- luxurious: evocative and premium, emphasises craft, drape and finish.";

pub struct ContentSynthesizer {
    llm: Arc<dyn InferenceService>,
    timeout: Duration,
}

impl ContentSynthesizer {
    pub fn new(llm: Arc<dyn InferenceService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Write the listing in all three tones from one inference call. Either every tone comes
    /// back complete or the stage fails; partial documents are never returned.
    pub async fn synthesize(
        &self,
        attrs: &ListingAttributes,
        master_text: Option<&str>,
    ) -> Result<StageOutcome<FullListing>, PipelineError> {
        let request = InferenceRequest::text(synthesis_instruction(attrs, master_text))
            .with_schema(LISTING_SCHEMA.clone());
        let reply = call_inference(self.llm.as_ref(), STAGE_GENERATION, request, self.timeout)
            .await?;
        let value = parse_json_reply(&reply)
            .map_err(|err| PipelineError::inference(STAGE_GENERATION, err.to_string()))?;
        let listing = full_listing_from_value(value, attrs)
            .map_err(|err| PipelineError::inference(STAGE_GENERATION, err.to_string()))?;

        info!(
            target = "atelier.pipeline",
            name = %attrs.name,
            with_master = master_text.is_some(),
            "listing_synthesized"
        );

        let output = json!({
            "tones": Tone::ALL
                .iter()
                .map(|tone| json!({
                    "tone": tone.key(),
                    "description_chars": listing.get(*tone).description.chars().count(),
                    "attributes": listing.get(*tone).more_info.len(),
                }))
                .collect::<Vec<_>>(),
        });
        Ok(StageOutcome::new(listing, output))
    }
}

fn synthesis_instruction(attrs: &ListingAttributes, master_text: Option<&str>) -> String {
    let facts = attrs
        .attribute_table()
        .into_iter()
        .map(|(label, value)| format!("- {label}: {value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut text = format!(
        "Write an e-commerce product listing in three tones.\n{TONE_GUIDE}\n\
         For each tone return `description`, `fabricCare`, `shipping` and `moreInfo` (a flat \
         object of any additional product attributes worth showing as a table). Use only the \
         facts below; do not invent measurements or prices.\n\nProduct facts:\n{facts}"
    );
    if let Some(master) = master_text.map(str::trim).filter(|m| !m.is_empty()) {
        text.push_str("\n\nReference description assembled from marketplace listings:\n");
        text.push_str(master);
    }
    text
}
