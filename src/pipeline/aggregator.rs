use super::{PipelineError, STAGE_RESEARCH, call_inference};
use crate::listing::ingest::{RESEARCH_SCHEMA, research_from_value};
use crate::listing::measurements::dimension_consensus;
use crate::listing::{AggregationRound, GroundingSource, SourceListing, VisualAttributes};
use crate::llm::{InferenceRequest, InferenceService, parse_json_reply};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{debug, info};

const MARKETPLACES: &[&str] = &[
    "Amazon.in",
    "Flipkart.com",
    "Meesho.com",
    "Ajio.com",
    "Myntra.com",
    "Shein.in",
];

const EXTRA_MARKETPLACES: &[&str] = &["Nykaa Fashion", "Tata CLiQ", "Snapdeal", "Etsy"];

/// Produces one [`AggregationRound`] per call. `round_hint` only changes how hard the search
/// is pushed.
#[async_trait]
pub trait SourceAggregation: Send + Sync {
    async fn aggregate(
        &self,
        attrs: &VisualAttributes,
        round_hint: u32,
    ) -> Result<AggregationRound, PipelineError>;
}

pub struct SourceAggregator {
    llm: Arc<dyn InferenceService>,
    timeout: Duration,
    tolerance: f64,
    max_rounds: u32,
}

impl SourceAggregator {
    pub fn new(
        llm: Arc<dyn InferenceService>,
        timeout: Duration,
        tolerance: f64,
        max_rounds: u32,
    ) -> Self {
        Self {
            llm,
            timeout,
            tolerance,
            max_rounds,
        }
    }
}

#[async_trait]
impl SourceAggregation for SourceAggregator {
    /// Search first, then structure. Free-form grounded search and strict JSON output do not
    /// mix reliably in one call, so the search text is reformatted by a second call and never
    /// leaves this function.
    async fn aggregate(
        &self,
        attrs: &VisualAttributes,
        round_hint: u32,
    ) -> Result<AggregationRound, PipelineError> {
        let search = InferenceRequest::text(research_instruction(attrs, round_hint, self.max_rounds))
            .with_web_search();
        let findings = call_inference(self.llm.as_ref(), STAGE_RESEARCH, search, self.timeout).await?;
        if findings.text.trim().is_empty() {
            return Err(PipelineError::inference(STAGE_RESEARCH, "search returned no text"));
        }
        debug!(
            target = "atelier.pipeline",
            round = round_hint,
            chars = findings.text.len(),
            "research_findings"
        );

        let structure = InferenceRequest::text(structuring_instruction(&findings.text))
            .with_schema(RESEARCH_SCHEMA.clone());
        let reply = call_inference(self.llm.as_ref(), STAGE_RESEARCH, structure, self.timeout).await?;
        let value = parse_json_reply(&reply)
            .map_err(|err| PipelineError::inference(STAGE_RESEARCH, err.to_string()))?;
        let research = research_from_value(value)
            .map_err(|err| PipelineError::inference(STAGE_RESEARCH, err.to_string()))?;

        let consensus = dimension_consensus(&research.listings, self.tolerance);
        let provenance = extract_provenance(&findings.text, &research.listings);

        info!(
            target = "atelier.pipeline",
            round = round_hint,
            listings = research.listings.len(),
            dimension_sources = consensus.source_count,
            "aggregation_round"
        );

        Ok(AggregationRound {
            round: round_hint,
            listings: research.listings,
            keywords: research.keywords,
            merged_master: research.merged_master,
            confirmed_dimensions: consensus.confirmed,
            dimension_source_count: consensus.source_count,
            provenance,
        })
    }
}

fn research_instruction(attrs: &VisualAttributes, round_hint: u32, max_rounds: u32) -> String {
    let mut platforms: Vec<&str> = MARKETPLACES.to_vec();
    if round_hint > 1 {
        platforms.extend(EXTRA_MARKETPLACES.iter().take(2 * (round_hint as usize - 1)));
    }
    let mut text = format!(
        "Act as an e-commerce researcher. Search the live web for listings of \"{name}\" \
         (visual signature: {signature}; colours: {colors}) on {platforms}.\n\
         For every listing you find report the platform, title, description, price exactly as \
         displayed, the URL, and any physical dimensions or measurements stated.\n\
         Then list 5-8 trending SEO keywords and write one merged master description combining \
         the best parts of all listings.",
        name = attrs.display_name.trim(),
        signature = attrs.visual_signature.trim(),
        colors = attrs.colors.join(", "),
        platforms = platforms.join(", "),
    );
    if round_hint > 1 {
        text.push_str(&format!(
            "\nThis is research round {round_hint} of {max_rounds}. Earlier rounds did not find at \
             least three independent sources agreeing on the item's dimensions. Search more \
             aggressively: open product detail pages, size charts and seller specifications, and \
             include every stated measurement with its unit."
        ));
    }
    text
}

fn structuring_instruction(findings: &str) -> String {
    format!(
        "Reformat the marketplace research below into JSON with `listings` (platform, title, \
         description, price, url, dimensions), `commonKeywords` and `mergedMaster`. Only use \
         facts present in the research; leave price, url or dimensions out of a listing when the \
         research does not state them.\n\n---\n{findings}\n---"
    )
}

/// URLs cited in the search text plus the listing URLs, first occurrence wins.
fn extract_provenance(findings: &str, listings: &[SourceListing]) -> Vec<GroundingSource> {
    let mut seen = HashSet::new();
    let cited = scan_urls(findings);
    let listed = listings.iter().filter_map(|l| l.url.clone());
    cited
        .into_iter()
        .chain(listed)
        .filter_map(|uri| {
            let parsed = reqwest::Url::parse(&uri).ok()?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return None;
            }
            let title = parsed.host_str()?.trim_start_matches("www.").to_string();
            Some(GroundingSource { uri, title })
        })
        .filter(|source| seen.insert(source.uri.clone()))
        .collect()
}

fn scan_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("http") {
        let candidate = &rest[pos..];
        if candidate.starts_with("http://") || candidate.starts_with("https://") {
            let end = candidate
                .find(|ch: char| ch.is_whitespace() || matches!(ch, ')' | ']' | '>' | '"' | '\''))
                .unwrap_or(candidate.len());
            let url = candidate[..end].trim_end_matches(['.', ',', ';', ':']);
            urls.push(url.to_string());
            rest = &candidate[end..];
        } else {
            rest = &candidate[4..];
        }
    }
    urls
}
