use super::{
    Pipeline, PipelineError, PipelineErrorKind, STAGE_GENERATION, STAGE_INPUT, STAGE_RESEARCH,
    STAGE_VERIFICATION, SourceAggregation, SourceAggregator, StageOutcome,
};
use crate::listing::{
    AggregationRound, AttributePatch, DataQualityWarning, FullListing, ImageAsset,
    ListingAttributes, MatchVerdict, VisualAttributes, seed_attributes,
};
use crate::models::StageReport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use serde_with::skip_serializing_none;
use std::{future::Future, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Verifying,
    Mismatched,
    Aggregating,
    Resolving,
    AwaitingUserReview,
    Synthesizing,
    Ready,
    Failed,
}

impl RunStage {
    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RunStage::Verifying | RunStage::Aggregating | RunStage::Resolving | RunStage::Synthesizing
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStage::Idle => "Waiting for photos",
            RunStage::Verifying => "Verifying that all photos show the same item…",
            RunStage::Mismatched => "Some photos show a different item",
            RunStage::Aggregating => "Researching marketplaces…",
            RunStage::Resolving => "Cross-checking marketplace dimensions…",
            RunStage::AwaitingUserReview => "Review the product details",
            RunStage::Synthesizing => "Writing the listing in three tones…",
            RunStage::Ready => "Listing ready",
            RunStage::Failed => "Something went wrong",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub stage: String,
    pub detail: String,
}

/// Everything a client needs to render the current state of a session.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Option<Uuid>,
    pub stage: RunStage,
    pub progress: String,
    pub image_count: usize,
    pub verdict: Option<MatchVerdict>,
    pub visual: Option<VisualAttributes>,
    pub research: Option<AggregationRound>,
    pub research_rounds: u32,
    pub consensus_reached: Option<bool>,
    pub attributes: Option<ListingAttributes>,
    pub listing: Option<FullListing>,
    pub warnings: Vec<DataQualityWarning>,
    pub failure: Option<RunFailure>,
    pub stages: Vec<StageReport>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    fn idle() -> Self {
        Self {
            run_id: None,
            stage: RunStage::Idle,
            progress: RunStage::Idle.label().to_string(),
            image_count: 0,
            verdict: None,
            visual: None,
            research: None,
            research_rounds: 0,
            consensus_reached: None,
            attributes: None,
            listing: None,
            warnings: Vec::new(),
            failure: None,
            stages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn enter(&mut self, stage: RunStage) {
        self.stage = stage;
        self.progress = stage.label().to_string();
    }
}

struct Inner {
    snapshot: RunSnapshot,
    epoch: u64,
    cancel: CancellationToken,
    /// Held only while the run is Mismatched, for pruning.
    last_images: Vec<ImageAsset>,
    master_text: Option<String>,
}

enum Work {
    Verify(Vec<ImageAsset>),
    Synthesize {
        attributes: ListingAttributes,
        master_text: Option<String>,
    },
}

/// Claim on the orchestrator for one unit of background work. Results are applied only while
/// the ticket's epoch is still current.
pub struct RunTicket {
    pub run_id: Uuid,
    epoch: u64,
    token: CancellationToken,
    work: Work,
}

/// Drives one session through verification, research, review and synthesis.
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Pipeline,
    inner: Arc<Mutex<Inner>>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            inner: Arc::new(Mutex::new(Inner {
                snapshot: RunSnapshot::idle(),
                epoch: 0,
                cancel: CancellationToken::new(),
                last_images: Vec::new(),
                master_text: None,
            })),
        }
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.inner.lock().await.snapshot.clone()
    }

    /// Start a fresh run for `images`, cancelling whatever was in flight. Input bounds are
    /// checked here so a rejected submission never reaches the inference service and leaves
    /// the current state untouched.
    pub async fn submit(&self, images: Vec<ImageAsset>) -> Result<RunTicket, PipelineError> {
        self.pipeline.validate_images(&images)?;
        let mut inner = self.inner.lock().await;
        inner.cancel.cancel();
        inner.epoch += 1;
        inner.cancel = CancellationToken::new();

        let run_id = Uuid::new_v4();
        let mut snapshot = RunSnapshot::idle();
        snapshot.run_id = Some(run_id);
        snapshot.image_count = images.len();
        snapshot.enter(RunStage::Verifying);
        inner.snapshot = snapshot;
        inner.last_images.clear();
        inner.master_text = None;

        info!(
            target = "atelier.pipeline",
            run_id = %run_id,
            images = images.len(),
            "run_submitted"
        );
        Ok(RunTicket {
            run_id,
            epoch: inner.epoch,
            token: inner.cancel.clone(),
            work: Work::Verify(images),
        })
    }

    /// Drop the flagged images from the last submission and start over with the rest.
    pub async fn resubmit_without(&self, indices: &[usize]) -> Result<RunTicket, PipelineError> {
        let remaining = {
            let inner = self.inner.lock().await;
            if inner.snapshot.stage != RunStage::Mismatched {
                return Err(PipelineError::conflict(
                    STAGE_INPUT,
                    format!("cannot prune images while {:?}", inner.snapshot.stage),
                ));
            }
            if let Some(bad) = indices.iter().find(|i| **i >= inner.last_images.len()) {
                return Err(PipelineError::invalid_input(
                    STAGE_INPUT,
                    format!(
                        "image index {bad} out of range for {} images",
                        inner.last_images.len()
                    ),
                ));
            }
            inner
                .last_images
                .iter()
                .enumerate()
                .filter(|(i, _)| !indices.contains(i))
                .map(|(_, image)| image.clone())
                .collect::<Vec<_>>()
        };
        self.submit(remaining).await
    }

    /// Apply a user edit to the review form. Only valid once research has finished.
    pub async fn update_attributes(&self, patch: AttributePatch) -> Result<RunSnapshot, PipelineError> {
        let mut inner = self.inner.lock().await;
        let stage = inner.snapshot.stage;
        if !matches!(stage, RunStage::AwaitingUserReview | RunStage::Ready) {
            return Err(PipelineError::conflict(
                STAGE_INPUT,
                format!("attributes are not editable while {stage:?}"),
            ));
        }
        let Some(attributes) = inner.snapshot.attributes.as_mut() else {
            return Err(PipelineError::internal(STAGE_INPUT, "review stage without attributes"));
        };
        attributes.apply(patch);
        inner.snapshot.updated_at = Utc::now();
        Ok(inner.snapshot.clone())
    }

    /// Freeze the current attributes and queue synthesis. Also used to regenerate from Ready.
    pub async fn generate(&self) -> Result<RunTicket, PipelineError> {
        let mut inner = self.inner.lock().await;
        let stage = inner.snapshot.stage;
        if !matches!(stage, RunStage::AwaitingUserReview | RunStage::Ready) {
            return Err(PipelineError::conflict(
                STAGE_GENERATION,
                format!("cannot generate while {stage:?}"),
            ));
        }
        let (Some(run_id), Some(attributes)) =
            (inner.snapshot.run_id, inner.snapshot.attributes.clone())
        else {
            return Err(PipelineError::internal(
                STAGE_GENERATION,
                "review stage without attributes",
            ));
        };
        let missing = attributes.missing_required();
        if !missing.is_empty() {
            return Err(PipelineError::invalid_input(
                STAGE_GENERATION,
                format!("missing attributes: {}", missing.join(", ")),
            ));
        }
        inner.cancel.cancel();
        inner.epoch += 1;
        inner.cancel = CancellationToken::new();
        inner.snapshot.listing = None;
        inner.snapshot.enter(RunStage::Synthesizing);
        inner.snapshot.updated_at = Utc::now();

        Ok(RunTicket {
            run_id,
            epoch: inner.epoch,
            token: inner.cancel.clone(),
            work: Work::Synthesize {
                attributes,
                master_text: inner.master_text.clone(),
            },
        })
    }

    /// Abandon whatever is running and go back to Idle.
    pub async fn cancel(&self) -> RunSnapshot {
        let mut inner = self.inner.lock().await;
        inner.cancel.cancel();
        inner.epoch += 1;
        inner.cancel = CancellationToken::new();
        if let Some(run_id) = inner.snapshot.run_id {
            info!(target = "atelier.pipeline", run_id = %run_id, "run_cancelled");
        }
        inner.snapshot = RunSnapshot::idle();
        inner.last_images.clear();
        inner.master_text = None;
        inner.snapshot.clone()
    }

    /// Run a ticket to completion. Failures land in the snapshot; a superseded ticket exits
    /// without touching state.
    pub async fn execute(&self, ticket: RunTicket) {
        let result = match &ticket.work {
            Work::Verify(images) => self.run_research(&ticket, images).await,
            Work::Synthesize {
                attributes,
                master_text,
            } => {
                self.run_synthesis(&ticket, attributes, master_text.as_deref())
                    .await
            }
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == PipelineErrorKind::Cancelled => {
                debug!(
                    target = "atelier.pipeline",
                    run_id = %ticket.run_id,
                    stage = err.stage(),
                    "superseded_run_discarded"
                );
            }
            Err(err) => {
                warn!(
                    target = "atelier.pipeline",
                    run_id = %ticket.run_id,
                    stage = err.stage(),
                    error = %err,
                    "run_failed"
                );
                self.update(&ticket, |snapshot| {
                    snapshot.enter(RunStage::Failed);
                    snapshot.failure = Some(RunFailure {
                        stage: err.stage().to_string(),
                        detail: err.detail().to_string(),
                    });
                })
                .await;
            }
        }
    }

    async fn run_research(&self, ticket: &RunTicket, images: &[ImageAsset]) -> Result<(), PipelineError> {
        let verifier = self.pipeline.verifier();
        let verdict = self
            .capture_stage(ticket, STAGE_VERIFICATION, verifier.verify(images))
            .await?;

        if !verdict.is_match {
            info!(
                target = "atelier.pipeline",
                run_id = %ticket.run_id,
                mismatched = ?verdict.mismatched_indices,
                "images_mismatched"
            );
            let kept = self
                .update_inner(ticket, |inner| {
                    inner.snapshot.verdict = Some(verdict);
                    inner.snapshot.enter(RunStage::Mismatched);
                    inner.last_images = images.to_vec();
                })
                .await;
            return if kept {
                Ok(())
            } else {
                Err(PipelineError::cancelled(STAGE_VERIFICATION))
            };
        }

        let Some(visual) = verdict.merged_metadata.clone() else {
            return Err(PipelineError::internal(
                STAGE_VERIFICATION,
                "match verdict without attributes",
            ));
        };
        self.apply(ticket, STAGE_VERIFICATION, |snapshot| {
            snapshot.verdict = Some(verdict);
            snapshot.visual = Some(visual.clone());
            snapshot.enter(RunStage::Aggregating);
        })
        .await?;

        let threshold = self.pipeline.config.corroboration_threshold;
        let resolver = self.pipeline.resolver(ProgressAggregator {
            inner: self.pipeline.aggregator(),
            orchestrator: self,
            ticket,
            max_rounds: self.pipeline.config.max_rounds,
        });
        let outcome = self
            .capture_stage(ticket, STAGE_RESEARCH, async {
                let outcome = resolver.resolve(&visual).await?;
                let output = json!({
                    "iterations": outcome.iterations,
                    "reached": outcome.reached,
                    "listings": outcome.round.listings.len(),
                    "confirmed_dimensions": outcome.round.confirmed_dimensions,
                    "dimension_source_count": outcome.round.dimension_source_count,
                });
                Ok(StageOutcome::new(outcome, output))
            })
            .await?;

        let mut warnings = Vec::new();
        if !outcome.reached {
            warnings.push(DataQualityWarning::DimensionsUnconfirmed {
                corroborating_sources: outcome.round.dimension_source_count,
                required_sources: threshold,
                rounds: outcome.iterations,
            });
        }
        if outcome.round.listings.is_empty() {
            warnings.push(DataQualityWarning::NoMarketplaceListings);
        }
        for warning in &warnings {
            warn!(
                target = "atelier.pipeline",
                run_id = %ticket.run_id,
                "{}",
                warning.message()
            );
        }
        let attributes = seed_attributes(&visual, &outcome.round);
        let master_text = Some(outcome.round.merged_master.trim().to_string())
            .filter(|text| !text.is_empty());

        let mut inner = self.inner.lock().await;
        if inner.epoch != ticket.epoch {
            return Err(PipelineError::cancelled(STAGE_RESEARCH));
        }
        inner.master_text = master_text;
        let snapshot = &mut inner.snapshot;
        snapshot.research_rounds = outcome.iterations;
        snapshot.consensus_reached = Some(outcome.reached);
        snapshot.research = Some(outcome.round);
        snapshot.attributes = Some(attributes);
        snapshot.warnings = warnings;
        snapshot.enter(RunStage::AwaitingUserReview);
        snapshot.updated_at = Utc::now();
        Ok(())
    }

    async fn run_synthesis(
        &self,
        ticket: &RunTicket,
        attributes: &ListingAttributes,
        master_text: Option<&str>,
    ) -> Result<(), PipelineError> {
        let synthesizer = self.pipeline.synthesizer();
        let listing = self
            .capture_stage(
                ticket,
                STAGE_GENERATION,
                synthesizer.synthesize(attributes, master_text),
            )
            .await?;
        self.apply(ticket, STAGE_GENERATION, |snapshot| {
            snapshot.listing = Some(listing);
            snapshot.enter(RunStage::Ready);
        })
        .await
    }

    /// Await a stage unless the ticket is cancelled first, and record its transcript entry.
    async fn capture_stage<T, Fut>(
        &self,
        ticket: &RunTicket,
        name: &'static str,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = ticket.token.cancelled() => return Err(PipelineError::cancelled(name)),
            result = fut => result?,
        };
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        let report = StageReport::new(name, elapsed_ms, outcome.output);
        self.apply(ticket, name, |snapshot| snapshot.stages.push(report))
            .await?;
        Ok(outcome.value)
    }

    /// Mutate the snapshot if `ticket` is still current. Returns false for a superseded ticket.
    async fn update<F>(&self, ticket: &RunTicket, change: F) -> bool
    where
        F: FnOnce(&mut RunSnapshot),
    {
        self.update_inner(ticket, |inner| change(&mut inner.snapshot)).await
    }

    async fn update_inner<F>(&self, ticket: &RunTicket, change: F) -> bool
    where
        F: FnOnce(&mut Inner),
    {
        let mut inner = self.inner.lock().await;
        if inner.epoch != ticket.epoch {
            return false;
        }
        change(&mut *inner);
        inner.snapshot.updated_at = Utc::now();
        true
    }

    async fn apply<F>(&self, ticket: &RunTicket, stage: &'static str, change: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut RunSnapshot),
    {
        if self.update(ticket, change).await {
            Ok(())
        } else {
            Err(PipelineError::cancelled(stage))
        }
    }
}

/// Publishes the round number to the snapshot before each research round.
struct ProgressAggregator<'a> {
    inner: SourceAggregator,
    orchestrator: &'a Orchestrator,
    ticket: &'a RunTicket,
    max_rounds: u32,
}

#[async_trait]
impl<'a> SourceAggregation for ProgressAggregator<'a> {
    async fn aggregate(
        &self,
        attrs: &VisualAttributes,
        round_hint: u32,
    ) -> Result<AggregationRound, PipelineError> {
        let max_rounds = self.max_rounds;
        self.orchestrator
            .apply(self.ticket, STAGE_RESEARCH, |snapshot| {
                snapshot.enter(if round_hint > 1 {
                    RunStage::Resolving
                } else {
                    RunStage::Aggregating
                });
                snapshot.research_rounds = round_hint;
                snapshot.progress =
                    format!("Researching marketplaces (round {round_hint} of {max_rounds})…");
            })
            .await?;
        self.inner.aggregate(attrs, round_hint).await
    }
}
