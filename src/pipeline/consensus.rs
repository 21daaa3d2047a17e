use super::{PipelineError, SourceAggregation};
use crate::listing::{AggregationRound, VisualAttributes};
use serde::Serialize;
use tracing::info;

/// Loop bookkeeping for the research retries.
#[derive(Debug, Clone)]
pub struct ConsensusState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub best: Option<AggregationRound>,
    pub reached: bool,
}

impl ConsensusState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 1,
            max_iterations,
            best: None,
            reached: false,
        }
    }

    pub fn should_continue(&self) -> bool {
        !self.reached && self.iteration <= self.max_iterations
    }

    /// The latest round always replaces `best`, even when an earlier one had more support.
    pub fn record(&mut self, round: AggregationRound, threshold: u32) {
        self.reached = round.dimension_source_count >= threshold;
        self.best = Some(round);
        if !self.reached {
            self.iteration += 1;
        }
    }

    pub fn rounds_run(&self) -> u32 {
        if self.reached {
            self.iteration
        } else {
            self.iteration - 1
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusOutcome {
    pub round: AggregationRound,
    pub iterations: u32,
    pub reached: bool,
}

pub struct ConsensusResolver<A> {
    aggregator: A,
    max_rounds: u32,
    threshold: u32,
}

impl<A: SourceAggregation> ConsensusResolver<A> {
    pub fn new(aggregator: A, max_rounds: u32, threshold: u32) -> Self {
        Self {
            aggregator,
            max_rounds: max_rounds.max(1),
            threshold,
        }
    }

    /// Query until enough distinct sources agree on dimensions or the round cap is hit. Hitting
    /// the cap is not an error: the last round comes back with `reached == false`. A failed
    /// round fails the whole resolution.
    pub async fn resolve(&self, attrs: &VisualAttributes) -> Result<ConsensusOutcome, PipelineError> {
        let mut state = ConsensusState::new(self.max_rounds);
        while state.should_continue() {
            let round = self.aggregator.aggregate(attrs, state.iteration).await?;
            state.record(round, self.threshold);
        }

        let iterations = state.rounds_run();
        let reached = state.reached;
        crate::metrics::consensus_rounds(iterations, reached);
        info!(
            target = "atelier.pipeline",
            iterations,
            reached,
            "consensus_resolved"
        );
        match state.best {
            Some(round) => Ok(ConsensusOutcome {
                round,
                iterations,
                reached,
            }),
            None => Err(PipelineError::internal(
                super::STAGE_RESEARCH,
                "consensus loop produced no round",
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::{PipelineErrorKind, STAGE_RESEARCH};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers each round with the next scripted source count; `None` fails that round.
    pub(crate) struct ScriptedAggregator {
        counts: Vec<Option<u32>>,
        pub calls: AtomicU32,
        pub hints: Mutex<Vec<u32>>,
    }

    impl ScriptedAggregator {
        pub(crate) fn new(counts: Vec<Option<u32>>) -> Self {
            Self {
                counts,
                calls: AtomicU32::new(0),
                hints: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceAggregation for ScriptedAggregator {
        async fn aggregate(
            &self,
            _attrs: &VisualAttributes,
            round_hint: u32,
        ) -> Result<AggregationRound, PipelineError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.hints.lock().unwrap().push(round_hint);
            match self.counts.get(idx).copied().flatten() {
                Some(count) => Ok(AggregationRound {
                    round: round_hint,
                    confirmed_dimensions: (count > 0).then(|| format!("{}0 x 40 cm", round_hint)),
                    dimension_source_count: count,
                    ..AggregationRound::default()
                }),
                None => Err(PipelineError::inference(STAGE_RESEARCH, "search failed")),
            }
        }
    }

    fn resolver(counts: Vec<Option<u32>>) -> ConsensusResolver<ScriptedAggregator> {
        ConsensusResolver::new(ScriptedAggregator::new(counts), 3, 3)
    }

    #[tokio::test]
    async fn stops_after_first_round_with_consensus() {
        let resolver = resolver(vec![Some(3), Some(5)]);
        let outcome = resolver.resolve(&VisualAttributes::default()).await.unwrap();
        assert_eq!(resolver.aggregator.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.reached);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.round.round, 1);
    }

    #[tokio::test]
    async fn retries_until_consensus() {
        let resolver = resolver(vec![Some(1), Some(4), Some(6)]);
        let outcome = resolver.resolve(&VisualAttributes::default()).await.unwrap();
        assert_eq!(resolver.aggregator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*resolver.aggregator.hints.lock().unwrap(), vec![1, 2]);
        assert!(outcome.reached);
        assert_eq!(outcome.round.dimension_source_count, 4);
        assert_eq!(outcome.round.confirmed_dimensions.as_deref(), Some("20 x 40 cm"));
    }

    #[tokio::test]
    async fn cap_returns_last_round_not_strongest() {
        let resolver = resolver(vec![Some(2), Some(1), Some(0), Some(9)]);
        let outcome = resolver.resolve(&VisualAttributes::default()).await.unwrap();
        assert_eq!(resolver.aggregator.calls.load(Ordering::SeqCst), 3);
        assert!(!outcome.reached);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.round.round, 3);
        assert_eq!(outcome.round.dimension_source_count, 0);
    }

    #[tokio::test]
    async fn failed_round_fails_resolution() {
        let resolver = resolver(vec![Some(1), None, Some(5)]);
        let err = resolver
            .resolve(&VisualAttributes::default())
            .await
            .expect_err("round 2 fails");
        assert_eq!(err.kind(), PipelineErrorKind::Inference);
        assert_eq!(resolver.aggregator.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn state_counts_rounds() {
        let mut state = ConsensusState::new(3);
        state.record(AggregationRound::default(), 3);
        assert!(state.should_continue());
        assert_eq!(state.rounds_run(), 1);
        state.record(
            AggregationRound {
                dimension_source_count: 3,
                ..AggregationRound::default()
            },
            3,
        );
        assert!(!state.should_continue());
        assert_eq!(state.rounds_run(), 2);
    }
}
