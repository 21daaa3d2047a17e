use tracing::trace;

// Trace-level counters; the Prometheus recorder picks up nothing from these directly.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "atelier.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "atelier.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn consensus_rounds(rounds: u32, reached: bool) {
    trace!(
        target = "atelier.metrics",
        rounds = rounds,
        reached = reached,
        "consensus_rounds"
    );
}
