use metrics::{counter, histogram};
use tracing::trace;

pub fn inc_requests(route: &'static str) {
    counter!("sync_requests_total", "route" => route).increment(1);
    trace!(target = "sync.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!("sync_stage_elapsed_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "sync.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn inc_negotiation_rounds(rounds: u32) {
    counter!("sync_negotiation_rounds_total").increment(u64::from(rounds));
}

pub fn inc_failures(stage: &'static str) {
    counter!("sync_failures_total", "stage" => stage).increment(1);
}
