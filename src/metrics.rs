use crate::models::JobStatus;
use tracing::trace;

// Trace events stand in for counters; the Prometheus handle only renders
// what an installed recorder has seen.

pub fn inc_requests(route: &'static str) {
    trace!(target = "listro.metrics", route = route, "requests_total_inc");
}

pub fn job_finished(status: JobStatus, results: usize, elapsed_ms: u128) {
    trace!(
        target = "listro.metrics",
        status = status.as_str(),
        results = results as u64,
        elapsed_ms = elapsed_ms as u64,
        "job_finished"
    );
}

pub fn prompt_elapsed(elapsed_ms: u128) {
    trace!(
        target = "listro.metrics",
        elapsed_ms = elapsed_ms as u64,
        "prompt_elapsed"
    );
}
