//! Scheduler counters through the `metrics` facade.
//!
//! Nothing is exported from here; an embedding process that installs a
//! recorder gets the counters, otherwise the calls are no-ops.

use metrics::{counter, describe_counter};
use tracing::debug;

use crate::types::EventKind;

/// Register metric descriptions. Safe to call more than once.
pub fn register_metrics() {
    describe_counter!(
        "aicpu_events_received_total",
        "Events received by the dispatch engine, by kind"
    );
    describe_counter!(
        "aicpu_events_processed_total",
        "Events whose handler completed, by kind"
    );
    describe_counter!(
        "aicpu_events_unknown_total",
        "Events with no registered handler"
    );
    describe_counter!(
        "aicpu_responses_total",
        "Responses sent back to TS, by transport"
    );
    describe_counter!(
        "aicpu_ts_send_failures_total",
        "TS-directed async messages dropped after all retries"
    );
    describe_counter!(
        "aicpu_worker_startup_failures_total",
        "Worker threads that did not reach Running"
    );
    debug!("Scheduler metrics described");
}

pub fn record_event_received(kind: EventKind) {
    counter!("aicpu_events_received_total", "kind" => kind.name()).increment(1);
}

pub fn record_event_processed(kind: EventKind) {
    counter!("aicpu_events_processed_total", "kind" => kind.name()).increment(1);
}

pub fn record_unknown_event() {
    counter!("aicpu_events_unknown_total").increment(1);
}

pub fn record_response(transport: &'static str) {
    counter!("aicpu_responses_total", "transport" => transport).increment(1);
}

pub fn record_ts_send_failure() {
    counter!("aicpu_ts_send_failures_total").increment(1);
}

pub fn record_worker_startup_failure() {
    counter!("aicpu_worker_startup_failures_total").increment(1);
}
