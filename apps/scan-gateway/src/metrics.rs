use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

pub fn record_session_started(active: usize) {
    counter!("scan_gateway_sessions_started_total", 1);
    gauge!("scan_gateway_sessions_active", active as f64);
}

pub fn record_session_finished(active: usize) {
    gauge!("scan_gateway_sessions_active", active as f64);
}

pub fn record_session_completed(exit_code: i32) {
    let outcome = if exit_code == 0 { "passed" } else { "failed" };
    counter!(
        "scan_gateway_sessions_completed_total",
        1,
        "outcome" => outcome
    );
}

pub fn record_session_aborted(reason: &'static str) {
    counter!(
        "scan_gateway_sessions_aborted_total",
        1,
        "reason" => reason
    );
}

pub fn record_payload_received(bytes: u64, elapsed: Duration) {
    counter!("scan_gateway_payload_bytes_total", bytes);
    histogram!(
        "scan_gateway_payload_receive_seconds",
        elapsed.as_secs_f64()
    );
}

pub fn record_layers_extracted(layers: usize, skipped_entries: usize) {
    counter!("scan_gateway_layers_extracted_total", layers as u64);
    if skipped_entries > 0 {
        counter!(
            "scan_gateway_layer_entries_skipped_total",
            skipped_entries as u64
        );
    }
}

pub fn record_scan_duration(elapsed: Duration) {
    histogram!("scan_gateway_scan_duration_seconds", elapsed.as_secs_f64());
}

pub fn record_agent_refresh(result: &'static str) {
    counter!(
        "scan_gateway_agent_refresh_total",
        1,
        "result" => result
    );
}
