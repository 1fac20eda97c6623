//! Builders for connector protocol lines.

use serde_json::{json, Value};

pub fn record_line(stream: &str, data: Value) -> String {
    json!({
        "type": "RECORD",
        "record": { "stream": stream, "data": data, "emitted_at": 0 },
    })
    .to_string()
}

pub fn state_line(state: Value) -> String {
    json!({ "type": "STATE", "state": state }).to_string()
}

pub fn log_line(level: &str, message: &str) -> String {
    json!({
        "type": "LOG",
        "log": { "level": level, "message": message },
    })
    .to_string()
}

/// A TRACE line of subtype ERROR, which fails the attempt.
pub fn error_trace_line(message: &str) -> String {
    json!({
        "type": "TRACE",
        "trace": {
            "type": "ERROR",
            "emitted_at": 0,
            "error": { "message": message, "failure_type": "system_error" },
        },
    })
    .to_string()
}

pub fn estimate_trace_line(rows: u64) -> String {
    json!({
        "type": "TRACE",
        "trace": {
            "type": "ESTIMATE",
            "emitted_at": 0,
            "estimate": { "row_estimate": rows },
        },
    })
    .to_string()
}

pub fn connection_status_line(status: &str, message: Option<&str>) -> String {
    json!({
        "type": "CONNECTION_STATUS",
        "connectionStatus": { "status": status, "message": message },
    })
    .to_string()
}
