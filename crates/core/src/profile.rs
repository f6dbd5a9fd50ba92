//! Per-operator timings from the runtime's JSON trace.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Timing of one executed operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileRecord {
    pub op_index: usize,
    pub op_kind: String,
    pub elapsed_us: u64,
}

#[derive(Debug, Deserialize)]
struct TraceEvent {
    #[serde(default)]
    cat: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    dur: u64,
    #[serde(default)]
    args: TraceArgs,
}

#[derive(Debug, Default, Deserialize)]
struct TraceArgs {
    #[serde(default)]
    op_name: Option<String>,
    #[serde(default)]
    node_index: Option<String>,
}

const KERNEL_SUFFIX: &str = "_kernel_time";

/// Extract operator kernel timings from a Chrome-trace JSON document.
///
/// Events without a numeric `node_index` are numbered in trace order after
/// the highest index seen.
pub fn parse_profile(json: &str) -> serde_json::Result<Vec<ProfileRecord>> {
    let events: Vec<TraceEvent> = serde_json::from_str(json)?;

    let mut records = Vec::new();
    let mut unindexed = Vec::new();
    for event in events {
        if event.cat != "Node" || !event.name.ends_with(KERNEL_SUFFIX) {
            continue;
        }
        let op_kind = event
            .args
            .op_name
            .unwrap_or_else(|| event.name.trim_end_matches(KERNEL_SUFFIX).to_string());
        match event.args.node_index.and_then(|i| i.parse::<usize>().ok()) {
            Some(op_index) => records.push(ProfileRecord {
                op_index,
                op_kind,
                elapsed_us: event.dur,
            }),
            None => unindexed.push((op_kind, event.dur)),
        }
    }

    let mut next = records.iter().map(|r| r.op_index + 1).max().unwrap_or(0);
    for (op_kind, elapsed_us) in unindexed {
        records.push(ProfileRecord {
            op_index: next,
            op_kind,
            elapsed_us,
        });
        next += 1;
    }

    Ok(records)
}

/// Log the operator timings in `trace` and delete the file.
pub fn report_profile(trace: &Path) -> Vec<ProfileRecord> {
    let records = match std::fs::read_to_string(trace)
        .map_err(|e| e.to_string())
        .and_then(|json| parse_profile(&json).map_err(|e| e.to_string()))
    {
        Ok(records) => records,
        Err(error) => {
            warn!(trace = %trace.display(), %error, "Failed to read profiling trace");
            return Vec::new();
        }
    };

    for record in &records {
        info!(
            op_index = record.op_index,
            op_kind = %record.op_kind,
            elapsed_us = record.elapsed_us,
            "Operator timing"
        );
    }

    if let Err(error) = std::fs::remove_file(trace) {
        warn!(trace = %trace.display(), %error, "Failed to remove profiling trace");
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r#"[
        {"cat":"Session","name":"model_loading_uri","dur":1200,"args":{}},
        {"cat":"Node","name":"conv1_fence_before","dur":0,"args":{"op_name":"Conv"}},
        {"cat":"Node","name":"conv1_kernel_time","dur":310,"args":{"op_name":"Conv","node_index":"0"}},
        {"cat":"Node","name":"relu1_kernel_time","dur":12,"args":{"op_name":"Relu","node_index":"1"}},
        {"cat":"Node","name":"fc_kernel_time","dur":45,"args":{"op_name":"Gemm"}}
    ]"#;

    #[test]
    fn parses_kernel_events_only() {
        let records = parse_profile(TRACE).unwrap();
        assert_eq!(
            records,
            vec![
                ProfileRecord {
                    op_index: 0,
                    op_kind: "Conv".into(),
                    elapsed_us: 310
                },
                ProfileRecord {
                    op_index: 1,
                    op_kind: "Relu".into(),
                    elapsed_us: 12
                },
                ProfileRecord {
                    op_index: 2,
                    op_kind: "Gemm".into(),
                    elapsed_us: 45
                },
            ]
        );
    }

    #[test]
    fn empty_trace_has_no_records() {
        assert!(parse_profile("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_trace_is_an_error() {
        assert!(parse_profile("{not json").is_err());
    }

    #[test]
    fn report_removes_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        std::fs::write(&path, TRACE).unwrap();

        let records = report_profile(&path);
        assert_eq!(records.len(), 3);
        assert!(!path.exists());
    }

    #[test]
    fn report_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(report_profile(&dir.path().join("missing.json")).is_empty());
    }
}
