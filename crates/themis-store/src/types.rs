//! Wire types shared between the cluster coordinator, the node
//! coordinators, and the data plane.
//!
//! Everything here serializes to the exact JSON shapes the data plane and
//! the submission tools expect; the store itself only ever sees strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The four phases of a batch execution pipeline.
///
/// Phases zero (sampling) and three (reduce) run once per job; phases one
/// (map/shuffle) and two (network replication) run once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseName {
    Zero,
    One,
    Two,
    Three,
}

impl PhaseName {
    /// All phases in execution order.
    pub const ALL: [PhaseName; 4] = [
        PhaseName::Zero,
        PhaseName::One,
        PhaseName::Two,
        PhaseName::Three,
    ];

    /// The store-key spelling of this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Zero => "phase_zero",
            PhaseName::One => "phase_one",
            PhaseName::Two => "phase_two",
            PhaseName::Three => "phase_three",
        }
    }

    /// Numeric index of this phase (0 through 3).
    pub fn index(&self) -> usize {
        match self {
            PhaseName::Zero => 0,
            PhaseName::One => 1,
            PhaseName::Two => 2,
            PhaseName::Three => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<PhaseName> {
        Self::ALL.get(index).copied()
    }

    /// The phase following this one, if any.
    pub fn next(&self) -> Option<PhaseName> {
        Self::from_index(self.index() + 1)
    }

    /// The data-plane parameter that disables this phase.
    pub fn skip_param(&self) -> &'static str {
        match self {
            PhaseName::Zero => "SKIP_PHASE_ZERO",
            PhaseName::One => "SKIP_PHASE_ONE",
            PhaseName::Two => "SKIP_PHASE_TWO",
            PhaseName::Three => "SKIP_PHASE_THREE",
        }
    }

    /// Whether this phase runs once per job rather than once per batch.
    pub fn is_per_job(&self) -> bool {
        matches!(self, PhaseName::Zero | PhaseName::Three)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job, as stored in the `status` field of
/// `job_info:<id>`. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "In Progress",
            JobStatus::Complete => "Complete",
            JobStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job specification as submitted to the job queue.
///
/// `job_name` is optional on the wire; the submission tool fills it in
/// when absent. The coordinator appends `/job_<id>` to the intermediate
/// and output directories once an id is allocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub input_directory: String,
    pub intermediate_directory: String,
    pub output_directory: String,
    pub map_function: String,
    pub reduce_function: String,
    pub partition_function: String,
    pub job_title: String,
    /// Untyped parameter map passed through to the data plane. The
    /// control plane only interprets the keys it recognizes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
    /// Id of a previously failed job this job is recovering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovering: Option<u64>,
    /// Cap on input files taken from each disk, for test harnesses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_files_per_disk: Option<usize>,
}

impl JobSpec {
    /// Look up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// The effective skip flag for a phase, or `None` when the spec does
    /// not override the cluster config.
    pub fn skip_override(&self, phase: PhaseName) -> Option<bool> {
        self.param(phase.skip_param()).map(param_truthy)
    }
}

/// Truthiness of an untyped parameter value: `0`, `false`, `""`, and
/// `null` are false, everything else is true.
pub fn param_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty() && s != "0" && s != "false",
        _ => true,
    }
}

/// Render an untyped parameter value the way the store and the
/// data-plane command line expect: bare strings stay bare, everything
/// else uses its JSON rendering.
pub fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => {
            if *b {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        other => other.to_string(),
    }
}

/// One record in a per-(node, worker) read-request queue.
///
/// Wire format is `{"type":0,...}` for a read and `{"type":1,...}` for a
/// halt marker, matching what the data plane consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawReadRequest", into = "RawReadRequest")]
pub enum ReadRequest {
    /// Read `length` bytes of `path` at `offset` on behalf of `job_ids`.
    Read {
        job_ids: Vec<u64>,
        path: String,
        offset: u64,
        length: u64,
    },
    /// Terminate the current phase's read stream for `job_ids`.
    Halt { job_ids: Vec<u64> },
}

impl ReadRequest {
    pub fn job_ids(&self) -> &[u64] {
        match self {
            ReadRequest::Read { job_ids, .. } | ReadRequest::Halt { job_ids } => job_ids,
        }
    }

    /// Human-readable one-line rendering for queue inspection.
    pub fn describe(&self) -> String {
        let ids = |job_ids: &[u64]| {
            job_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        match self {
            ReadRequest::Read {
                job_ids,
                path,
                offset,
                length,
            } => format!(
                "Read {} for job(s) {} ({}B @ offset {})",
                path,
                ids(job_ids),
                length,
                offset
            ),
            ReadRequest::Halt { job_ids } => format!("Halt job(s) {}", ids(job_ids)),
        }
    }
}

/// On-the-wire shape of a read request. The `type` discriminant is
/// numeric, which serde's enum tagging cannot express directly.
#[derive(Serialize, Deserialize)]
struct RawReadRequest {
    #[serde(rename = "type")]
    kind: u8,
    job_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
}

impl TryFrom<RawReadRequest> for ReadRequest {
    type Error = String;

    fn try_from(raw: RawReadRequest) -> Result<Self, Self::Error> {
        match raw.kind {
            0 => Ok(ReadRequest::Read {
                job_ids: raw.job_ids,
                path: raw.path.ok_or("read request missing path")?,
                offset: raw.offset.ok_or("read request missing offset")?,
                length: raw.length.ok_or("read request missing length")?,
            }),
            1 => Ok(ReadRequest::Halt {
                job_ids: raw.job_ids,
            }),
            other => Err(format!("unknown read request type {other}")),
        }
    }
}

impl From<ReadRequest> for RawReadRequest {
    fn from(request: ReadRequest) -> Self {
        match request {
            ReadRequest::Read {
                job_ids,
                path,
                offset,
                length,
            } => RawReadRequest {
                kind: 0,
                job_ids,
                path: Some(path),
                offset: Some(offset),
                length: Some(length),
            },
            ReadRequest::Halt { job_ids } => RawReadRequest {
                kind: 1,
                job_ids,
                path: None,
                offset: None,
                length: None,
            },
        }
    }
}

/// A failure report pushed onto `node_failure_reports` by a node
/// coordinator, or synthesized by the cluster coordinator when a
/// keepalive expires (`message == "internal_report"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub hostname: String,
    pub batch_id: u64,
    pub message: String,
    #[serde(default)]
    pub disk: Option<String>,
}

impl FailureReport {
    /// The message used for reports synthesized on keepalive expiry.
    pub const INTERNAL: &'static str = "internal_report";

    pub fn new(hostname: impl Into<String>, batch_id: u64, message: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            batch_id,
            message: message.into(),
            disk: None,
        }
    }

    pub fn with_disk(mut self, disk: impl Into<String>) -> Self {
        self.disk = Some(disk.into());
        self
    }

    pub fn is_internal(&self) -> bool {
        self.message == Self::INTERNAL
    }
}

/// Recovery back-reference stored in `recovery_info:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub recovering_job: u64,
}

/// The phase-zero artifact mapping every (node, disk) to the number of
/// logical partitions it owns.
///
/// The ordered node list is stored under a sentinel key so the file
/// remains a flat JSON object keyed by node IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalDiskCounts {
    #[serde(rename = "::ordered_node_list::")]
    pub ordered_node_list: Vec<String>,
    #[serde(flatten)]
    pub disk_counts: BTreeMap<String, Vec<u64>>,
}

impl LogicalDiskCounts {
    /// Per-disk partition counts for a node, empty when unknown.
    pub fn counts_for(&self, node_ip: &str) -> &[u64] {
        self.disk_counts
            .get(node_ip)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_wire_format_uses_numeric_type_tag() {
        let read = ReadRequest::Read {
            job_ids: vec![1, 2],
            path: "local://h1/a/data/f".to_string(),
            offset: 200,
            length: 100,
        };

        let json = serde_json::to_value(&read).unwrap();
        assert_eq!(json["type"], 0);
        assert_eq!(json["job_ids"], serde_json::json!([1, 2]));
        assert_eq!(json["offset"], 200);

        let halt = ReadRequest::Halt { job_ids: vec![3] };
        let json = serde_json::to_value(&halt).unwrap();
        assert_eq!(json["type"], 1);
        assert!(json.get("path").is_none());
    }

    #[test]
    fn read_request_rejects_unknown_type() {
        let err = serde_json::from_str::<ReadRequest>(r#"{"type":7,"job_ids":[]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn read_request_describe_is_one_line() {
        let read = ReadRequest::Read {
            job_ids: vec![4],
            path: "local://h1/a/f".to_string(),
            offset: 0,
            length: 1024,
        };
        assert_eq!(read.describe(), "Read local://h1/a/f for job(s) 4 (1024B @ offset 0)");

        let halt = ReadRequest::Halt { job_ids: vec![1, 2] };
        assert_eq!(halt.describe(), "Halt job(s) 1,2");
    }

    #[test]
    fn job_spec_skip_override_prefers_param_value() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "input_directory": "local:///in",
            "intermediate_directory": "local:///int",
            "output_directory": "local:///out",
            "map_function": "m",
            "reduce_function": "r",
            "partition_function": "p",
            "job_title": "t",
            "params": { "SKIP_PHASE_ONE": 1, "SKIP_PHASE_TWO": 0 }
        }))
        .unwrap();

        assert_eq!(spec.skip_override(PhaseName::One), Some(true));
        assert_eq!(spec.skip_override(PhaseName::Two), Some(false));
        assert_eq!(spec.skip_override(PhaseName::Zero), None);
    }

    #[test]
    fn param_truthiness_matches_wire_conventions() {
        assert!(!param_truthy(&serde_json::json!(0)));
        assert!(!param_truthy(&serde_json::json!(false)));
        assert!(!param_truthy(&serde_json::json!("")));
        assert!(!param_truthy(&serde_json::Value::Null));
        assert!(param_truthy(&serde_json::json!(1)));
        assert!(param_truthy(&serde_json::json!("yes")));
    }

    #[test]
    fn logical_disk_counts_round_trips_sentinel_key() {
        let json = r#"{
            "::ordered_node_list::": ["10.0.0.1", "10.0.0.2"],
            "10.0.0.1": [4, 4],
            "10.0.0.2": [3]
        }"#;

        let counts: LogicalDiskCounts = serde_json::from_str(json).unwrap();
        assert_eq!(counts.ordered_node_list, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(counts.counts_for("10.0.0.2"), &[3]);
        assert_eq!(counts.counts_for("10.0.0.9"), &[] as &[u64]);

        let rendered = serde_json::to_value(&counts).unwrap();
        assert!(rendered.get("::ordered_node_list::").is_some());
    }

    #[test]
    fn phase_name_ordering_and_skip_params() {
        assert_eq!(PhaseName::Zero.next(), Some(PhaseName::One));
        assert_eq!(PhaseName::Three.next(), None);
        assert_eq!(PhaseName::Two.skip_param(), "SKIP_PHASE_TWO");
        assert!(PhaseName::Zero.is_per_job());
        assert!(!PhaseName::One.is_per_job());
    }
}
