//! Typed error hierarchy for the Themis control plane.
//!
//! Four top-level enums cover the four subsystems:
//! - `DiscoveryError` — input-file enumeration failures
//! - `PlannerError` — read-request planning failures
//! - `ClusterError` — cluster coordinator failures
//! - `NodeError` — node coordinator failures
//!
//! Per the failure design, none of these ever cross a process boundary:
//! they end up in `job_info.fail_message`, `failed_batches`, or the
//! failure-report queue.

use thiserror::Error;

use themis_store::StoreError;

/// Errors from input discovery (listing a job's input files).
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to run listing command on {host}: {source}")]
    ListingSpawnFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listing command on {host} exited with status {status}")]
    ListingCommandFailed { host: String, status: i32 },

    #[error("Input directory '{directory}' doesn't exist on all of host {host}'s input disks")]
    MissingDirectory { host: String, directory: String },

    #[error("Failed to parse file listing from {host}: {source}")]
    BadListing {
        host: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown protocol '{scheme}' for input URL '{url}'")]
    UnknownScheme { scheme: String, url: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from read-request planning.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("Cannot have a sample rate greater than 1. Got {0}")]
    SampleRateTooLarge(f64),

    #[error("Cannot sample {points} points per file without a fixed tuple length")]
    MultiPointWithoutTupleOffset { points: usize },

    #[error(
        "Sample window for '{path}' rounds to zero bytes; raise SAMPLE_RATE or lower SAMPLES_PER_FILE"
    )]
    ZeroLengthSample { path: String },
}

/// Errors from the cluster coordinator.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start node coordinator on {host}: {source}")]
    NodeSpawnFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Node {host} all-cluster ping failed; unreachable nodes: {unreachable:?}")]
    UnreachableNodes {
        host: String,
        unreachable: Vec<String>,
    },

    #[error("No live nodes remain")]
    NoLiveNodes,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the node coordinator.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Can't find my hostname ({hostname}) in the list of valid nodes")]
    NotInLiveSet { hostname: String },

    #[error(
        "All nodes should have the same number of intermediate disks, but counts are {counts:?}"
    )]
    InconsistentDiskCounts { counts: Vec<usize> },

    #[error("Host {hostname} has no usable intermediate disks")]
    NoIntermediateDisks { hostname: String },

    #[error("Failed to spawn data plane binary '{binary}': {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_missing_directory_names_the_path() {
        let err = DiscoveryError::MissingDirectory {
            host: "node-1.cluster".to_string(),
            directory: "/data/in".to_string(),
        };
        assert!(err.to_string().contains("/data/in"));
        assert!(err.to_string().contains("node-1.cluster"));
    }

    #[test]
    fn planner_errors_are_matchable() {
        let err = PlannerError::MultiPointWithoutTupleOffset { points: 4 };
        assert!(matches!(
            err,
            PlannerError::MultiPointWithoutTupleOffset { points: 4 }
        ));

        let err = PlannerError::SampleRateTooLarge(1.5);
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn node_error_converts_from_store_error() {
        let store_err = StoreError::JobExists(7);
        let node_err: NodeError = store_err.into();
        assert!(matches!(
            node_err,
            NodeError::Store(StoreError::JobExists(7))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlannerError::SampleRateTooLarge(2.0));
        assert_std_error(&ClusterError::NoLiveNodes);
        assert_std_error(&NodeError::NotInLiveSet {
            hostname: "x".into(),
        });
    }
}
