//! Data-plane subprocess invocation.
//!
//! The data plane dominates wall time, so its output is streamed straight
//! to per-host log files rather than buffered, and exit codes propagate
//! as values. The exact command line is recorded next to the logs for
//! post-mortems.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error};

use crate::errors::NodeError;
use crate::util::backup_if_exists;

/// Runs the data-plane binary once per phase invocation.
pub struct DataPlaneRunner {
    binary: String,
    hostname: String,
}

/// Result of one data-plane run. A failure carries the subprocess's
/// stderr, which becomes the failure-report message.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub success: bool,
    pub error_message: String,
}

impl DataPlaneRunner {
    pub fn new(binary: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            hostname: hostname.into(),
        }
    }

    /// Invoke the binary with `params` flattened to `-KEY value` pairs,
    /// logging stdout/stderr under `log_dir`.
    pub async fn run(
        &self,
        params: &BTreeMap<String, String>,
        log_dir: &Path,
    ) -> Result<PhaseOutcome, NodeError> {
        std::fs::create_dir_all(log_dir)?;

        let args = flatten_params(params);

        let command_line = format!("{} {}", self.binary, args.join(" "));
        std::fs::write(
            log_dir.join(format!("{}.cmd", self.hostname)),
            &command_line,
        )?;
        debug!(command = %command_line, "running data plane");

        let stdout_path = log_dir.join(format!("stdout-{}.log", self.hostname));
        let stderr_path = log_dir.join(format!("stderr-{}.log", self.hostname));
        backup_if_exists(&stdout_path).map_err(std::io::Error::other)?;
        backup_if_exists(&stderr_path).map_err(std::io::Error::other)?;

        let stdout = std::fs::File::create(&stdout_path)?;
        let stderr = std::fs::File::create(&stderr_path)?;

        let status = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .map_err(|source| NodeError::SpawnFailed {
                binary: self.binary.clone(),
                source,
            })?;

        if status.success() {
            return Ok(PhaseOutcome {
                success: true,
                error_message: String::new(),
            });
        }

        error!(
            code = status.code().unwrap_or(-1),
            "data plane exited with non-zero status"
        );

        let error_message = std::fs::read_to_string(&stderr_path).unwrap_or_default();
        Ok(PhaseOutcome {
            success: false,
            error_message,
        })
    }
}

/// Flatten a parameter map into `-KEY value` argument pairs, in key
/// order so the recorded command line is stable.
fn flatten_params(params: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(params.len() * 2);
    for (key, value) in params {
        args.push(format!("-{key}"));
        args.push(value.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn params_flatten_to_dash_key_value_pairs() {
        let args = flatten_params(&params(&[("MYPEERID", "0"), ("BATCH_ID", "3")]));
        assert_eq!(args, vec!["-BATCH_ID", "3", "-MYPEERID", "0"]);
    }

    #[tokio::test]
    async fn successful_run_records_the_command_line() {
        let dir = tempdir().unwrap();
        let runner = DataPlaneRunner::new("true", "node-1.cluster");

        let outcome = runner
            .run(&params(&[("BATCH_ID", "1")]), dir.path())
            .await
            .unwrap();

        assert!(outcome.success);
        let cmd = std::fs::read_to_string(dir.path().join("node-1.cluster.cmd")).unwrap();
        assert_eq!(cmd, "true -BATCH_ID 1");
        assert!(dir.path().join("stdout-node-1.cluster.log").exists());
    }

    #[tokio::test]
    async fn failed_run_reports_without_erroring() {
        let dir = tempdir().unwrap();
        let runner = DataPlaneRunner::new("false", "node-1.cluster");

        let outcome = runner.run(&BTreeMap::new(), dir.path()).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error_message, "");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let runner = DataPlaneRunner::new("/nonexistent/themis-data-plane", "n");

        let err = runner.run(&BTreeMap::new(), dir.path()).await.unwrap_err();
        assert!(matches!(err, NodeError::SpawnFailed { .. }));
    }
}
