//! Batch-completion artifacts.
//!
//! When a batch finalizes, each of its jobs gets a machine-readable
//! `job_info_<id>.json` dump plus a human-readable `results.job_<id>`
//! summary in the batch log directory, alongside captures of the
//! machine's `/proc/cpuinfo` and `uname -a` for later analysis.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::process::Command;
use tracing::warn;

/// Throughput and timing summary for one completed job.
#[derive(Debug, Clone, Copy)]
pub struct JobSummary {
    pub runtime: f64,
    pub mbps: f64,
    pub mbps_per_node: f64,
    pub tbpm: f64,
    /// Elapsed seconds per phase, zero through three.
    pub phase_seconds: [f64; 4],
}

/// Render the pretty-printed results file.
pub fn format_results(summary: &JobSummary) -> String {
    format!(
        "Total time: {:.2} seconds\nPhase zero: {:.2} seconds\n\
         Phase one:  {:.2} seconds\nPhase two:  {:.2} seconds\n\
         Phase three {:.2} seconds\n\n\
         Throughput: {:.2} MB/s ({:.2} TB/min)\n\
         Per-Server: {:.2} MB/s/node",
        summary.runtime,
        summary.phase_seconds[0],
        summary.phase_seconds[1],
        summary.phase_seconds[2],
        summary.phase_seconds[3],
        summary.mbps,
        summary.tbpm,
        summary.mbps_per_node,
    )
}

/// Write a finished job's artifacts into the batch log directory.
pub async fn write_job_artifacts(
    batch_logs: &Path,
    job_id: u64,
    job_info: &BTreeMap<String, String>,
    summary: &JobSummary,
) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(job_info).unwrap_or_else(|_| "{}".to_string());
    std::fs::write(batch_logs.join(format!("job_info_{job_id}.json")), json)?;

    std::fs::write(
        batch_logs.join(format!("results.job_{job_id}")),
        format_results(summary),
    )?;

    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(cpuinfo) => std::fs::write(batch_logs.join("cpuinfo"), cpuinfo)?,
        Err(e) => warn!(error = %e, "couldn't capture /proc/cpuinfo"),
    }

    match Command::new("uname").arg("-a").output().await {
        Ok(output) => std::fs::write(batch_logs.join("uname.out"), output.stdout)?,
        Err(e) => warn!(error = %e, "couldn't capture uname -a"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary() -> JobSummary {
        JobSummary {
            runtime: 125.5,
            mbps: 820.25,
            mbps_per_node: 410.125,
            tbpm: 0.0492,
            phase_seconds: [10.0, 100.0, 0.5, 15.0],
        }
    }

    #[test]
    fn results_file_lists_every_phase_and_throughput() {
        let text = format_results(&summary());

        assert!(text.contains("Total time: 125.50 seconds"));
        assert!(text.contains("Phase zero: 10.00 seconds"));
        assert!(text.contains("Phase three 15.00 seconds"));
        assert!(text.contains("Throughput: 820.25 MB/s (0.05 TB/min)"));
        assert!(text.contains("Per-Server: 410.13 MB/s/node"));
    }

    #[tokio::test]
    async fn artifacts_land_in_the_batch_directory() {
        let dir = tempdir().unwrap();
        let mut info = BTreeMap::new();
        info.insert("status".to_string(), "Complete".to_string());
        info.insert("job_id".to_string(), "7".to_string());

        write_job_artifacts(dir.path(), 7, &info, &summary())
            .await
            .unwrap();

        let json = std::fs::read_to_string(dir.path().join("job_info_7.json")).unwrap();
        assert!(json.contains("\"status\": \"Complete\""));
        assert!(dir.path().join("results.job_7").exists());
    }
}
