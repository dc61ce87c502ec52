//! Partition-recovery planning.
//!
//! Phase zero leaves a `logical_disk_counts.<job>` artifact in the batch
//! log directory: an ordered list of node IPs plus, per node, the number
//! of logical partitions each intermediate disk owns. When a disk or a
//! whole node is lost, walking that artifact in order identifies exactly
//! which contiguous partition intervals were owned by the failed
//! hardware. Those intervals are registered on the job so a replay job
//! (with `recovering` set) regenerates only the lost partitions, reusing
//! the original boundary list for an identical partition-to-key mapping.

use std::path::Path;

use tracing::{debug, error};

use themis_store::{CoordinatorDb, LogicalDiskCounts};

use crate::errors::ClusterError;

/// The contiguous `[start, stop]` partition intervals owned by
/// `target_disk_ids` of the node at `target_ip`.
///
/// Partitions are numbered by walking the ordered node list and each
/// node's disks in index order, so intervals spanning consecutive target
/// disks merge into one.
pub fn partition_ranges(
    counts: &LogicalDiskCounts,
    target_ip: &str,
    target_disk_ids: &[usize],
) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut current_partition = 0u64;
    let mut range_start: Option<u64> = None;

    for node in &counts.ordered_node_list {
        for (disk_id, partition_count) in counts.counts_for(node).iter().enumerate() {
            let on_target = node == target_ip && target_disk_ids.contains(&disk_id);

            if on_target {
                range_start.get_or_insert(current_partition);
            } else if let Some(start) = range_start.take()
                && current_partition > start
            {
                ranges.push((start, current_partition - 1));
            }

            current_partition += partition_count;
        }
    }

    if let Some(start) = range_start
        && current_partition > start
    {
        ranges.push((start, current_partition - 1));
    }

    ranges
}

/// Compute and register recovery intervals for every job in a batch,
/// for the given disks of `target_host`.
pub async fn plan_recovery(
    db: &CoordinatorDb,
    log_directory: &Path,
    batch_id: u64,
    target_host: &str,
    target_disk_ids: &[usize],
) -> Result<(), ClusterError> {
    let Some(target_ip) = db.ipv4_address(target_host).await? else {
        error!(host = %target_host, "can't find IPv4 address; aborting recovery");
        return Ok(());
    };

    for job_id in db.batch_jobs(batch_id).await? {
        debug!(job_id, "getting partition information");

        let counts_file = log_directory
            .join("run_logs")
            .join(format!("batch_{batch_id}"))
            .join(format!("phase_zero_job_{job_id}"))
            .join(format!("logical_disk_counts.{job_id}"));

        let content = match std::fs::read_to_string(&counts_file) {
            Ok(content) => content,
            Err(_) => {
                error!(
                    job_id,
                    file = %counts_file.display(),
                    "can't recover job; logical disk counts file missing"
                );
                continue;
            }
        };

        let counts: LogicalDiskCounts = match serde_json::from_str(&content) {
            Ok(counts) => counts,
            Err(e) => {
                error!(job_id, error = %e, "malformed logical disk counts file");
                continue;
            }
        };

        for (start, stop) in partition_ranges(&counts, &target_ip, target_disk_ids) {
            debug!(job_id, start, stop, "adding recovery partition range");
            db.add_recovery_partition_range(job_id, start, stop).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn counts(nodes: &[(&str, &[u64])]) -> LogicalDiskCounts {
        LogicalDiskCounts {
            ordered_node_list: nodes.iter().map(|(n, _)| n.to_string()).collect(),
            disk_counts: nodes
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_vec()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn single_disk_maps_to_one_interval() {
        let counts = counts(&[("10.0.0.1", &[4, 4]), ("10.0.0.2", &[3, 5])]);

        assert_eq!(partition_ranges(&counts, "10.0.0.2", &[0]), vec![(8, 10)]);
        assert_eq!(partition_ranges(&counts, "10.0.0.2", &[1]), vec![(11, 15)]);
    }

    #[test]
    fn whole_node_merges_consecutive_disks() {
        let counts = counts(&[("10.0.0.1", &[4, 4]), ("10.0.0.2", &[3, 5])]);

        assert_eq!(
            partition_ranges(&counts, "10.0.0.1", &[0, 1]),
            vec![(0, 7)]
        );
        assert_eq!(
            partition_ranges(&counts, "10.0.0.2", &[0, 1]),
            vec![(8, 15)]
        );
    }

    #[test]
    fn non_adjacent_target_disks_yield_separate_intervals() {
        let counts = counts(&[("10.0.0.1", &[4, 2, 3])]);

        assert_eq!(
            partition_ranges(&counts, "10.0.0.1", &[0, 2]),
            vec![(0, 3), (6, 8)]
        );
    }

    #[test]
    fn covered_partitions_exactly_match_the_failed_disks() {
        // Recovery must cover every partition assigned to the failed
        // disks and nothing else.
        let counts = counts(&[("10.0.0.1", &[2, 3]), ("10.0.0.2", &[4]), ("10.0.0.3", &[1, 2])]);
        let total: u64 = 2 + 3 + 4 + 1 + 2;

        let ranges = partition_ranges(&counts, "10.0.0.2", &[0]);
        let covered: Vec<u64> = ranges
            .iter()
            .flat_map(|(start, stop)| *start..=*stop)
            .collect();

        // Partitions 5..=8 belong to 10.0.0.2's only disk.
        assert_eq!(covered, (5..=8).collect::<Vec<_>>());
        assert!(covered.iter().all(|p| *p < total));
    }

    #[test]
    fn zero_count_disks_produce_no_intervals() {
        let counts = counts(&[("10.0.0.1", &[0, 4])]);

        assert_eq!(partition_ranges(&counts, "10.0.0.1", &[0]), vec![]);
        assert_eq!(partition_ranges(&counts, "10.0.0.1", &[1]), vec![(0, 3)]);
    }

    #[test]
    fn unknown_target_matches_nothing() {
        let counts = counts(&[("10.0.0.1", &[4])]);
        assert_eq!(partition_ranges(&counts, "10.0.0.9", &[0]), vec![]);
    }
}
