//! Node coordinator.
//!
//! One instance runs on every worker node, spawned over ssh by the
//! cluster coordinator. It pulls batch ids off its queue, drives the
//! local data-plane binary through the four phases, writes a
//! phase-completion marker after each (success or not, so the cluster
//! coordinator can keep advancing its view), and reports failures
//! through the store. A keepalive task advertises liveness the whole
//! time.

pub mod keepalive;
pub mod runner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use themis_store::{CoordinatorDb, FailureReport, PhaseName};

use crate::config::{ClusterConfig, SkipFlags, str_truthy};
use crate::errors::NodeError;
use crate::node::runner::DataPlaneRunner;
use crate::util::{create_batch_directory, current_username};

/// How many times to re-read the live-node set while waiting to appear
/// in it before giving up.
const LIVE_SET_RETRIES: u32 = 10;

/// Everything a node coordinator needs to run.
pub struct NodeSettings {
    pub hostname: String,
    pub data_plane_binary: String,
    pub config: ClusterConfig,
    pub config_path: PathBuf,
    pub log_directory: PathBuf,
    /// Nonce mixed into scratch-directory names so re-runs of a batch id
    /// never collide.
    pub batch_nonce: String,
    pub store_host: String,
    pub store_port: u16,
    pub store_db: i64,
}

pub struct NodeCoordinator {
    db: CoordinatorDb,
    settings: NodeSettings,
    runner: DataPlaneRunner,
    default_config: PathBuf,
    username: String,
    current_batch: Option<u64>,
    my_ip: String,
}

impl NodeCoordinator {
    pub fn new(db: CoordinatorDb, settings: NodeSettings) -> Self {
        // The data plane ships a defaults file next to its binary.
        let default_config = Path::new(&settings.data_plane_binary)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("defaults.yaml");

        let runner = DataPlaneRunner::new(&settings.data_plane_binary, &settings.hostname);

        Self {
            db,
            runner,
            default_config,
            username: current_username(),
            current_batch: None,
            my_ip: String::new(),
            settings,
        }
    }

    /// The node coordinator's main loop: answer the boot-time ping
    /// request, then process batches forever.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        // Batches queued before this coordinator booted belong to a
        // previous incarnation.
        self.db.clear_batch_queue(&self.settings.hostname).await?;

        self.ping_handshake().await?;

        loop {
            self.run_one_batch().await?;
        }
    }

    /// Report the current batch as failed. The cluster coordinator fails
    /// the batch's jobs and plans any recovery work.
    pub async fn fail_current_batch(&self, message: &str) -> Result<(), NodeError> {
        let Some(batch_id) = self.current_batch else {
            warn!("no current batch to report a failure for");
            return Ok(());
        };

        self.db
            .report_failure(&FailureReport::new(
                &self.settings.hostname,
                batch_id,
                message,
            ))
            .await?;
        Ok(())
    }

    /// Wait for the coordinator's ping request, ping every live node, and
    /// reply with the unreachable set.
    async fn ping_handshake(&self) -> Result<(), NodeError> {
        let nodes: Vec<String> = self.db.live_nodes().await?.into_iter().collect();
        self.db
            .wait_for_ping_request(&self.settings.hostname)
            .await?;

        info!(?nodes, "pinging the cluster");
        let output = Command::new("fping")
            .arg("-u")
            .args(&nodes)
            .output()
            .await?;

        // fping -u prints only the unreachable hosts; a non-zero exit
        // just means some host did not answer.
        let unreachable = String::from_utf8_lossy(&output.stdout).to_string();
        info!(unreachable = %unreachable.trim(), "ping sweep finished");

        self.db
            .send_ping_reply(&self.settings.hostname, &unreachable)
            .await?;
        Ok(())
    }

    async fn run_one_batch(&mut self) -> Result<(), NodeError> {
        info!("waiting for the next batch");
        let batch_id = self
            .db
            .blocking_wait_for_next_batch(&self.settings.hostname)
            .await?;
        self.current_batch = Some(batch_id);
        info!(batch_id, "running batch");

        let (node_id, nodes) = self.wait_for_live_set_membership().await?;

        // Every live node must bring the same number of intermediate
        // disks to the batch, or partition assignment is meaningless.
        let mut disk_counts = Vec::with_capacity(nodes.len());
        for node in &nodes {
            disk_counts.push(self.db.local_disks(node).await?.len());
        }
        if disk_counts.windows(2).any(|pair| pair[0] != pair[1]) {
            let message = NodeError::InconsistentDiskCounts {
                counts: disk_counts,
            }
            .to_string();
            error!(%message);
            self.fail_current_batch(&message).await?;
            self.db
                .node_completed_batch(&self.settings.hostname, batch_id)
                .await?;
            return Ok(());
        }

        self.my_ip = match self.db.ipv4_address(&self.settings.hostname).await? {
            Some(ip) => ip,
            None => {
                warn!("no IPv4 address recorded for this host; using hostname");
                self.settings.hostname.clone()
            }
        };

        let mut peer_list = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let interfaces = match self.db.interfaces(node).await? {
                Some(interfaces) => interfaces,
                None => self
                    .db
                    .ipv4_address(node)
                    .await?
                    .unwrap_or_else(|| node.clone()),
            };
            peer_list.push(interfaces);
        }

        let intermediate_disks = self.db.local_disks(&self.settings.hostname).await?;
        if intermediate_disks.is_empty() {
            let message = NodeError::NoIntermediateDisks {
                hostname: self.settings.hostname.clone(),
            }
            .to_string();
            error!(%message);
            self.fail_current_batch(&message).await?;
            self.db
                .node_completed_batch(&self.settings.hostname, batch_id)
                .await?;
            return Ok(());
        }

        let output_disks = self.db.io_disks(&self.settings.hostname).await?;

        // Scratch space for the phase-zero artifacts, on the first
        // intermediate disk to dodge /tmp size limits.
        let tmp_files_dir = Path::new(&intermediate_disks[0]).join(format!(
            "{}_tempfiles_batch_{}_{}",
            self.username, batch_id, self.settings.batch_nonce
        ));
        std::fs::create_dir_all(&tmp_files_dir)?;

        let base_log_dir = create_batch_directory(&self.settings.log_directory, batch_id)
            .map_err(|e| std::io::Error::other(e))?;

        let batch_jobs = self.db.batch_jobs(batch_id).await?;
        let first_job_params = match batch_jobs.first() {
            Some(job_id) => self.db.job_params(*job_id).await?,
            None => BTreeMap::new(),
        };
        let skips = SkipFlags::resolve(&self.settings.config, &first_job_params);
        let daytona_minutesort = first_job_params
            .get("DAYTONA_MINUTESORT")
            .map(|v| str_truthy(v))
            .unwrap_or(false);

        // Every job needs a disk-backed boundary list registered for
        // future recoveries, and recovering jobs need the one from the
        // job they are replaying.
        let global_boundary_lists = match self
            .lookup_global_boundary_lists(&batch_jobs, &base_log_dir)
            .await?
        {
            Ok(files) => files,
            Err(unrecoverable_job) => {
                self.fail_current_batch(&format!(
                    "Couldn't fetch global boundary list files for job {unrecoverable_job}"
                ))
                .await?;
                self.db
                    .node_completed_batch(&self.settings.hostname, batch_id)
                    .await?;
                return Ok(());
            }
        };

        let base_params = self.base_params(
            batch_id,
            node_id,
            &peer_list,
            &output_disks,
            output_disks.len(),
        );

        // If any phase fails, skip the rest but still write completion
        // markers so the coordinator's phase view drains.
        let mut continue_batch = true;
        let mut logical_disk_counts_files: BTreeMap<u64, PathBuf> = BTreeMap::new();
        let mut boundary_list_files: BTreeMap<u64, PathBuf> = BTreeMap::new();

        if !skips.is_skipped(PhaseName::Zero) {
            for &job_id in &batch_jobs {
                if !continue_batch {
                    break;
                }

                let phase_log_dir = base_log_dir.join(format!("phase_zero_job_{job_id}"));
                let logical_file = tmp_files_dir.join(format!("logical_disk_counts.{job_id}"));
                let boundary_file = tmp_files_dir.join(format!("boundary_list.{job_id}"));
                logical_disk_counts_files.insert(job_id, logical_file.clone());
                boundary_list_files.insert(job_id, boundary_file.clone());

                let mut params = base_params.clone();
                params.insert("LOG_DIR".into(), phase_log_dir.display().to_string());
                params.insert(
                    "LOGICAL_DISK_COUNTS_FILE".into(),
                    logical_file.display().to_string(),
                );
                params.insert(
                    "BOUNDARY_LIST_FILE".into(),
                    boundary_file.display().to_string(),
                );
                params.insert("JOB_IDS".into(), job_id.to_string());

                for (job, file) in &global_boundary_lists {
                    params.insert(
                        format!("DISK_BACKED_BOUNDARY_LIST.{job}"),
                        file.clone(),
                    );
                }

                if daytona_minutesort {
                    for (job, file) in &boundary_list_files {
                        params.insert(
                            format!("BOUNDARY_LIST_FILE.{job}"),
                            file.display().to_string(),
                        );
                    }
                }

                for (key, value) in self.db.job_params(job_id).await? {
                    params.insert(key, value);
                }
                apply_skip_params(&mut params, PhaseName::Zero);

                continue_batch = self.run_phase(params, &phase_log_dir).await?;

                // Peer zero publishes the logical disk counts where the
                // cluster coordinator's recovery planner looks for them.
                if continue_batch && node_id == 0 {
                    if logical_file.exists() {
                        std::fs::create_dir_all(&phase_log_dir)?;
                        std::fs::copy(
                            &logical_file,
                            phase_log_dir.join(format!("logical_disk_counts.{job_id}")),
                        )?;
                    } else {
                        error!(file = %logical_file.display(), "logical disk counts file missing");
                    }
                }
            }
        }
        self.db
            .phase_completed(batch_id, &self.my_ip, PhaseName::Zero)
            .await?;

        if !skips.is_skipped(PhaseName::One) && continue_batch {
            let phase_log_dir = base_log_dir.join("phase_one");

            let mut params = base_params.clone();
            params.insert("LOG_DIR".into(), phase_log_dir.display().to_string());
            params.insert("JOB_IDS".into(), join_ids(&batch_jobs));

            for (job, file) in &logical_disk_counts_files {
                params.insert(
                    format!("LOGICAL_DISK_COUNTS_FILE.{job}"),
                    file.display().to_string(),
                );
            }
            for (job, file) in &boundary_list_files {
                params.insert(
                    format!("BOUNDARY_LIST_FILE.{job}"),
                    file.display().to_string(),
                );
            }
            for &job_id in &batch_jobs {
                for (key, value) in self.db.job_params(job_id).await? {
                    params.insert(key, value);
                }
            }
            apply_skip_params(&mut params, PhaseName::One);

            continue_batch = self.run_phase(params, &phase_log_dir).await?;
        }
        self.db
            .phase_completed(batch_id, &self.my_ip, PhaseName::One)
            .await?;

        if !skips.is_skipped(PhaseName::Two) && continue_batch {
            let phase_log_dir = base_log_dir.join("phase_two");

            let mut params = base_params.clone();
            params.insert("LOG_DIR".into(), phase_log_dir.display().to_string());
            params.insert("JOB_IDS".into(), join_ids(&batch_jobs));
            apply_skip_params(&mut params, PhaseName::Two);

            continue_batch = self.run_phase(params, &phase_log_dir).await?;
        }
        self.db
            .phase_completed(batch_id, &self.my_ip, PhaseName::Two)
            .await?;

        if !skips.is_skipped(PhaseName::Three) {
            for &job_id in &batch_jobs {
                if !continue_batch {
                    break;
                }

                let phase_log_dir = base_log_dir.join(format!("phase_three_job_{job_id}"));

                let mut params = base_params.clone();
                params.insert("LOG_DIR".into(), phase_log_dir.display().to_string());
                params.insert("JOB_IDS".into(), job_id.to_string());

                for (key, value) in self.db.job_params(job_id).await? {
                    params.insert(key, value);
                }
                apply_skip_params(&mut params, PhaseName::Three);

                continue_batch = self.run_phase(params, &phase_log_dir).await?;
            }
        }
        self.db
            .phase_completed(batch_id, &self.my_ip, PhaseName::Three)
            .await?;

        if continue_batch {
            info!(batch_id, "batch succeeded");
        } else {
            info!(batch_id, "batch failed");
        }

        self.db
            .node_completed_batch(&self.settings.hostname, batch_id)
            .await?;
        self.current_batch = None;

        Ok(())
    }

    /// Re-read the live-node set until this host appears in it, returning
    /// the host's peer id (its index in the sorted live list) and the
    /// list itself.
    async fn wait_for_live_set_membership(&self) -> Result<(usize, Vec<String>), NodeError> {
        let mut retries = LIVE_SET_RETRIES;
        loop {
            let nodes: Vec<String> = self.db.live_nodes().await?.into_iter().collect();

            if let Some(node_id) = nodes.iter().position(|n| *n == self.settings.hostname) {
                return Ok((node_id, nodes));
            }

            retries -= 1;
            if retries == 0 {
                return Err(NodeError::NotInLiveSet {
                    hostname: self.settings.hostname.clone(),
                });
            }
            error!("can't find my hostname in the live-node list; retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Resolve the boundary-list file for every job in the batch. A
    /// recovering job whose original boundary list is unknown or missing
    /// on disk is unrecoverable; its id comes back in `Err`.
    async fn lookup_global_boundary_lists(
        &self,
        batch_jobs: &[u64],
        parent_dir: &Path,
    ) -> Result<Result<BTreeMap<u64, String>, u64>, NodeError> {
        let mut files = BTreeMap::new();

        for &job_id in batch_jobs {
            if let Some(recovery) = self.db.recovery_info(job_id).await? {
                let recovering_job = recovery.recovering_job;

                let Some(boundary_file) =
                    self.db.global_boundary_list_file(recovering_job).await?
                else {
                    error!(
                        job = recovering_job,
                        "no known disk-backed boundary list file"
                    );
                    return Ok(Err(recovering_job));
                };

                if !Path::new(&boundary_file).exists() {
                    error!(
                        job = recovering_job,
                        file = %boundary_file,
                        "disk-backed boundary list file missing on disk"
                    );
                    return Ok(Err(recovering_job));
                }

                files.insert(recovering_job, boundary_file);
            }

            // Register this job's own boundary list for future
            // recoveries; phase zero will create the file.
            let own_file = parent_dir
                .join(format!("global_boundary_list.{job_id}"))
                .display()
                .to_string();
            self.db
                .set_global_boundary_list_file(job_id, &own_file)
                .await?;
            files.insert(job_id, own_file);
        }

        Ok(Ok(files))
    }

    fn base_params(
        &self,
        batch_id: u64,
        node_id: usize,
        peer_list: &[String],
        output_disks: &[String],
        num_input_disks: usize,
    ) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("OUTPUT_DISK_LIST".into(), output_disks.join(","));
        params.insert("MYPEERID".into(), node_id.to_string());
        params.insert("MY_IP_ADDRESS".into(), self.my_ip.clone());
        params.insert("PEER_LIST".into(), peer_list.join(","));
        params.insert("NUM_INPUT_DISKS".into(), num_input_disks.to_string());
        params.insert(
            "CONFIG".into(),
            self.settings.config_path.display().to_string(),
        );
        params.insert(
            "DEFAULT_CONFIG".into(),
            self.default_config.display().to_string(),
        );
        params.insert("BATCH_ID".into(), batch_id.to_string());
        params.insert(
            "COORDINATOR.HOSTNAME".into(),
            self.settings.store_host.clone(),
        );
        params.insert(
            "COORDINATOR.PORT".into(),
            self.settings.store_port.to_string(),
        );
        params.insert("COORDINATOR.DB".into(), self.settings.store_db.to_string());
        params
    }

    /// Run one data-plane invocation, refreshing the intermediate-disk
    /// list first (it shrinks when disks fail mid-batch). Reports a
    /// failure and returns false on non-zero exit.
    async fn run_phase(
        &self,
        mut params: BTreeMap<String, String>,
        log_dir: &Path,
    ) -> Result<bool, NodeError> {
        let intermediate_disks = self.db.local_disks(&self.settings.hostname).await?;
        if intermediate_disks.is_empty() {
            let message = NodeError::NoIntermediateDisks {
                hostname: self.settings.hostname.clone(),
            }
            .to_string();
            self.fail_current_batch(&message).await?;
            return Ok(false);
        }
        params.insert("INTERMEDIATE_DISK_LIST".into(), intermediate_disks.join(","));

        let num_interfaces = self.db.num_interfaces().await?;
        params.insert("NUM_INTERFACES".into(), num_interfaces.to_string());

        let outcome = self.runner.run(&params, log_dir).await?;
        if !outcome.success {
            error!(stderr = %outcome.error_message, "data plane failed");
            self.fail_current_batch(&outcome.error_message).await?;
        }

        Ok(outcome.success)
    }
}

/// Disable every phase except `running`; the one left unset tells the
/// data plane which phase this invocation executes. Applied after the
/// job-param merge so a stray SKIP_PHASE_* parameter cannot break the
/// one-phase-per-invocation contract.
fn apply_skip_params(params: &mut BTreeMap<String, String>, running: PhaseName) {
    for phase in PhaseName::ALL {
        if phase == running {
            params.remove(phase.skip_param());
        } else {
            params.insert(phase.skip_param().to_string(), "1".to_string());
        }
    }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_params_leave_exactly_one_phase_unset() {
        let mut params = BTreeMap::new();
        // A job param naming the running phase must not survive.
        params.insert("SKIP_PHASE_ONE".to_string(), "0".to_string());
        apply_skip_params(&mut params, PhaseName::One);

        assert_eq!(params.get("SKIP_PHASE_ZERO").map(String::as_str), Some("1"));
        assert!(params.get("SKIP_PHASE_ONE").is_none());
        assert_eq!(params.get("SKIP_PHASE_TWO").map(String::as_str), Some("1"));
        assert_eq!(
            params.get("SKIP_PHASE_THREE").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn job_id_lists_are_comma_joined() {
        assert_eq!(join_ids(&[1, 2, 3]), "1,2,3");
        assert_eq!(join_ids(&[7]), "7");
        assert_eq!(join_ids(&[]), "");
    }
}
