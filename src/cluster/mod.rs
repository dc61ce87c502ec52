//! Cluster coordinator.
//!
//! The singleton driver of the control plane. It spawns a node
//! coordinator on every known node over ssh, then loops at roughly 2 Hz:
//!
//! 1. sweep keepalives and flip node liveness,
//! 2. drain failure reports into failed batches and recovery plans,
//! 3. drain phase-completion markers and advance each batch's phase,
//! 4. answer interactive keyboard queries,
//! 5. finalize batches whose last node finished,
//! 6. ingest newly submitted jobs and dispatch them as a batch.
//!
//! All coordination happens through the store; the only local state is
//! the per-batch phase progress and the log directory.

pub mod recovery;
pub mod results;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use console::style;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use themis_store::{CoordinatorDb, FailureReport, JobSpec, JobStatus, PhaseName};

use crate::batch::BatchState;
use crate::config::{ClusterConfig, SkipFlags};
use crate::errors::{ClusterError, DiscoveryError};
use crate::inputs::InputDiscovery;
use crate::planner::{self, SampleSettings, WorkerInputs};
use crate::util::{create_batch_directory, unix_time_secs};

/// Everything the cluster coordinator needs to run.
pub struct ClusterSettings {
    pub data_plane_binary: String,
    pub config: ClusterConfig,
    pub config_path: PathBuf,
    pub log_directory: PathBuf,
    pub keepalive_refresh: u64,
    pub keepalive_timeout: u64,
    pub store_host: String,
    pub store_port: u16,
    pub store_db: i64,
    /// Command used to launch this CLI on remote nodes.
    pub themis_command: String,
}

pub struct ClusterCoordinator {
    db: CoordinatorDb,
    settings: ClusterSettings,
    discovery: InputDiscovery,
    batch_states: HashMap<u64, BatchState>,
    batch_nonce: String,
    keyboard: mpsc::UnboundedReceiver<String>,
}

impl ClusterCoordinator {
    pub fn new(db: CoordinatorDb, settings: ClusterSettings) -> Self {
        let discovery = InputDiscovery::new(format!("{} list-files", settings.themis_command));

        // Interactive inspection commands arrive on stdin; a blocking
        // reader feeds them into the async loop.
        let (keyboard_tx, keyboard) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match std::io::BufRead::read_line(&mut stdin.lock(), &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if keyboard_tx.send(line.trim().to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            db,
            settings,
            discovery,
            batch_states: HashMap::new(),
            batch_nonce: uuid::Uuid::new_v4().simple().to_string(),
            keyboard,
        }
    }

    /// Run the coordinator until interrupted or the cluster empties.
    pub async fn run(&mut self) -> Result<(), ClusterError> {
        self.start_node_coordinators().await?;

        // Jobs left on the queue belong to a previous coordinator.
        self.db.clear_job_queue().await?;

        self.check_node_liveness().await?;
        self.all_cluster_ping().await?;

        info!("coordinator's main loop starting");
        print_keyboard_commands();

        let mut interrupt =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("caught interrupt; exiting");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }

            self.check_node_liveness().await?;

            if self.db.live_nodes().await?.is_empty() {
                error!("no live nodes remain; shutting down");
                break;
            }

            self.handle_node_failure_reports().await?;
            self.check_phase_completion().await?;
            self.check_keyboard_input().await?;
            self.complete_existing_batches().await?;

            let (batch_jobs, batch_inputs) = self.setup_next_batch().await?;
            if !batch_jobs.is_empty() {
                self.run_batch(&batch_jobs, &batch_inputs).await?;
            }
        }

        self.stop_node_coordinators().await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------

    /// Spawn a node coordinator on every known node over ssh, with its
    /// output redirected into the shared log directory.
    async fn start_node_coordinators(&self) -> Result<(), ClusterError> {
        let node_log_dir = self.settings.log_directory.join("node_coordinators");

        for host in self.db.known_nodes().await? {
            self.db.create_keepalive(&host).await?;

            let stdout_file = node_log_dir.join(format!("stdout-{host}.log"));
            let stderr_file = node_log_dir.join(format!("stderr-{host}.log"));

            let remote = format!(
                "mkdir -p {log_dir}; nohup {themis} node \
                 --store-host {store_host} --store-port {store_port} --store-db {store_db} \
                 --hostname {host} --batch-nonce {nonce} \
                 --keepalive-refresh {refresh} --keepalive-timeout {timeout} \
                 {binary} {config} {base_log} \
                 1>{stdout} 2>{stderr} &",
                log_dir = node_log_dir.display(),
                themis = self.settings.themis_command,
                store_host = self.settings.store_host,
                store_port = self.settings.store_port,
                store_db = self.settings.store_db,
                nonce = self.batch_nonce,
                refresh = self.settings.keepalive_refresh,
                timeout = self.settings.keepalive_timeout,
                binary = self.settings.data_plane_binary,
                config = self.settings.config_path.display(),
                base_log = self.settings.log_directory.display(),
                stdout = stdout_file.display(),
                stderr = stderr_file.display(),
            );

            info!(host = %host, "starting node coordinator");
            let status = Command::new("ssh")
                .arg(&host)
                .arg(&remote)
                .status()
                .await
                .map_err(|source| ClusterError::NodeSpawnFailed {
                    host: host.clone(),
                    source,
                })?;

            if !status.success() {
                return Err(ClusterError::NodeSpawnFailed {
                    host,
                    source: std::io::Error::other(format!(
                        "ssh exited with status {}",
                        status.code().unwrap_or(-1)
                    )),
                });
            }
        }

        Ok(())
    }

    /// Ask every live node to ping the whole cluster and verify nobody
    /// is unreachable before accepting work.
    async fn all_cluster_ping(&self) -> Result<(), ClusterError> {
        let hosts: Vec<String> = self.db.live_nodes().await?.into_iter().collect();

        for host in &hosts {
            info!(host = %host, "asking node to ping the cluster");
            self.db.send_ping_request(host).await?;
        }

        for host in &hosts {
            info!(host = %host, "waiting for ping results");
            let reply = self.db.wait_for_ping_reply(host).await?;
            let unreachable: Vec<String> = reply
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();

            if !unreachable.is_empty() {
                return Err(ClusterError::UnreachableNodes {
                    host: host.clone(),
                    unreachable,
                });
            }
        }

        Ok(())
    }

    /// Send SIGUSR1 to every node coordinator we can still reach.
    async fn stop_node_coordinators(&self) {
        let Ok(hosts) = self.db.live_nodes().await else {
            return;
        };

        for host in hosts {
            let refreshed = self.db.keepalive_refreshed(&host).await.unwrap_or(false);
            if !refreshed {
                continue;
            }

            if let Ok(Some(pid)) = self.db.node_coordinator_pid(&host).await {
                info!(host = %host, pid, "stopping node coordinator");
                let _ = Command::new("ssh")
                    .arg(&host)
                    .arg(format!("kill -s SIGUSR1 {pid}"))
                    .status()
                    .await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Liveness and failure handling
    // ---------------------------------------------------------------

    /// Flip nodes between live and dead based on keepalive presence. A
    /// node going dead synthesizes an internal failure report for every
    /// incomplete batch it still owes work to.
    async fn check_node_liveness(&mut self) -> Result<(), ClusterError> {
        for host in self.db.known_nodes().await? {
            let presumed_alive = self.db.live_nodes().await?.contains(&host);
            let keepalive_refreshed = self.db.keepalive_refreshed(&host).await?;

            if keepalive_refreshed && !presumed_alive {
                info!(host = %host, "host, thought dead, is now alive again");
                self.db.declare_host_alive(&host).await?;
            } else if !keepalive_refreshed && presumed_alive {
                error!(host = %host, "keepalive expired; presumed dead");
                self.db.declare_host_dead(&host).await?;

                for batch_id in self.db.incomplete_batches().await? {
                    if self.db.batch_contains_node(batch_id, &host).await? {
                        self.db
                            .report_failure(&FailureReport::new(
                                &host,
                                batch_id,
                                FailureReport::INTERNAL,
                            ))
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Drain the failure-report queue, failing the affected batches and
    /// planning recovery work.
    async fn handle_node_failure_reports(&mut self) -> Result<(), ClusterError> {
        while let Some(report) = self.db.next_failure_report().await? {
            info!(
                batch_id = report.batch_id,
                host = %report.hostname,
                "received failure report"
            );

            if let Some(disk) = &report.disk {
                info!(host = %report.hostname, disk = %disk, "setting up recovery from disk failure");
                self.setup_recovery_from_disk_failure(report.batch_id, &report.hostname, disk)
                    .await?;
            } else if report.is_internal() {
                info!(host = %report.hostname, "setting up recovery from node failure");
                self.setup_recovery_from_node_failure(report.batch_id, &report.hostname)
                    .await?;
            }

            self.fail_batch(
                report.batch_id,
                &format!("On {}: {}", report.hostname, report.message),
            )
            .await?;

            if report.is_internal() {
                // The dead node can never drain its batch_remaining
                // slot, so stop tracking the batch now.
                self.db.mark_batch_complete(report.batch_id).await?;
                self.batch_states.remove(&report.batch_id);
            }
        }

        Ok(())
    }

    /// Recover every partition the failed host's intermediate disks
    /// owned during this batch.
    async fn setup_recovery_from_node_failure(
        &self,
        batch_id: u64,
        host: &str,
    ) -> Result<(), ClusterError> {
        let num_disks = self.db.local_disks(host).await?.len();
        if num_disks == 0 {
            error!(host = %host, "can't find local disk list; aborting recovery");
            return Ok(());
        }

        let disk_ids: Vec<usize> = (0..num_disks).collect();
        recovery::plan_recovery(
            &self.db,
            &self.settings.log_directory,
            batch_id,
            host,
            &disk_ids,
        )
        .await
    }

    /// Recover the failed disk's partitions and retire the disk so later
    /// batches avoid it.
    async fn setup_recovery_from_disk_failure(
        &self,
        batch_id: u64,
        host: &str,
        failed_disk: &str,
    ) -> Result<(), ClusterError> {
        let local_disks = self.db.local_disks(host).await?;
        let Some(disk_id) = local_disks.iter().position(|disk| disk == failed_disk) else {
            error!(disk = %failed_disk, "can't find failed disk in list of local disks");
            return Ok(());
        };

        recovery::plan_recovery(
            &self.db,
            &self.settings.log_directory,
            batch_id,
            host,
            &[disk_id],
        )
        .await?;

        self.db.mark_local_disk_failed(host, failed_disk).await?;
        Ok(())
    }

    /// Fail every job in a batch and record the batch as failed. Safe to
    /// call more than once.
    async fn fail_batch(&self, batch_id: u64, fail_message: &str) -> Result<(), ClusterError> {
        if self.db.batch_failed(batch_id).await? {
            return Ok(());
        }

        for job_id in self.db.batch_jobs(batch_id).await? {
            self.fail_job(job_id, fail_message).await?;
        }

        self.db.fail_batch(batch_id).await?;
        Ok(())
    }

    /// Move a job to `Failed`, unless it already reached a terminal
    /// status.
    async fn fail_job(&self, job_id: u64, fail_message: &str) -> Result<(), ClusterError> {
        error!(job_id, fail_message, "job failed");

        self.db
            .update_job_status(
                job_id,
                &[
                    ("fail_message".to_string(), fail_message.to_string()),
                    ("stop_time".to_string(), unix_time_secs().to_string()),
                ],
                Some(JobStatus::InProgress),
                Some(JobStatus::Failed),
            )
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Phase progress and finalization
    // ---------------------------------------------------------------

    /// Drain phase-completion markers and advance each batch's phase
    /// when every node has reported.
    async fn check_phase_completion(&mut self) -> Result<(), ClusterError> {
        for batch_id in self.db.incomplete_batches().await? {
            let Some(state) = self.batch_states.get_mut(&batch_id) else {
                continue;
            };

            while let Some(phase) = state.current_phase() {
                let Some(node) = self.db.completed_node_for_phase(batch_id, phase).await? else {
                    break;
                };

                let quorum_reached = state.record_completion();
                info!(
                    batch_id,
                    node = %node,
                    phase = %phase,
                    completed = state.completed_nodes(),
                    total = state.node_count(),
                    "node completed phase"
                );

                if !quorum_reached {
                    continue;
                }

                let stop_time = unix_time_secs();
                let start_time = state.phase_started_unix();
                let elapsed = stop_time - start_time;
                info!(batch_id, phase = %phase, elapsed, "phase completed");

                for job_id in self.db.batch_jobs(batch_id).await? {
                    self.db
                        .update_job_status(
                            job_id,
                            &[
                                (format!("{phase}_start_time"), start_time.to_string()),
                                (format!("{phase}_stop_time"), stop_time.to_string()),
                                (format!("{phase}_elapsed_time"), elapsed.to_string()),
                            ],
                            None,
                            None,
                        )
                        .await?;
                }

                if let Some(next_phase) = state.advance(stop_time) {
                    self.db.begin_phase(batch_id, next_phase).await?;
                    info!(batch_id, phase = %next_phase, "running next phase");
                    print_keyboard_commands();
                }
            }

            if self
                .batch_states
                .get(&batch_id)
                .map(|state| state.is_done())
                .unwrap_or(false)
            {
                self.batch_states.remove(&batch_id);
            }
        }

        Ok(())
    }

    /// Finalize every batch whose last node has finished: record
    /// throughput, flip jobs to Complete, and dump result artifacts.
    async fn complete_existing_batches(&mut self) -> Result<(), ClusterError> {
        for batch_id in self.db.incomplete_batches().await? {
            if self.db.remaining_nodes_running_batch(batch_id).await? != 0 {
                continue;
            }

            self.db.mark_batch_complete(batch_id).await?;
            self.batch_states.remove(&batch_id);

            let num_nodes = self.db.live_nodes().await?.len().max(1);
            let batch_logs = self
                .settings
                .log_directory
                .join("run_logs")
                .join(format!("batch_{batch_id}"));

            for job_id in self.db.batch_jobs(batch_id).await? {
                let stop_time = unix_time_secs();
                let job_info = self.db.job_info(job_id).await?;

                let Some(start_time) = job_info
                    .get("start_time")
                    .and_then(|v| v.parse::<f64>().ok())
                else {
                    warn!(job_id, "job has no start_time; skipping finalization stats");
                    continue;
                };

                let runtime = stop_time - start_time;
                let total_mb = job_info
                    .get("total_input_size_bytes")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0)
                    / 1_000_000.0;
                let mbps = if runtime > 0.0 { total_mb / runtime } else { 0.0 };
                let tbpm = (mbps * 60.0) / 1_000_000.0;
                let mbps_per_node = mbps / num_nodes as f64;

                // Test-and-set so a job failed mid-batch keeps its
                // Failed status and fail message.
                self.db
                    .update_job_status(
                        job_id,
                        &[
                            ("stop_time".to_string(), stop_time.to_string()),
                            ("runtime".to_string(), runtime.to_string()),
                            ("MBps".to_string(), mbps.to_string()),
                            ("num_nodes".to_string(), num_nodes.to_string()),
                            ("MBps_per_node".to_string(), mbps_per_node.to_string()),
                            ("TBpm".to_string(), tbpm.to_string()),
                        ],
                        Some(JobStatus::InProgress),
                        Some(JobStatus::Complete),
                    )
                    .await?;

                info!(
                    job_id,
                    runtime, mbps, mbps_per_node, tbpm, "job finished"
                );

                let job_info = self.db.job_info(job_id).await?;
                let phase_seconds: [f64; 4] = std::array::from_fn(|index| {
                    let phase = PhaseName::from_index(index).expect("phase index in range");
                    job_info
                        .get(&format!("{phase}_elapsed_time"))
                        .and_then(|v| v.parse::<f64>().ok())
                        .unwrap_or(0.0)
                });

                let summary = results::JobSummary {
                    runtime,
                    mbps,
                    mbps_per_node,
                    tbpm,
                    phase_seconds,
                };

                info!(
                    job_id,
                    phase_zero = phase_seconds[0],
                    phase_one = phase_seconds[1],
                    phase_two = phase_seconds[2],
                    phase_three = phase_seconds[3],
                    "per-phase elapsed seconds"
                );

                if let Err(e) =
                    results::write_job_artifacts(&batch_logs, job_id, &job_info, &summary).await
                {
                    warn!(job_id, error = %e, "couldn't write job artifacts");
                }
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // Job ingest and batch dispatch
    // ---------------------------------------------------------------

    /// Pop at most one submitted job group and prepare its jobs,
    /// discovering inputs and failing jobs whose inputs are unusable.
    async fn setup_next_batch(&mut self) -> Result<(Vec<u64>, Vec<WorkerInputs>), ClusterError> {
        let group = self.db.next_job().await?;
        if group.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        // Jobs dispatched together share phases one and two, so their
        // skip flags must agree. A mismatched group fails whole, before
        // any batch id is allocated.
        if !skip_flags_agree(group.iter().map(|(spec, _)| spec)) {
            let diagnostic =
                "Not all jobs in the submission have the same SKIP_PHASE_* values".to_string();
            for (spec, job_id) in &group {
                if let Err(e) = self.db.new_job_info(*job_id, spec).await {
                    warn!(job_id, error = %e, "couldn't create job info for rejected job");
                }
                self.fail_job(*job_id, &diagnostic).await?;
            }
            return Ok((Vec::new(), Vec::new()));
        }

        let mut job_ids = Vec::new();
        let mut job_inputs = Vec::new();

        for (spec, job_id) in group {
            info!(
                job_id,
                job_name = spec.job_name.as_deref().unwrap_or(""),
                "received job"
            );

            if let Some(recovering_job) = spec.recovering {
                info!(job_id, recovering_job, "job is recovering a failed job");
                self.db.setup_recovery_job(job_id, recovering_job).await?;
            }

            if let Some(worker_inputs) = self.setup_new_job(spec, job_id).await? {
                job_ids.push(job_id);
                job_inputs.push(worker_inputs);
            }
        }

        Ok((job_ids, job_inputs))
    }

    /// Create the job's store entries and discover its inputs. Returns
    /// `None` when the job failed before entering a batch.
    async fn setup_new_job(
        &self,
        mut spec: JobSpec,
        job_id: u64,
    ) -> Result<Option<WorkerInputs>, ClusterError> {
        // Intermediates and outputs for this job land in their own
        // sub-directories.
        spec.intermediate_directory = format!("{}/job_{job_id}", spec.intermediate_directory);
        spec.output_directory = format!("{}/job_{job_id}", spec.output_directory);

        self.db.new_job_info(job_id, &spec).await?;

        let inputs = match self
            .discovery
            .gather_input_file_paths(
                &self.db,
                &spec.input_directory,
                spec.max_input_files_per_disk,
            )
            .await
        {
            Ok(inputs) => inputs,
            Err(DiscoveryError::Store(e)) => return Err(e.into()),
            Err(e) => {
                self.fail_job(job_id, &e.to_string()).await?;
                return Ok(None);
            }
        };

        let file_count: usize = inputs
            .worker_inputs
            .values()
            .flat_map(|workers| workers.values())
            .map(|files| files.len())
            .sum();

        if file_count == 0 {
            let message = format!(
                "Didn't find any input files in directory '{}'",
                spec.input_directory
            );
            self.fail_job(job_id, &message).await?;
            return Ok(None);
        }

        if inputs.total_input_size == 0 {
            self.fail_job(job_id, "Total length of all input files is 0B")
                .await?;
            return Ok(None);
        }

        self.db
            .update_job_status(
                job_id,
                &[(
                    "total_input_size_bytes".to_string(),
                    inputs.total_input_size.to_string(),
                )],
                None,
                None,
            )
            .await?;

        Ok(Some(inputs.worker_inputs))
    }

    /// Plan and dispatch one batch across the live nodes.
    async fn run_batch(
        &mut self,
        batch_jobs: &[u64],
        batch_inputs: &[WorkerInputs],
    ) -> Result<(), ClusterError> {
        let first_job_params = self.db.job_params(batch_jobs[0]).await?;
        let skips = SkipFlags::resolve(&self.settings.config, &first_job_params);
        let phases = skips.planned_phases(self.settings.config.use_replication());

        let sample_settings = SampleSettings {
            sample_rate: self.settings.config.sample_rate(),
            sample_points_per_file: self.settings.config.sample_points_per_file(),
            tuple_start_offset: self.settings.config.tuple_start_offset(&first_job_params),
        };

        // Plan before allocating the batch id: a planning error fails
        // the jobs without burning a batch.
        let plan = match planner::generate_read_requests(
            batch_inputs,
            batch_jobs,
            &sample_settings,
            &phases,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                let message = e.to_string();
                for &job_id in batch_jobs {
                    self.fail_job(job_id, &message).await?;
                }
                return Ok(());
            }
        };

        let batch_id = self.db.next_batch_id().await?;
        info!(batch_id, jobs = ?batch_jobs, "running batch");

        let batch_logs = create_batch_directory(&self.settings.log_directory, batch_id)
            .map_err(|e| std::io::Error::other(e))?;

        // Keep the active config with the batch's logs for post-mortems.
        if let Some(config_name) = self.settings.config_path.file_name() {
            if let Err(e) =
                std::fs::copy(&self.settings.config_path, batch_logs.join(config_name))
            {
                warn!(error = %e, "couldn't copy config into batch log directory");
            }
        }

        self.db
            .create_barriers(&phases, batch_id, batch_jobs)
            .await?;
        planner::load_read_requests(&self.db, &plan).await?;

        let start_time = unix_time_secs();
        self.db.begin_phase(batch_id, PhaseName::Zero).await?;

        let nodes = self.db.live_nodes().await?;
        self.batch_states.insert(
            batch_id,
            BatchState::new(batch_id, nodes.len(), start_time),
        );
        info!(batch_id, "running phase_zero");
        print_keyboard_commands();

        let date = chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string();
        for &job_id in batch_jobs {
            self.db
                .update_job_status(
                    job_id,
                    &[
                        ("start_time".to_string(), start_time.to_string()),
                        ("batch_id".to_string(), batch_id.to_string()),
                        ("date".to_string(), date.clone()),
                    ],
                    None,
                    None,
                )
                .await?;
        }

        self.db.add_jobs_to_batch(batch_id, batch_jobs).await?;
        self.db.mark_batch_incomplete(batch_id, &nodes).await?;

        // Every node coordinator starts work the moment the batch id
        // lands on its queue.
        self.db.enqueue_batch(batch_id, &nodes).await?;

        Ok(())
    }

    // ---------------------------------------------------------------
    // Interactive inspection
    // ---------------------------------------------------------------

    /// Answer any pending keyboard commands without blocking the loop.
    async fn check_keyboard_input(&mut self) -> Result<(), ClusterError> {
        while let Ok(command) = self.keyboard.try_recv() {
            match command.as_str() {
                "running" | "r" => {
                    let mut displayed = false;
                    for (batch_id, state) in &self.batch_states {
                        if let Some(phase) = state.current_phase() {
                            let running = self.db.query_running_nodes(*batch_id, phase).await?;
                            println!(
                                "Batch {batch_id}: {} nodes currently running {phase}: {running:?}",
                                running.len()
                            );
                            displayed = true;
                        }
                    }
                    if !displayed {
                        println!("No nodes are currently running");
                    }
                }
                "barrier" | "b" => {
                    let mut displayed = false;
                    for (batch_id, state) in &self.batch_states {
                        if let Some(phase) = state.current_phase()
                            && let Some((barrier, waiting, job_id)) =
                                self.db.query_barrier(phase, *batch_id).await?
                        {
                            let job_suffix = job_id
                                .map(|id| format!(" job {id}"))
                                .unwrap_or_default();
                            println!("Barrier {barrier}{job_suffix} waiting for nodes: {waiting:?}");
                            displayed = true;
                        }
                    }
                    if !displayed {
                        println!("No nodes waiting on barriers");
                    }
                }
                "time" | "t" => {
                    let mut displayed = false;
                    for (batch_id, state) in &self.batch_states {
                        if let Some(phase) = state.current_phase() {
                            println!(
                                "Batch {batch_id} running {phase} for {:.2} seconds",
                                state.phase_elapsed_secs()
                            );
                            displayed = true;
                        }
                    }
                    if !displayed {
                        println!("No jobs currently running");
                    }
                }
                "help" | "h" => print_keyboard_commands(),
                other => println!("Unknown command '{other}'"),
            }
        }

        Ok(())
    }
}

/// True when every spec in the group carries identical SKIP_PHASE_*
/// overrides. Checked both at submission and again at dispatch, since
/// jobs sharing a batch share phases one and two.
pub fn skip_flags_agree<'a>(mut specs: impl Iterator<Item = &'a JobSpec>) -> bool {
    let Some(first) = specs.next() else {
        return true;
    };
    let reference = skip_signature(first);
    specs.all(|spec| skip_signature(spec) == reference)
}

fn skip_signature(spec: &JobSpec) -> [Option<bool>; 4] {
    std::array::from_fn(|index| {
        let phase = PhaseName::from_index(index).expect("phase index in range");
        spec.skip_override(phase)
    })
}

fn print_keyboard_commands() {
    println!(
        "Keyboard commands:\n  \
         {} - Print list of nodes that have yet to reach the current barrier\n  \
         {} - Display this help information\n  \
         {} - Print list of running nodes\n  \
         {} - Print the running time of the current phase",
        style("barrier/b").bold(),
        style("help/h").bold(),
        style("running/r").bold(),
        style("time/t").bold(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_params(params: serde_json::Value) -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "input_directory": "local:///in",
            "intermediate_directory": "local:///int",
            "output_directory": "local:///out",
            "map_function": "m",
            "reduce_function": "r",
            "partition_function": "p",
            "job_title": "t",
            "params": params
        }))
        .unwrap()
    }

    #[test]
    fn matching_skip_flags_agree() {
        let a = spec_with_params(serde_json::json!({ "SKIP_PHASE_ONE": 0 }));
        let b = spec_with_params(serde_json::json!({ "SKIP_PHASE_ONE": 0 }));
        assert!(skip_flags_agree([&a, &b].into_iter()));
    }

    #[test]
    fn mismatched_skip_flags_do_not_agree() {
        let a = spec_with_params(serde_json::json!({ "SKIP_PHASE_ONE": 0 }));
        let b = spec_with_params(serde_json::json!({ "SKIP_PHASE_ONE": 1 }));
        assert!(!skip_flags_agree([&a, &b].into_iter()));
    }

    #[test]
    fn absent_and_explicit_flags_are_distinct() {
        // One job saying nothing and another explicitly skipping is a
        // mismatch: their effective plans could differ per config.
        let a = spec_with_params(serde_json::json!({}));
        let b = spec_with_params(serde_json::json!({ "SKIP_PHASE_TWO": 1 }));
        assert!(!skip_flags_agree([&a, &b].into_iter()));
    }

    #[test]
    fn single_job_groups_always_agree() {
        let a = spec_with_params(serde_json::json!({ "SKIP_PHASE_THREE": 1 }));
        assert!(skip_flags_agree([&a].into_iter()));
        assert!(skip_flags_agree(std::iter::empty::<&JobSpec>()));
    }
}
