//! Redis-backed implementation of the coordination store.
//!
//! [`CoordinatorDb`] is a thin, pooled wrapper whose methods are named
//! after the domain operations the coordinators perform. Key layout:
//!
//! - `nodes`, `dead_nodes` — cluster membership sets
//! - `keepalive:<host>` — TTL'd liveness entry holding the node pid
//! - `node_io_disks:<host>`, `node_local_disks:<host>`,
//!   `failed_local_disks:<host>` — per-node disk sets
//! - `ipv4_address`, `hostname`, `interfaces` — address hashes
//! - `job_queue`, `next_job_id`, `coordinator_job_id`, `job_info:<id>`,
//!   `job_params:<id>`, `recovery_info:<id>` — job state
//! - `batch_jobs:<id>`, `batch_remaining:<id>`, `incomplete_batches`,
//!   `failed_batches`, `batch_queue:<host>` — batch state
//! - `<phase>_completed_nodes:batch_<id>`, `running_nodes:batch_<id>:<phase>`,
//!   `barrier:<kind>:<phase>:<id>:<job>` — phase synchronization
//! - `read_requests:<ip>`, `read_requests:<ip>:reader:<worker>` — read plans
//! - `node_failure_reports`, `ping_request:<host>`, `ping_reply:<host>`
//!
//! Status transitions are compare-and-set: the read-check-write runs as a
//! server-side script so a terminal status is never overwritten.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use deadpool_redis::{Connection, Pool, Runtime};
use thiserror::Error;
use tracing::warn;

use crate::types::{
    FailureReport, JobSpec, JobStatus, PhaseName, ReadRequest, RecoveryInfo, param_to_string,
};

/// TTL applied to barriers and running-node sets so abandoned batches do
/// not clutter the database forever.
const WEEK_SECONDS: u64 = 604_800;

/// Compare-and-set over the `status` field of a `job_info` hash. ARGV[1]
/// is the expected status ("" to skip the check), ARGV[2] the new status
/// ("" to leave it alone), and the remainder are field/value pairs.
const UPDATE_STATUS_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if ARGV[1] == '' or status == ARGV[1] then
  if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'status', ARGV[2])
  end
  for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  end
  return 1
end
return 0
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create store connection pool: {0}")]
    Pool(#[from] deadpool_redis::CreatePoolError),

    #[error("Failed to check out a store connection: {0}")]
    Checkout(#[from] deadpool_redis::PoolError),

    #[error("Store command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("Job {0} already has a job_info entry")]
    JobExists(u64),

    #[error("Malformed store payload: {0}")]
    Payload(String),
}

/// Wrapper around the coordination database shared by every component of
/// the control plane.
#[derive(Clone)]
pub struct CoordinatorDb {
    pool: Pool,
    update_status: Arc<redis::Script>,
}

impl CoordinatorDb {
    /// Connect to the store at `host:port`, database `db`.
    pub fn connect(host: &str, port: u16, db: i64) -> Result<Self, StoreError> {
        let url = format!("redis://{host}:{port}/{db}");
        let pool = deadpool_redis::Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;

        Ok(Self {
            pool,
            update_status: Arc::new(redis::Script::new(UPDATE_STATUS_SCRIPT)),
        })
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    // ---------------------------------------------------------------
    // Cluster membership and node attributes
    // ---------------------------------------------------------------

    pub async fn known_nodes(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.conn().await?;
        let nodes: Vec<String> = redis::cmd("SMEMBERS")
            .arg("nodes")
            .query_async(&mut conn)
            .await?;
        Ok(nodes.into_iter().collect())
    }

    /// Nodes whose keepalive has not been declared dead.
    pub async fn live_nodes(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.conn().await?;
        let nodes: Vec<String> = redis::cmd("SDIFF")
            .arg("nodes")
            .arg("dead_nodes")
            .query_async(&mut conn)
            .await?;
        Ok(nodes.into_iter().collect())
    }

    pub async fn declare_host_dead(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg("dead_nodes")
            .arg(hostname)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn declare_host_alive(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SREM")
            .arg("dead_nodes")
            .arg(hostname)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Input disks for a node, sorted for stable worker indexing.
    pub async fn io_disks(&self, hostname: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut disks: Vec<String> = redis::cmd("SMEMBERS")
            .arg(format!("node_io_disks:{hostname}"))
            .query_async(&mut conn)
            .await?;
        disks.sort();
        Ok(disks)
    }

    /// Intermediate disks for a node that have not failed, sorted.
    pub async fn local_disks(&self, hostname: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut disks: Vec<String> = redis::cmd("SDIFF")
            .arg(format!("node_local_disks:{hostname}"))
            .arg(format!("failed_local_disks:{hostname}"))
            .query_async(&mut conn)
            .await?;
        disks.sort();
        Ok(disks)
    }

    pub async fn mark_local_disk_failed(
        &self,
        hostname: &str,
        disk: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg(format!("failed_local_disks:{hostname}"))
            .arg(disk)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn hostname(&self, ipv4_address: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg("hostname")
            .arg(ipv4_address)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn ipv4_address(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg("ipv4_address")
            .arg(hostname)
            .query_async(&mut conn)
            .await?)
    }

    /// Comma-joined per-interface IPs for a node.
    pub async fn interfaces(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg("interfaces")
            .arg(hostname)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn num_interfaces(&self) -> Result<u32, StoreError> {
        let mut conn = self.conn().await?;
        let count: Option<u32> = redis::cmd("GET")
            .arg("num_interfaces")
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(1))
    }

    // ---------------------------------------------------------------
    // Keepalives
    // ---------------------------------------------------------------

    pub async fn create_keepalive(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(format!("keepalive:{hostname}"))
            .arg("-1")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Record the node coordinator's pid in its keepalive entry.
    pub async fn update_pid(&self, hostname: &str, pid: u32) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(format!("keepalive:{hostname}"))
            .arg(pid)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn refresh_keepalive(
        &self,
        hostname: &str,
        timeout_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(format!("keepalive:{hostname}"))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Whether the node's keepalive entry is still present.
    pub async fn keepalive_refreshed(&self, hostname: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(format!("keepalive:{hostname}"))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    pub async fn node_coordinator_pid(&self, hostname: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn().await?;
        let pid: Option<i64> = redis::cmd("GET")
            .arg(format!("keepalive:{hostname}"))
            .query_async(&mut conn)
            .await?;
        Ok(pid.filter(|pid| *pid > 0))
    }

    // ---------------------------------------------------------------
    // Job queue and job info
    // ---------------------------------------------------------------

    /// Pop the next atomically-submitted job group off the queue and
    /// allocate an id for each spec in it. Returns an empty vector when
    /// the queue is idle.
    pub async fn next_job(&self) -> Result<Vec<(JobSpec, u64)>, StoreError> {
        let mut conn = self.conn().await?;

        let payload: Option<String> = redis::cmd("LPOP")
            .arg("job_queue")
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(Vec::new());
        };

        // A submission is either a single spec or a list of specs.
        let specs: Vec<JobSpec> = match serde_json::from_str::<serde_json::Value>(&payload) {
            Ok(serde_json::Value::Array(_)) => serde_json::from_str(&payload)
                .map_err(|e| StoreError::Payload(format!("job group: {e}")))?,
            Ok(_) => vec![
                serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Payload(format!("job spec: {e}")))?,
            ],
            Err(e) => return Err(StoreError::Payload(format!("job submission: {e}"))),
        };

        let mut specs_with_ids = Vec::with_capacity(specs.len());

        for spec in specs {
            let job_id: u64 = redis::cmd("INCR")
                .arg("next_job_id")
                .query_async(&mut conn)
                .await?;

            let name = spec.job_name.clone().ok_or_else(|| {
                StoreError::Payload(format!("job {job_id} submitted without a job_name"))
            })?;

            let _: () = redis::cmd("HSET")
                .arg("coordinator_job_id")
                .arg(&name)
                .arg(job_id)
                .query_async(&mut conn)
                .await?;

            specs_with_ids.push((spec, job_id));
        }

        Ok(specs_with_ids)
    }

    pub async fn submit_jobs(&self, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("RPUSH")
            .arg("job_queue")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn clear_job_queue(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg("job_queue")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn job_id_for_name(&self, job_name: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg("coordinator_job_id")
            .arg(job_name)
            .query_async(&mut conn)
            .await?)
    }

    /// Create the `job_info` hash a submitter polls for status changes.
    /// The id must be fresh.
    pub async fn new_job_info(&self, job_id: u64, spec: &JobSpec) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;

        let key = format!("job_info:{job_id}");
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        if exists {
            return Err(StoreError::JobExists(job_id));
        }

        let name = spec.job_name.clone().unwrap_or_default();

        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("job_id")
            .arg(job_id)
            .arg("job_name")
            .arg(name)
            .arg("status")
            .arg(JobStatus::InProgress.as_str())
            .arg("fail_message")
            .arg("")
            .arg("input_directory")
            .arg(&spec.input_directory)
            .arg("intermediate_directory")
            .arg(&spec.intermediate_directory)
            .arg("output_directory")
            .arg(&spec.output_directory)
            .arg("map_function")
            .arg(&spec.map_function)
            .arg("reduce_function")
            .arg(&spec.reduce_function)
            .arg("partition_function")
            .arg(&spec.partition_function)
            .arg("job_title")
            .arg(&spec.job_title)
            .arg("total_input_size_bytes")
            .arg("Unknown")
            .query_async(&mut conn)
            .await?;

        if let Some(params) = &spec.params {
            for (param, value) in params {
                let _: () = redis::cmd("HSET")
                    .arg(format!("job_params:{job_id}"))
                    .arg(param)
                    .arg(param_to_string(value))
                    .query_async(&mut conn)
                    .await?;
            }
        }

        Ok(())
    }

    /// Apply `field_changes` to a job's info hash, optionally gated on the
    /// current status and optionally moving to a new status. Returns false
    /// when the gate did not match, in which case nothing was written.
    pub async fn update_job_status(
        &self,
        job_id: u64,
        field_changes: &[(String, String)],
        pre_status: Option<JobStatus>,
        post_status: Option<JobStatus>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let mut invocation = self.update_status.prepare_invoke();
        invocation
            .key(format!("job_info:{job_id}"))
            .arg(pre_status.map(|s| s.as_str()).unwrap_or(""))
            .arg(post_status.map(|s| s.as_str()).unwrap_or(""));
        for (field, value) in field_changes {
            invocation.arg(field).arg(value);
        }

        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    pub async fn job_info(&self, job_id: u64) -> Result<BTreeMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGETALL")
            .arg(format!("job_info:{job_id}"))
            .query_async(&mut conn)
            .await?)
    }

    /// Job-scoped parameters, empty when none were submitted.
    pub async fn job_params(&self, job_id: u64) -> Result<BTreeMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGETALL")
            .arg(format!("job_params:{job_id}"))
            .query_async(&mut conn)
            .await?)
    }

    // ---------------------------------------------------------------
    // Recovery bookkeeping
    // ---------------------------------------------------------------

    pub async fn setup_recovery_job(
        &self,
        job_id: u64,
        recovering_job: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("HSET")
            .arg(format!("recovery_info:{job_id}"))
            .arg("recovering_job")
            .arg(recovering_job)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn recovery_info(&self, job_id: u64) -> Result<Option<RecoveryInfo>, StoreError> {
        let mut conn = self.conn().await?;
        let recovering: Option<u64> = redis::cmd("HGET")
            .arg(format!("recovery_info:{job_id}"))
            .arg("recovering_job")
            .query_async(&mut conn)
            .await?;
        Ok(recovering.map(|recovering_job| RecoveryInfo { recovering_job }))
    }

    pub async fn global_boundary_list_file(
        &self,
        job_id: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg("disk_backed_boundary_lists")
            .arg(job_id)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn set_global_boundary_list_file(
        &self,
        job_id: u64,
        path: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("HSET")
            .arg("disk_backed_boundary_lists")
            .arg(job_id)
            .arg(path)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Register a `[start, stop]` partition interval a recovering job must
    /// regenerate.
    pub async fn add_recovery_partition_range(
        &self,
        job_id: u64,
        range_start: u64,
        range_stop: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg(format!("recovering_partitions:{job_id}"))
            .arg(format!("{range_start}-{range_stop}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// All registered recovery intervals for a job, sorted by start.
    pub async fn recovering_partitions(&self, job_id: u64) -> Result<Vec<(u64, u64)>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(format!("recovering_partitions:{job_id}"))
            .query_async(&mut conn)
            .await?;

        let mut ranges = Vec::with_capacity(raw.len());
        for entry in raw {
            let (start, stop) = entry.split_once('-').ok_or_else(|| {
                StoreError::Payload(format!("malformed partition range '{entry}'"))
            })?;
            let start = start
                .parse()
                .map_err(|_| StoreError::Payload(format!("malformed partition range '{entry}'")))?;
            let stop = stop
                .parse()
                .map_err(|_| StoreError::Payload(format!("malformed partition range '{entry}'")))?;
            ranges.push((start, stop));
        }
        ranges.sort();
        Ok(ranges)
    }

    // ---------------------------------------------------------------
    // Batch lifecycle
    // ---------------------------------------------------------------

    /// Allocate the next batch id, clearing any stale job listing left
    /// over from a previous run of the store.
    pub async fn next_batch_id(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let batch_id: u64 = redis::cmd("INCR")
            .arg("next_batch_id")
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("DEL")
            .arg(format!("batch_jobs:{batch_id}"))
            .query_async(&mut conn)
            .await?;
        Ok(batch_id)
    }

    pub async fn add_jobs_to_batch(&self, batch_id: u64, jobs: &[u64]) -> Result<(), StoreError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(format!("batch_jobs:{batch_id}"));
        for job_id in jobs {
            cmd.arg(*job_id);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn batch_jobs(&self, batch_id: u64) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LRANGE")
            .arg(format!("batch_jobs:{batch_id}"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?)
    }

    /// Track a freshly dispatched batch: it joins `incomplete_batches` and
    /// `batch_remaining` starts as the node set it was dispatched to.
    pub async fn mark_batch_incomplete(
        &self,
        batch_id: u64,
        nodes: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg("incomplete_batches")
            .arg(batch_id)
            .query_async(&mut conn)
            .await?;

        if nodes.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("SADD");
        cmd.arg(format!("batch_remaining:{batch_id}"));
        for node in nodes {
            cmd.arg(node);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn mark_batch_complete(&self, batch_id: u64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SREM")
            .arg("incomplete_batches")
            .arg(batch_id)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("DEL")
            .arg(format!("batch_remaining:{batch_id}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn node_completed_batch(
        &self,
        hostname: &str,
        batch_id: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SREM")
            .arg(format!("batch_remaining:{batch_id}"))
            .arg(hostname)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Whether `hostname` still has work outstanding for this batch.
    pub async fn batch_contains_node(
        &self,
        batch_id: u64,
        hostname: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("SISMEMBER")
            .arg(format!("batch_remaining:{batch_id}"))
            .arg(hostname)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn remaining_nodes_running_batch(&self, batch_id: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("SCARD")
            .arg(format!("batch_remaining:{batch_id}"))
            .query_async(&mut conn)
            .await?)
    }

    pub async fn incomplete_batches(&self) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn().await?;
        let mut batches: Vec<u64> = redis::cmd("SMEMBERS")
            .arg("incomplete_batches")
            .query_async(&mut conn)
            .await?;
        batches.sort();
        Ok(batches)
    }

    pub async fn batch_failed(&self, batch_id: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("SISMEMBER")
            .arg("failed_batches")
            .arg(batch_id)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn fail_batch(&self, batch_id: u64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg("failed_batches")
            .arg(batch_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Hand a batch to every node it was dispatched to.
    pub async fn enqueue_batch(
        &self,
        batch_id: u64,
        nodes: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        for node in nodes {
            let _: () = redis::cmd("RPUSH")
                .arg(format!("batch_queue:{node}"))
                .arg(batch_id)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    pub async fn clear_batch_queue(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(format!("batch_queue:{hostname}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Block until the next batch id arrives on this node's queue.
    pub async fn blocking_wait_for_next_batch(&self, hostname: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, u64)> = redis::cmd("BLPOP")
            .arg(format!("batch_queue:{hostname}"))
            .arg(0)
            .query_async(&mut conn)
            .await?;
        popped
            .map(|(_, batch_id)| batch_id)
            .ok_or_else(|| StoreError::Payload("blocking pop returned no batch".to_string()))
    }

    // ---------------------------------------------------------------
    // Phase progress and barriers
    // ---------------------------------------------------------------

    /// Mark every live node as running `phase` of `batch_id`.
    pub async fn begin_phase(&self, batch_id: u64, phase: PhaseName) -> Result<(), StoreError> {
        let ips = self.live_node_ips().await?;
        if ips.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let key = format!("running_nodes:batch_{batch_id}:{phase}");
        let mut cmd = redis::cmd("SADD");
        cmd.arg(&key);
        for ip in &ips {
            cmd.arg(ip);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(WEEK_SECONDS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Record that `node_ip` finished `phase` of `batch_id`.
    pub async fn phase_completed(
        &self,
        batch_id: u64,
        node_ip: &str,
        phase: PhaseName,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("RPUSH")
            .arg(format!("{phase}_completed_nodes:batch_{batch_id}"))
            .arg(node_ip)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("SREM")
            .arg(format!("running_nodes:batch_{batch_id}:{phase}"))
            .arg(node_ip)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Pop one node that completed `phase`, if any.
    pub async fn completed_node_for_phase(
        &self,
        batch_id: u64,
        phase: PhaseName,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LPOP")
            .arg(format!("{phase}_completed_nodes:batch_{batch_id}"))
            .query_async(&mut conn)
            .await?)
    }

    pub async fn query_running_nodes(
        &self,
        batch_id: u64,
        phase: PhaseName,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut nodes: Vec<String> = redis::cmd("SMEMBERS")
            .arg(format!("running_nodes:batch_{batch_id}:{phase}"))
            .query_async(&mut conn)
            .await?;
        nodes.sort();
        Ok(nodes)
    }

    /// Create the `phase_start` and `sockets_connected` barriers for each
    /// phase in the batch. Per-job phases get one barrier set per job;
    /// batch-global phases use job index 0.
    pub async fn create_barriers(
        &self,
        phases: &[PhaseName],
        batch_id: u64,
        batch_jobs: &[u64],
    ) -> Result<(), StoreError> {
        let ips = self.live_node_ips().await?;
        if ips.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;

        for barrier in ["phase_start", "sockets_connected"] {
            for phase in phases {
                let job_slots: Vec<u64> = if phase.is_per_job() {
                    batch_jobs.to_vec()
                } else {
                    vec![0]
                };

                for job_id in job_slots {
                    let key = format!("barrier:{barrier}:{phase}:{batch_id}:{job_id}");
                    let mut cmd = redis::cmd("SADD");
                    cmd.arg(&key);
                    for ip in &ips {
                        cmd.arg(ip);
                    }
                    let _: () = cmd.query_async(&mut conn).await?;
                    let _: () = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(WEEK_SECONDS)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// The first non-empty barrier for `phase`, as (barrier kind, waiting
    /// nodes, job id for per-job phases).
    pub async fn query_barrier(
        &self,
        phase: PhaseName,
        batch_id: u64,
    ) -> Result<Option<(String, Vec<String>, Option<u64>)>, StoreError> {
        let job_slots: Vec<Option<u64>> = if phase.is_per_job() {
            self.batch_jobs(batch_id).await?.into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let mut conn = self.conn().await?;

        for job_slot in job_slots {
            for barrier in ["phase_start", "sockets_connected"] {
                let key = format!(
                    "barrier:{barrier}:{phase}:{batch_id}:{}",
                    job_slot.unwrap_or(0)
                );
                let waiting: Vec<String> =
                    redis::cmd("SMEMBERS").arg(&key).query_async(&mut conn).await?;
                if !waiting.is_empty() {
                    return Ok(Some((barrier.to_string(), waiting, job_slot)));
                }
            }
        }

        Ok(None)
    }

    async fn live_node_ips(&self) -> Result<Vec<String>, StoreError> {
        let mut ips = Vec::new();
        for node in self.live_nodes().await? {
            if let Some(ip) = self.ipv4_address(&node).await? {
                ips.push(ip);
            }
        }
        Ok(ips)
    }

    // ---------------------------------------------------------------
    // Failure reports
    // ---------------------------------------------------------------

    pub async fn report_failure(&self, report: &FailureReport) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(report)
            .map_err(|e| StoreError::Payload(format!("failure report: {e}")))?;
        let _: () = redis::cmd("RPUSH")
            .arg("node_failure_reports")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Pop the next decodable failure report. A report naming a path on an
    /// intermediate disk is normalized to the disk's mount point; reports
    /// naming no known disk are dropped.
    pub async fn next_failure_report(&self) -> Result<Option<FailureReport>, StoreError> {
        loop {
            let payload: Option<String> = {
                let mut conn = self.conn().await?;
                redis::cmd("LPOP")
                    .arg("node_failure_reports")
                    .query_async(&mut conn)
                    .await?
            };

            let Some(payload) = payload else {
                return Ok(None);
            };

            let mut report: FailureReport = match serde_json::from_str(&payload) {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable failure report");
                    continue;
                }
            };

            let Some(reported_path) = report.disk.clone() else {
                return Ok(Some(report));
            };

            let local_disks = self.local_disks(&report.hostname).await?;
            match local_disks
                .iter()
                .find(|disk| reported_path.starts_with(disk.as_str()))
            {
                Some(disk) => {
                    report.disk = Some(disk.clone());
                    return Ok(Some(report));
                }
                None => {
                    warn!(
                        host = %report.hostname,
                        path = %reported_path,
                        "dropping failure report for unknown disk"
                    );
                    continue;
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // All-cluster ping
    // ---------------------------------------------------------------

    pub async fn send_ping_request(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("RPUSH")
            .arg(format!("ping_request:{hostname}"))
            .arg("go")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn wait_for_ping_request(&self, hostname: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(format!("ping_request:{hostname}"))
            .arg(0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn send_ping_reply(&self, hostname: &str, reply: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("RPUSH")
            .arg(format!("ping_reply:{hostname}"))
            .arg(reply)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn wait_for_ping_reply(&self, hostname: &str) -> Result<String, StoreError> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(format!("ping_reply:{hostname}"))
            .arg(0)
            .query_async(&mut conn)
            .await?;
        popped
            .map(|(_, reply)| reply)
            .ok_or_else(|| StoreError::Payload("blocking pop returned no ping reply".to_string()))
    }

    // ---------------------------------------------------------------
    // Read-request queues
    // ---------------------------------------------------------------

    /// Append read requests to the queue for worker `worker_id` on the
    /// node at `host_ip`, registering the queue in the node's queue set.
    pub async fn add_read_requests(
        &self,
        host_ip: &str,
        worker_id: usize,
        requests: &[ReadRequest],
    ) -> Result<(), StoreError> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let queue_key = format!("read_requests:{host_ip}:reader:{worker_id}");

        let _: () = redis::cmd("SADD")
            .arg(format!("read_requests:{host_ip}"))
            .arg(&queue_key)
            .query_async(&mut conn)
            .await?;

        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(&queue_key);
        for request in requests {
            let payload = serde_json::to_string(request)
                .map_err(|e| StoreError::Payload(format!("read request: {e}")))?;
            cmd.arg(payload);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// Names of the read-request queues registered for a node, sorted.
    pub async fn read_request_queues(&self, host_ip: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(format!("read_requests:{host_ip}"))
            .query_async(&mut conn)
            .await?;
        queues.sort();
        Ok(queues)
    }

    pub async fn read_queue_contents(
        &self,
        queue_key: &str,
    ) -> Result<Vec<ReadRequest>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(queue_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        raw.iter()
            .map(|payload| {
                serde_json::from_str(payload)
                    .map_err(|e| StoreError::Payload(format!("read request: {e}")))
            })
            .collect()
    }

    pub async fn flush_read_queue(&self, queue_key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
