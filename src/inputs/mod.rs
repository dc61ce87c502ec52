//! Input discovery.
//!
//! Given a job's input URL, enumerate the files present on every live
//! node's input disks and produce the per-(host, disk) layout the planner
//! consumes. Enumeration runs over ssh: each node executes this binary's
//! hidden `list-files` subcommand against its own disks and replies with
//! a JSON listing.
//!
//! A directory missing on any live host fails the whole job before the
//! batch is formed; the caller records the offending path in the job's
//! fail message.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use themis_store::CoordinatorDb;

use crate::errors::DiscoveryError;
use crate::planner::{FileInfo, WorkerInputs};

/// Per-disk listing as produced by `list-files`: one entry per requested
/// directory, each a list of (absolute path, length) pairs. `None` when
/// any requested directory does not exist.
pub type HostListing = Option<Vec<Vec<(String, u64)>>>;

/// Discovered inputs for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInputs {
    pub worker_inputs: WorkerInputs,
    pub total_input_size: u64,
}

/// Input-file discovery over the cluster.
pub struct InputDiscovery {
    /// Command executed on each remote host to list its disks, typically
    /// `themis list-files`.
    list_command: String,
}

impl InputDiscovery {
    pub fn new(list_command: impl Into<String>) -> Self {
        Self {
            list_command: list_command.into(),
        }
    }

    /// Enumerate a job's input files across all live nodes.
    ///
    /// `max_input_files_per_disk` caps each per-disk list to its first N
    /// entries after sorting by path, for test harnesses.
    pub async fn gather_input_file_paths(
        &self,
        db: &CoordinatorDb,
        input_url: &str,
        max_input_files_per_disk: Option<usize>,
    ) -> Result<JobInputs, DiscoveryError> {
        let (scheme, input_dir) = parse_input_url(input_url);

        if scheme != "local" {
            return Err(DiscoveryError::UnknownScheme {
                scheme: scheme.to_string(),
                url: input_url.to_string(),
            });
        }

        let hosts: Vec<String> = db.live_nodes().await?.into_iter().collect();

        let listings = try_join_all(hosts.iter().map(|host| {
            let input_dir = input_dir.clone();
            async move {
                let disks = db.io_disks(host).await?;
                let dirs: Vec<String> = disks
                    .iter()
                    .map(|disk| join_disk_path(disk, &input_dir))
                    .collect();
                let listing = self.list_host(host, &dirs).await?;
                Ok::<_, DiscoveryError>((host.clone(), listing))
            }
        }))
        .await?;

        let mut worker_inputs: WorkerInputs = BTreeMap::new();
        let mut total_input_size = 0u64;

        for (host, listing) in listings {
            let Some(per_disk) = listing else {
                return Err(DiscoveryError::MissingDirectory {
                    host,
                    directory: input_dir.clone(),
                });
            };

            let disks = listing_to_worker_inputs(
                &host,
                per_disk,
                max_input_files_per_disk,
                &mut total_input_size,
            );
            worker_inputs.insert(host, disks);
        }

        info!(
            input_url,
            total_input_size, "gathered input files for all live nodes"
        );

        Ok(JobInputs {
            worker_inputs,
            total_input_size,
        })
    }

    async fn list_host(&self, host: &str, dirs: &[String]) -> Result<HostListing, DiscoveryError> {
        let remote = format!("{} {}", self.list_command, dirs.join(" "));
        debug!(host, command = %remote, "listing input disks");

        let output = Command::new("ssh")
            .arg(host)
            .arg(&remote)
            .output()
            .await
            .map_err(|source| DiscoveryError::ListingSpawnFailed {
                host: host.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::ListingCommandFailed {
                host: host.to_string(),
                status: output.status.code().unwrap_or(-1),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|source| DiscoveryError::BadListing {
            host: host.to_string(),
            source,
        })
    }
}

/// Convert one host's per-disk listing into worker inputs, applying the
/// cap and accumulating total bytes for the files kept.
fn listing_to_worker_inputs(
    host: &str,
    per_disk: Vec<Vec<(String, u64)>>,
    max_input_files_per_disk: Option<usize>,
    total_input_size: &mut u64,
) -> BTreeMap<usize, Vec<FileInfo>> {
    let mut workers = BTreeMap::new();

    for (disk_index, mut files) in per_disk.into_iter().enumerate() {
        files.sort();
        if let Some(cap) = max_input_files_per_disk {
            files.truncate(cap);
        }

        let files: Vec<FileInfo> = files
            .into_iter()
            .map(|(path, length)| {
                *total_input_size += length;
                FileInfo {
                    url: format!("local://{host}{path}"),
                    length,
                }
            })
            .collect();

        workers.insert(disk_index, files);
    }

    workers
}

/// Walk each directory and collect (absolute path, length) for every
/// regular file under it. Returns `None` when any directory is missing,
/// which the coordinator treats as an input error for the whole job.
pub fn list_local_files(directories: &[String]) -> std::io::Result<HostListing> {
    let mut listing = Vec::with_capacity(directories.len());

    for directory in directories {
        let root = std::path::Path::new(directory);
        if !root.exists() {
            return Ok(None);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                let metadata = entry.metadata().map_err(std::io::Error::other)?;
                let path = entry.path().canonicalize()?;
                files.push((path.to_string_lossy().to_string(), metadata.len()));
            }
        }
        files.sort();
        listing.push(files);
    }

    Ok(Some(listing))
}

/// Split an input URL into scheme and path, defaulting to `local`.
fn parse_input_url(url: &str) -> (String, String) {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            // The path is everything from the first slash after the
            // authority; `local:///data` and `local://data` both mean
            // the cluster-relative path `/data`.
            let path = match rest.find('/') {
                Some(index) => rest[index..].to_string(),
                None => format!("/{rest}"),
            };
            (scheme.to_string(), path)
        }
        None => ("local".to_string(), url.to_string()),
    }
}

fn join_disk_path(disk: &str, input_dir: &str) -> String {
    format!(
        "{}/{}",
        disk.trim_end_matches('/'),
        input_dir.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_input_url_defaults_to_local() {
        assert_eq!(
            parse_input_url("/data/in"),
            ("local".to_string(), "/data/in".to_string())
        );
        assert_eq!(
            parse_input_url("local:///data/in"),
            ("local".to_string(), "/data/in".to_string())
        );
        assert_eq!(
            parse_input_url("weird://x/y"),
            ("weird".to_string(), "/y".to_string())
        );
    }

    #[test]
    fn join_disk_path_never_doubles_slashes() {
        assert_eq!(join_disk_path("/a", "/data/in"), "/a/data/in");
        assert_eq!(join_disk_path("/a/", "data/in"), "/a/data/in");
    }

    #[test]
    fn list_local_files_reports_missing_directories_as_none() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent").to_string_lossy().to_string();

        let listing = list_local_files(&[missing]).unwrap();
        assert!(listing.is_none());
    }

    #[test]
    fn list_local_files_walks_subtrees() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("b.dat"), vec![0u8; 10]).unwrap();
        std::fs::write(root.join("nested/a.dat"), vec![0u8; 4]).unwrap();

        let listing = list_local_files(&[root.to_string_lossy().to_string()])
            .unwrap()
            .unwrap();

        assert_eq!(listing.len(), 1);
        let files = &listing[0];
        assert_eq!(files.len(), 2);
        assert!(files[0].0.ends_with("b.dat"));
        assert_eq!(files[0].1, 10);
        assert!(files[1].0.ends_with("nested/a.dat"));
        assert_eq!(files[1].1, 4);
    }

    #[test]
    fn cap_truncates_after_sorting_by_path() {
        let per_disk = vec![vec![
            ("/a/zzz".to_string(), 5),
            ("/a/aaa".to_string(), 7),
            ("/a/mmm".to_string(), 9),
        ]];

        let mut total = 0;
        let workers = listing_to_worker_inputs("h1", per_disk, Some(2), &mut total);

        let files = &workers[&0];
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].url, "local://h1/a/aaa");
        assert_eq!(files[1].url, "local://h1/a/mmm");
        assert_eq!(total, 16);
    }

    #[test]
    fn urls_carry_the_owning_host() {
        let per_disk = vec![vec![("/disk0/data/f".to_string(), 1024)]];
        let mut total = 0;
        let workers = listing_to_worker_inputs("node-1.cluster", per_disk, None, &mut total);

        assert_eq!(workers[&0][0].url, "local://node-1.cluster/disk0/data/f");
        assert_eq!(total, 1024);
    }
}
