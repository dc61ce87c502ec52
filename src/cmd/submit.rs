//! `themis submit` — submit a job specification file.
//!
//! The file holds a single job object, a list of jobs (one batch
//! submitted atomically), or a list of lists (an ordered sequence of
//! batches). Jobs without a `job_name` get one generated as
//! `user@host:unix-time:index`. With `--wait`, submission blocks until
//! every job in every batch reaches a terminal status.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;

use themis_store::{CoordinatorDb, JobSpec};

use crate::cluster::skip_flags_agree;
use crate::cmd::StoreOptions;
use crate::util::{current_username, unix_time_secs};

pub async fn cmd_submit(store: &StoreOptions, spec_file: &Path, wait: bool) -> Result<()> {
    let content = std::fs::read_to_string(spec_file)
        .with_context(|| format!("Failed to read job spec file: {}", spec_file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job spec file: {}", spec_file.display()))?;

    let batches = normalize_submission(value)?;
    let db = store.connect()?;

    let mut all_jobs_succeeded = true;

    for mut batch in batches {
        if !skip_flags_agree(batch.iter()) {
            bail!("Not all jobs in the batch have the same SKIP_PHASE_* values");
        }

        let job_names = assign_job_names(&mut batch);

        let payload = serde_json::to_string(&batch).context("Failed to serialize job batch")?;
        db.submit_jobs(&payload).await?;

        if !wait {
            for name in &job_names {
                println!("Submitted job '{name}'");
            }
            continue;
        }

        for name in &job_names {
            println!("Waiting on completion of job '{name}'");
            let succeeded = wait_for_job(&db, name).await?;
            all_jobs_succeeded = all_jobs_succeeded && succeeded;
        }
    }

    if !all_jobs_succeeded {
        bail!("one or more jobs failed");
    }

    Ok(())
}

/// Massage the submitted JSON into an ordered list of batches.
fn normalize_submission(value: serde_json::Value) -> Result<Vec<Vec<JobSpec>>> {
    match value {
        serde_json::Value::Object(_) => {
            let spec: JobSpec = serde_json::from_value(value).context("Invalid job spec")?;
            Ok(vec![vec![spec]])
        }
        serde_json::Value::Array(items) => {
            let is_sequence_of_batches = items.iter().all(|item| item.is_array());

            if is_sequence_of_batches && !items.is_empty() {
                items
                    .into_iter()
                    .map(|batch| serde_json::from_value(batch).context("Invalid job batch"))
                    .collect()
            } else {
                let batch: Vec<JobSpec> = serde_json::from_value(serde_json::Value::Array(items))
                    .context("Invalid job batch")?;
                Ok(vec![batch])
            }
        }
        _ => bail!("Job spec file must hold an object or a list"),
    }
}

/// Fill in a generated name for every job that lacks one, returning the
/// full name list in batch order.
fn assign_job_names(batch: &mut [JobSpec]) -> Vec<String> {
    let username = current_username();
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let submitted_at = unix_time_secs() as u64;

    batch
        .iter_mut()
        .enumerate()
        .map(|(index, spec)| {
            spec.job_name
                .get_or_insert_with(|| format!("{username}@{hostname}:{submitted_at}:{index}"))
                .clone()
        })
        .collect()
}

/// Poll the store until the named job reaches a terminal status. A job
/// is only done once its batch has fully drained, so the poll also
/// watches `batch_remaining`.
async fn wait_for_job(db: &CoordinatorDb, job_name: &str) -> Result<bool> {
    let poll = Duration::from_secs(1);

    let job_id = loop {
        if let Some(job_id) = db.job_id_for_name(job_name).await? {
            break job_id;
        }
        tokio::time::sleep(poll).await;
    };

    loop {
        let job_info = db.job_info(job_id).await?;
        let status = job_info.get("status").map(String::as_str).unwrap_or("");

        match status {
            "Failed" => {
                println!(
                    "Job '{job_name}' completed with status '{}'",
                    style("Failed").red()
                );
                return Ok(false);
            }
            "Complete" => {
                // The batch itself must drain before the output is
                // fully settled.
                if let Some(batch_id) = job_info.get("batch_id").and_then(|v| v.parse().ok())
                    && db.remaining_nodes_running_batch(batch_id).await? == 0
                {
                    println!(
                        "Job '{job_name}' completed with status '{}'",
                        style("Complete").green()
                    );
                    return Ok(true);
                }
            }
            _ => {}
        }

        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: Option<&str>) -> serde_json::Value {
        let mut value = serde_json::json!({
            "input_directory": "local:///in",
            "intermediate_directory": "local:///int",
            "output_directory": "local:///out",
            "map_function": "m",
            "reduce_function": "r",
            "partition_function": "p",
            "job_title": "t"
        });
        if let Some(name) = name {
            value["job_name"] = serde_json::json!(name);
        }
        value
    }

    #[test]
    fn single_object_becomes_one_batch() {
        let batches = normalize_submission(job(Some("j1"))).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].job_name.as_deref(), Some("j1"));
    }

    #[test]
    fn flat_list_is_one_atomic_batch() {
        let batches =
            normalize_submission(serde_json::json!([job(Some("a")), job(Some("b"))])).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn list_of_lists_is_a_sequence_of_batches() {
        let batches = normalize_submission(serde_json::json!([
            [job(Some("a")), job(Some("b"))],
            [job(Some("c"))]
        ]))
        .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn scalar_submissions_are_rejected() {
        assert!(normalize_submission(serde_json::json!(42)).is_err());
    }

    #[test]
    fn generated_names_are_unique_within_a_batch() {
        let mut batch: Vec<JobSpec> = vec![
            serde_json::from_value(job(None)).unwrap(),
            serde_json::from_value(job(None)).unwrap(),
        ];

        let names = assign_job_names(&mut batch);
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names[0].ends_with(":0"));
        assert!(names[1].ends_with(":1"));
    }

    #[test]
    fn explicit_names_are_kept() {
        let mut batch: Vec<JobSpec> = vec![serde_json::from_value(job(Some("mine"))).unwrap()];
        let names = assign_job_names(&mut batch);
        assert_eq!(names, vec!["mine"]);
    }
}
