//! Integration tests for the Themis CLI.
//!
//! These exercise the store-free surfaces of the binary: argument
//! parsing, the file-listing helper used over ssh, and job-spec
//! validation at submission.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a themis Command
fn themis() -> Command {
    cargo_bin_cmd!("themis")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_themis_help() {
        themis().arg("--help").assert().success();
    }

    #[test]
    fn test_themis_version() {
        themis().arg("--version").assert().success();
    }

    #[test]
    fn test_cluster_requires_binary_and_config() {
        themis().arg("cluster").assert().failure();
    }

    #[test]
    fn test_queues_requires_an_action() {
        themis().arg("queues").assert().failure();
    }
}

// =============================================================================
// list-files helper
// =============================================================================

mod list_files {
    use super::*;

    #[test]
    fn test_lists_files_with_lengths_as_json() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("nested")).unwrap();
        fs::write(data.join("a.dat"), vec![0u8; 128]).unwrap();
        fs::write(data.join("nested/b.dat"), vec![0u8; 64]).unwrap();

        let output = themis()
            .arg("list-files")
            .arg(data.to_str().unwrap())
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let listing: Vec<Vec<(String, u64)>> =
            serde_json::from_slice(&output).expect("listing is JSON");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].len(), 2);
        assert!(listing[0][0].0.ends_with("a.dat"));
        assert_eq!(listing[0][0].1, 128);
        assert_eq!(listing[0][1].1, 64);
    }

    #[test]
    fn test_missing_directory_prints_null() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");

        themis()
            .arg("list-files")
            .arg(missing.to_str().unwrap())
            .assert()
            .success()
            .stdout(predicate::str::contains("null"));
    }

    #[test]
    fn test_one_listing_per_directory() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("one");
        let second = dir.path().join("two");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("f"), b"x").unwrap();

        let output = themis()
            .arg("list-files")
            .arg(first.to_str().unwrap())
            .arg(second.to_str().unwrap())
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let listing: Vec<Vec<(String, u64)>> = serde_json::from_slice(&output).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].len(), 1);
        assert!(listing[1].is_empty());
    }
}

// =============================================================================
// Submission validation
// =============================================================================

mod submit {
    use super::*;

    fn job_json(name: &str, params: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "job_name": name,
            "input_directory": "local:///data/in",
            "intermediate_directory": "local:///data/int",
            "output_directory": "local:///data/out",
            "map_function": "WordCountMap",
            "reduce_function": "WordCountReduce",
            "partition_function": "HashPartition",
            "job_title": "wordcount",
            "params": params
        })
    }

    #[test]
    fn test_submit_requires_an_existing_file() {
        themis()
            .arg("submit")
            .arg("/nonexistent/job.json")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read job spec file"));
    }

    #[test]
    fn test_submit_rejects_malformed_json() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("job.json");
        fs::write(&spec, "{ not json }").unwrap();

        themis()
            .arg("submit")
            .arg(spec.to_str().unwrap())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse job spec file"));
    }

    #[test]
    fn test_submit_rejects_scalar_specs() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("job.json");
        fs::write(&spec, "42").unwrap();

        themis()
            .arg("submit")
            .arg(spec.to_str().unwrap())
            .assert()
            .failure()
            .stderr(predicate::str::contains("object or a list"));
    }

    #[test]
    fn test_submit_rejects_mismatched_skip_flags() {
        // Jobs dispatched together share phases one and two, so their
        // skip flags have to agree.
        let batch = serde_json::json!([
            job_json("j1", serde_json::json!({ "SKIP_PHASE_ONE": 0 })),
            job_json("j2", serde_json::json!({ "SKIP_PHASE_ONE": 1 })),
        ]);

        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("batch.json");
        fs::write(&spec, serde_json::to_string(&batch).unwrap()).unwrap();

        themis()
            .arg("submit")
            .arg(spec.to_str().unwrap())
            .assert()
            .failure()
            .stderr(predicate::str::contains("SKIP_PHASE"));
    }
}
