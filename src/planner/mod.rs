//! Read-request planner.
//!
//! Converts the per-job input listings produced by discovery into the
//! ordered read-request stream each data-plane worker consumes:
//!
//! - **Scan sharing**: when several jobs in a batch read the same file,
//!   one phase-one read carries all of their ids so a single disk scan
//!   feeds every consumer.
//! - **Phase zero**: per job, every file gets `SAMPLES_PER_FILE` sample
//!   windows spread evenly through the file, with window length and
//!   stride rounded down to whole tuples when the tuple length is fixed.
//! - **Phase one**: full-file scans, randomly permuted per worker so
//!   peers do not hammer their disks in the same order. The permutation
//!   is seeded from the (host, worker) pair so plans are reproducible.
//!
//! Queues are ordered: all of phase zero's requests precede phase one's,
//! and each phase ends with a halt marker for the jobs it served.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use themis_store::{CoordinatorDb, PhaseName, ReadRequest, StoreError};

use crate::errors::PlannerError;

/// One input file as discovered on a worker's disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    pub url: String,
    pub length: u64,
}

/// Input layout for one job: host → worker (input-disk index) → files,
/// in discovery order.
pub type WorkerInputs = BTreeMap<String, BTreeMap<usize, Vec<FileInfo>>>;

/// Planned queues: host → worker → ordered requests.
pub type ReadPlan = BTreeMap<String, BTreeMap<usize, Vec<ReadRequest>>>;

/// Phase-zero sampling parameters for a batch.
#[derive(Debug, Clone, Copy)]
pub struct SampleSettings {
    pub sample_rate: f64,
    pub sample_points_per_file: usize,
    /// Fixed tuple length, when the input format has one. Sample windows
    /// are rounded down to multiples of this so reads never split tuples.
    pub tuple_start_offset: Option<u64>,
}

/// Generate the read-request queues for a batch.
///
/// `job_inputs` is parallel to `job_ids`; `phases` selects which phases
/// to emit requests for (only phases zero and one read input files).
pub fn generate_read_requests(
    job_inputs: &[WorkerInputs],
    job_ids: &[u64],
    settings: &SampleSettings,
    phases: &[PhaseName],
) -> Result<ReadPlan, PlannerError> {
    if settings.sample_rate > 1.0 {
        return Err(PlannerError::SampleRateTooLarge(settings.sample_rate));
    }
    if settings.sample_points_per_file > 1 && settings.tuple_start_offset.unwrap_or(0) == 0 {
        return Err(PlannerError::MultiPointWithoutTupleOffset {
            points: settings.sample_points_per_file,
        });
    }

    let shared = scan_share(job_inputs, job_ids);
    let mut plan: ReadPlan = BTreeMap::new();

    if phases.contains(&PhaseName::Zero) {
        // Sample every file of the batch for each job, one job at a time,
        // closing each job's stream with its own halt marker.
        for &job_id in job_ids {
            for (host, workers) in &shared {
                for (worker, files) in workers {
                    let queue = plan
                        .entry(host.clone())
                        .or_default()
                        .entry(*worker)
                        .or_default();

                    for (file, _) in files {
                        let (window, stride) = sample_window(file, settings)?;
                        for point in 0..settings.sample_points_per_file.max(1) as u64 {
                            queue.push(ReadRequest::Read {
                                job_ids: vec![job_id],
                                path: file.url.clone(),
                                offset: point * stride,
                                length: window,
                            });
                        }
                    }

                    queue.push(ReadRequest::Halt {
                        job_ids: vec![job_id],
                    });
                }
            }
        }
    }

    if phases.contains(&PhaseName::One) {
        for (host, workers) in &shared {
            for (worker, files) in workers {
                let mut requests: Vec<ReadRequest> = files
                    .iter()
                    .map(|(file, consumers)| ReadRequest::Read {
                        job_ids: consumers.clone(),
                        path: file.url.clone(),
                        offset: 0,
                        length: file.length,
                    })
                    .collect();

                let mut rng = StdRng::seed_from_u64(worker_seed(host, *worker));
                requests.shuffle(&mut rng);

                let queue = plan
                    .entry(host.clone())
                    .or_default()
                    .entry(*worker)
                    .or_default();
                queue.extend(requests);
                queue.push(ReadRequest::Halt {
                    job_ids: job_ids.to_vec(),
                });
            }
        }
    }

    Ok(plan)
}

/// Load a plan's queues into the store, keyed by node IP.
pub async fn load_read_requests(db: &CoordinatorDb, plan: &ReadPlan) -> Result<(), StoreError> {
    for (hostname, workers) in plan {
        let Some(host_ip) = db.ipv4_address(hostname).await? else {
            tracing::warn!(host = %hostname, "no IPv4 address recorded; dropping read requests");
            continue;
        };

        for (worker_id, requests) in workers {
            db.add_read_requests(&host_ip, *worker_id, requests).await?;
        }
    }
    Ok(())
}

/// Merge the per-job inputs into host → worker → (file, consuming jobs),
/// preserving discovery order of files and submission order of jobs.
fn scan_share(
    job_inputs: &[WorkerInputs],
    job_ids: &[u64],
) -> BTreeMap<String, BTreeMap<usize, Vec<(FileInfo, Vec<u64>)>>> {
    let mut shared: BTreeMap<String, BTreeMap<usize, Vec<(FileInfo, Vec<u64>)>>> = BTreeMap::new();

    for (inputs, &job_id) in job_inputs.iter().zip(job_ids) {
        for (host, workers) in inputs {
            for (worker, files) in workers {
                let entries = shared
                    .entry(host.clone())
                    .or_default()
                    .entry(*worker)
                    .or_default();

                for file in files {
                    match entries.iter_mut().find(|(existing, _)| existing == file) {
                        Some((_, consumers)) => consumers.push(job_id),
                        None => entries.push((file.clone(), vec![job_id])),
                    }
                }
            }
        }
    }

    shared
}

/// Compute the (window length, stride) of a file's sample windows.
///
/// `window <= stride` always holds, and with a fixed tuple length both
/// are multiples of it. A window that rounds to zero bytes would produce
/// useless reads, so it is rejected here rather than at execution time.
fn sample_window(file: &FileInfo, settings: &SampleSettings) -> Result<(u64, u64), PlannerError> {
    let points = settings.sample_points_per_file.max(1) as u64;

    let sample_length = (file.length as f64 * settings.sample_rate).floor() as u64;
    let mut window = sample_length / points;
    let mut stride = file.length / points;

    if let Some(tuple) = settings.tuple_start_offset
        && tuple > 0
    {
        window -= window % tuple;
        stride -= stride % tuple;
    }

    if window == 0 {
        return Err(PlannerError::ZeroLengthSample {
            path: file.url.clone(),
        });
    }

    Ok((window, stride))
}

fn worker_seed(host: &str, worker: usize) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    worker.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(url: &str, length: u64) -> FileInfo {
        FileInfo {
            url: url.to_string(),
            length,
        }
    }

    fn full_scan_settings() -> SampleSettings {
        SampleSettings {
            sample_rate: 1.0,
            sample_points_per_file: 1,
            tuple_start_offset: None,
        }
    }

    /// Two nodes hosting one 1024-byte file per input disk, sampled at a
    /// quarter with 100-byte tuples.
    fn small_cluster_inputs() -> WorkerInputs {
        let mut inputs: WorkerInputs = BTreeMap::new();
        inputs.entry("h1".to_string()).or_default().insert(
            0,
            vec![file("local://h1/a/data/f", 1024)],
        );
        inputs
            .get_mut("h1")
            .unwrap()
            .insert(1, vec![file("local://h1/b/data/f", 1024)]);
        inputs.entry("h2".to_string()).or_default().insert(
            0,
            vec![file("local://h2/a/data/f", 1024)],
        );
        inputs
    }

    fn reads(queue: &[ReadRequest]) -> Vec<&ReadRequest> {
        queue
            .iter()
            .filter(|r| matches!(r, ReadRequest::Read { .. }))
            .collect()
    }

    #[test]
    fn single_job_prefix_samples_then_full_scans() {
        let inputs = small_cluster_inputs();
        let settings = SampleSettings {
            sample_rate: 0.25,
            sample_points_per_file: 1,
            tuple_start_offset: Some(100),
        };

        let plan = generate_read_requests(
            &[inputs],
            &[1],
            &settings,
            &[PhaseName::Zero, PhaseName::One],
        )
        .unwrap();

        let mut total_sample_reads = 0;
        for (_, workers) in &plan {
            for (_, queue) in workers {
                // sample read, halt, full read, halt
                assert_eq!(queue.len(), 4);

                match &queue[0] {
                    ReadRequest::Read {
                        job_ids,
                        offset,
                        length,
                        ..
                    } => {
                        assert_eq!(job_ids, &[1]);
                        assert_eq!(*offset, 0);
                        assert_eq!(*length, 200);
                        total_sample_reads += 1;
                    }
                    other => panic!("expected sample read, got {other:?}"),
                }
                assert_eq!(queue[1], ReadRequest::Halt { job_ids: vec![1] });

                match &queue[2] {
                    ReadRequest::Read {
                        job_ids,
                        offset,
                        length,
                        ..
                    } => {
                        assert_eq!(job_ids, &[1]);
                        assert_eq!(*offset, 0);
                        assert_eq!(*length, 1024);
                    }
                    other => panic!("expected full scan, got {other:?}"),
                }
                assert_eq!(queue[3], ReadRequest::Halt { job_ids: vec![1] });
            }
        }

        assert_eq!(total_sample_reads, 3);
    }

    #[test]
    fn scan_share_tags_reads_with_every_consuming_job() {
        // Job 1 and job 2 read the same directory, plus a file only job 1
        // declares.
        let mut job1: WorkerInputs = BTreeMap::new();
        job1.entry("h1".to_string()).or_default().insert(
            0,
            vec![file("shared_a", 1000), file("only_job_1", 500)],
        );
        let mut job2: WorkerInputs = BTreeMap::new();
        job2.entry("h1".to_string())
            .or_default()
            .insert(0, vec![file("shared_a", 1000)]);

        let plan = generate_read_requests(
            &[job1, job2],
            &[1, 2],
            &full_scan_settings(),
            &[PhaseName::Zero, PhaseName::One],
        )
        .unwrap();

        let queue = &plan["h1"][&0];

        // Phase zero: both jobs sample the batch's merged file set, each
        // group closed by its own halt.
        assert_eq!(queue[0].job_ids(), &[1]);
        assert_eq!(queue[1].job_ids(), &[1]);
        assert_eq!(queue[2], ReadRequest::Halt { job_ids: vec![1] });
        assert_eq!(queue[3].job_ids(), &[2]);
        assert_eq!(queue[4].job_ids(), &[2]);
        assert_eq!(queue[5], ReadRequest::Halt { job_ids: vec![2] });

        // Phase one: each file read exactly once, tagged with exactly the
        // jobs that declared it, ending in a batch-wide halt.
        let phase_one = &queue[6..];
        assert_eq!(
            phase_one.last(),
            Some(&ReadRequest::Halt { job_ids: vec![1, 2] })
        );

        let scans = reads(phase_one);
        assert_eq!(scans.len(), 2);
        for scan in scans {
            match scan {
                ReadRequest::Read { job_ids, path, .. } if path == "shared_a" => {
                    assert_eq!(job_ids, &[1, 2]);
                }
                ReadRequest::Read { job_ids, path, .. } if path == "only_job_1" => {
                    assert_eq!(job_ids, &[1]);
                }
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    #[test]
    fn sample_windows_are_tuple_aligned_and_fit_the_stride() {
        let mut inputs: WorkerInputs = BTreeMap::new();
        inputs
            .entry("h1".to_string())
            .or_default()
            .insert(0, vec![file("f", 1000)]);

        let settings = SampleSettings {
            sample_rate: 0.5,
            sample_points_per_file: 3,
            tuple_start_offset: Some(7),
        };

        let plan =
            generate_read_requests(&[inputs], &[1], &settings, &[PhaseName::Zero]).unwrap();
        let queue = &plan["h1"][&0];
        let sample_reads = reads(queue);
        assert_eq!(sample_reads.len(), 3);

        // 500 bytes sampled over 3 points: window 161, stride 329 after
        // rounding both down to multiples of 7.
        for (point, request) in sample_reads.iter().enumerate() {
            let ReadRequest::Read { offset, length, .. } = request else {
                unreachable!()
            };
            assert_eq!(*length, 161);
            assert_eq!(*offset, point as u64 * 329);
            assert_eq!(*length % 7, 0);
            assert_eq!(*offset % 7, 0);
            assert!(*length <= 329);
        }
    }

    #[test]
    fn zero_length_sample_window_is_rejected() {
        let mut inputs: WorkerInputs = BTreeMap::new();
        inputs
            .entry("h1".to_string())
            .or_default()
            .insert(0, vec![file("tiny", 10)]);

        let settings = SampleSettings {
            sample_rate: 0.01,
            sample_points_per_file: 1,
            tuple_start_offset: None,
        };

        let err = generate_read_requests(&[inputs], &[1], &settings, &[PhaseName::Zero])
            .unwrap_err();
        assert!(matches!(err, PlannerError::ZeroLengthSample { path } if path == "tiny"));
    }

    #[test]
    fn multi_point_sampling_requires_tuple_offset() {
        let settings = SampleSettings {
            sample_rate: 1.0,
            sample_points_per_file: 2,
            tuple_start_offset: None,
        };

        let err = generate_read_requests(&[BTreeMap::new()], &[1], &settings, &[PhaseName::Zero])
            .unwrap_err();
        assert!(matches!(
            err,
            PlannerError::MultiPointWithoutTupleOffset { points: 2 }
        ));
    }

    #[test]
    fn sample_rate_above_one_is_rejected() {
        let settings = SampleSettings {
            sample_rate: 1.5,
            sample_points_per_file: 1,
            tuple_start_offset: None,
        };

        let err = generate_read_requests(&[BTreeMap::new()], &[1], &settings, &[PhaseName::Zero])
            .unwrap_err();
        assert!(matches!(err, PlannerError::SampleRateTooLarge(_)));
    }

    #[test]
    fn phase_one_permutation_is_deterministic_per_worker() {
        let mut inputs: WorkerInputs = BTreeMap::new();
        let files: Vec<FileInfo> = (0..16).map(|i| file(&format!("f{i}"), 100 + i)).collect();
        inputs
            .entry("h1".to_string())
            .or_default()
            .insert(0, files.clone());
        inputs.get_mut("h1").unwrap().insert(1, files);

        let plan_a = generate_read_requests(
            &[inputs.clone()],
            &[1],
            &full_scan_settings(),
            &[PhaseName::One],
        )
        .unwrap();
        let plan_b =
            generate_read_requests(&[inputs], &[1], &full_scan_settings(), &[PhaseName::One])
                .unwrap();

        assert_eq!(plan_a, plan_b);

        // Workers on the same host draw different permutations.
        let order = |worker: usize| -> Vec<String> {
            reads(&plan_a["h1"][&worker])
                .iter()
                .map(|r| match r {
                    ReadRequest::Read { path, .. } => path.clone(),
                    _ => unreachable!(),
                })
                .collect()
        };
        assert_ne!(order(0), order(1));
    }

    #[test]
    fn skipped_phase_zero_emits_only_full_scans() {
        let mut inputs: WorkerInputs = BTreeMap::new();
        inputs
            .entry("h1".to_string())
            .or_default()
            .insert(0, vec![file("f", 100)]);

        let plan =
            generate_read_requests(&[inputs], &[1], &full_scan_settings(), &[PhaseName::One])
                .unwrap();
        let queue = &plan["h1"][&0];

        assert_eq!(queue.len(), 2);
        assert!(matches!(&queue[0], ReadRequest::Read { length: 100, .. }));
        assert_eq!(queue[1], ReadRequest::Halt { job_ids: vec![1] });
    }

    #[test]
    fn no_input_phases_means_an_empty_plan() {
        let mut inputs: WorkerInputs = BTreeMap::new();
        inputs
            .entry("h1".to_string())
            .or_default()
            .insert(0, vec![file("f", 100)]);

        let plan = generate_read_requests(
            &[inputs],
            &[1],
            &full_scan_settings(),
            &[PhaseName::Two, PhaseName::Three],
        )
        .unwrap();
        assert!(plan.is_empty());
    }
}
