//! Coordination store for the Themis control plane.
//!
//! Every piece of shared state in the cluster lives in a single Redis
//! database: membership, disk lists, the job queue, batch indices, phase
//! completion queues, barriers, keepalives, failure reports, and the
//! per-worker read-request queues. This crate wraps that database behind
//! [`CoordinatorDb`], whose methods are named after domain operations so
//! that key strings never leak into the coordinators.
//!
//! The wire types that cross the store (job specs, read requests, failure
//! reports, phase-zero artifacts) live in [`types`].

pub mod db;
pub mod types;

pub use db::{CoordinatorDb, StoreError};
pub use types::{
    FailureReport, JobSpec, JobStatus, LogicalDiskCounts, PhaseName, ReadRequest, RecoveryInfo,
};
