//! Cluster application configuration.
//!
//! The data plane is configured through a YAML file of flat `KEY: value`
//! entries. The control plane only interprets the handful of keys that
//! affect planning and phase selection; everything else passes through to
//! the data-plane command line untouched. Job-scoped parameters override
//! the config-file values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::Value;

use themis_store::PhaseName;

/// The loaded cluster config file.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl ClusterConfig {
    /// Load a YAML config file of flat key/value pairs.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let values: BTreeMap<String, Value> = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    /// Build a config from in-memory values (test seam).
    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            path: PathBuf::new(),
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Fraction of each input file sampled in phase zero. Defaults to
    /// sampling everything.
    pub fn sample_rate(&self) -> f64 {
        self.get("SAMPLE_RATE")
            .and_then(yaml_f64)
            .unwrap_or(1.0)
    }

    /// Number of sample windows per input file. Defaults to a single
    /// prefix sample.
    pub fn sample_points_per_file(&self) -> usize {
        self.get("SAMPLES_PER_FILE")
            .and_then(yaml_u64)
            .map(|n| n as usize)
            .unwrap_or(1)
    }

    pub fn output_replication_level(&self) -> u64 {
        self.get("OUTPUT_REPLICATION_LEVEL")
            .and_then(yaml_u64)
            .unwrap_or(1)
    }

    /// Phases two and three only exist when output is replicated.
    pub fn use_replication(&self) -> bool {
        self.output_replication_level() > 1
    }

    /// Config-level skip flag for a phase.
    pub fn skip_flag(&self, phase: PhaseName) -> bool {
        self.get(phase.skip_param())
            .map(yaml_truthy)
            .unwrap_or(false)
    }

    /// The fixed tuple length used to round sample windows, merging the
    /// config-file key/value lengths with any job-param overrides. `None`
    /// unless both lengths are known.
    pub fn tuple_start_offset(&self, job_params: &BTreeMap<String, String>) -> Option<u64> {
        let merged = |key: &str| -> Option<u64> {
            job_params
                .get(key)
                .and_then(|v| v.parse().ok())
                .or_else(|| self.get(key).and_then(yaml_u64))
        };

        let key_length = merged("MAP_INPUT_FIXED_KEY_LENGTH")?;
        let value_length = merged("MAP_INPUT_FIXED_VALUE_LENGTH")?;
        Some(key_length + value_length)
    }

}

/// The resolved skip decision for all four phases of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipFlags {
    skip: [bool; 4],
}

impl SkipFlags {
    /// Resolve skip flags from the cluster config and a job's parameters.
    /// Per-job values win; `DAYTONA_MINUTESORT` forces a phase-zero-only
    /// run.
    pub fn resolve(config: &ClusterConfig, job_params: &BTreeMap<String, String>) -> Self {
        let mut skip = [false; 4];

        for phase in PhaseName::ALL {
            let mut flag = config.skip_flag(phase);
            if let Some(value) = job_params.get(phase.skip_param()) {
                flag = str_truthy(value);
            }
            skip[phase.index()] = flag;
        }

        if job_params
            .get("DAYTONA_MINUTESORT")
            .map(|v| str_truthy(v))
            .unwrap_or(false)
        {
            skip = [false, true, true, true];
        }

        Self { skip }
    }

    pub fn is_skipped(&self, phase: PhaseName) -> bool {
        self.skip[phase.index()]
    }

    /// Phases that produce read requests and barriers for this batch.
    /// Phases two and three are only planned for replicated runs, since
    /// only those have a network-transfer stage to synchronize.
    pub fn planned_phases(&self, use_replication: bool) -> Vec<PhaseName> {
        PhaseName::ALL
            .into_iter()
            .filter(|phase| !self.is_skipped(*phase))
            .filter(|phase| use_replication || phase.index() < 2)
            .collect()
    }
}

/// Truthiness of a string-valued parameter: `"0"`, `"false"`, and the
/// empty string are false.
pub fn str_truthy(value: &str) -> bool {
    !matches!(value, "" | "0" | "false" | "False")
}

fn yaml_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn yaml_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn yaml_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => str_truthy(s),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from_yaml(yaml: &str) -> ClusterConfig {
        ClusterConfig::from_values(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn sampling_defaults_and_overrides() {
        let config = config_from_yaml("UNRELATED: 1");
        assert_eq!(config.sample_rate(), 1.0);
        assert_eq!(config.sample_points_per_file(), 1);

        let config = config_from_yaml("SAMPLE_RATE: 0.25\nSAMPLES_PER_FILE: 4");
        assert_eq!(config.sample_rate(), 0.25);
        assert_eq!(config.sample_points_per_file(), 4);
    }

    #[test]
    fn tuple_offset_needs_both_lengths() {
        let config = config_from_yaml("MAP_INPUT_FIXED_KEY_LENGTH: 10");
        assert_eq!(config.tuple_start_offset(&BTreeMap::new()), None);

        let config =
            config_from_yaml("MAP_INPUT_FIXED_KEY_LENGTH: 10\nMAP_INPUT_FIXED_VALUE_LENGTH: 90");
        assert_eq!(config.tuple_start_offset(&BTreeMap::new()), Some(100));
    }

    #[test]
    fn tuple_offset_prefers_job_params() {
        let config =
            config_from_yaml("MAP_INPUT_FIXED_KEY_LENGTH: 10\nMAP_INPUT_FIXED_VALUE_LENGTH: 90");

        let mut params = BTreeMap::new();
        params.insert("MAP_INPUT_FIXED_VALUE_LENGTH".to_string(), "40".to_string());
        assert_eq!(config.tuple_start_offset(&params), Some(50));
    }

    #[test]
    fn skip_flags_merge_config_and_params() {
        let config = config_from_yaml("SKIP_PHASE_TWO: 1");

        let flags = SkipFlags::resolve(&config, &BTreeMap::new());
        assert!(!flags.is_skipped(PhaseName::Zero));
        assert!(flags.is_skipped(PhaseName::Two));

        let mut params = BTreeMap::new();
        params.insert("SKIP_PHASE_TWO".to_string(), "0".to_string());
        params.insert("SKIP_PHASE_ONE".to_string(), "1".to_string());
        let flags = SkipFlags::resolve(&config, &params);
        assert!(!flags.is_skipped(PhaseName::Two));
        assert!(flags.is_skipped(PhaseName::One));
    }

    #[test]
    fn daytona_minutesort_forces_phase_zero_only() {
        let config = config_from_yaml("SKIP_PHASE_ZERO: 1");

        let mut params = BTreeMap::new();
        params.insert("DAYTONA_MINUTESORT".to_string(), "1".to_string());
        let flags = SkipFlags::resolve(&config, &params);

        assert!(!flags.is_skipped(PhaseName::Zero));
        assert!(flags.is_skipped(PhaseName::One));
        assert!(flags.is_skipped(PhaseName::Two));
        assert!(flags.is_skipped(PhaseName::Three));
    }

    #[test]
    fn planned_phases_respect_replication() {
        let config = config_from_yaml("OUTPUT_REPLICATION_LEVEL: 1");
        let flags = SkipFlags::resolve(&config, &BTreeMap::new());
        assert_eq!(
            flags.planned_phases(config.use_replication()),
            vec![PhaseName::Zero, PhaseName::One]
        );

        let config = config_from_yaml("OUTPUT_REPLICATION_LEVEL: 2");
        let flags = SkipFlags::resolve(&config, &BTreeMap::new());
        assert_eq!(
            flags.planned_phases(config.use_replication()),
            vec![
                PhaseName::Zero,
                PhaseName::One,
                PhaseName::Two,
                PhaseName::Three
            ]
        );
    }
}
