//! Shared filesystem and time helpers for the Themis crate.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

/// Move an existing file aside to `<name>.bak.N` so a fresh run never
/// clobbers the previous run's output.
pub fn backup_if_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let mut index = 1;
    loop {
        let backup = path.with_extension(format!(
            "{}bak.{index}",
            path.extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));
        if !backup.exists() {
            std::fs::rename(path, &backup)
                .with_context(|| format!("Failed to back up {}", path.display()))?;
            return Ok(());
        }
        index += 1;
    }
}

/// Create the coordinator log directory and its fixed subdirectories,
/// returning the expanded path.
pub fn create_log_directory(log_directory: &str) -> Result<PathBuf> {
    let log_directory = expand_user(log_directory);

    for sub_directory in ["node_coordinators", "run_logs"] {
        let directory = log_directory.join(sub_directory);
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create {}", directory.display()))?;
    }

    Ok(log_directory)
}

/// The per-batch log directory, created on first use.
pub fn create_batch_directory(log_directory: &Path, batch_id: u64) -> Result<PathBuf> {
    let batch_directory = log_directory
        .join("run_logs")
        .join(format!("batch_{batch_id}"));
    std::fs::create_dir_all(&batch_directory)
        .with_context(|| format!("Failed to create {}", batch_directory.display()))?;
    Ok(batch_directory)
}

/// Wall-clock seconds since the Unix epoch, as stored in job info.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The user running this coordinator, for scratch-directory and job
/// naming.
pub fn current_username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "themis".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backup_if_exists_rotates_without_clobbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stdout.log");

        std::fs::write(&path, "first").unwrap();
        backup_if_exists(&path).unwrap();
        assert!(!path.exists());

        std::fs::write(&path, "second").unwrap();
        backup_if_exists(&path).unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().any(|n| n.ends_with("bak.1")));
        assert!(backups.iter().any(|n| n.ends_with("bak.2")));
    }

    #[test]
    fn backup_if_exists_ignores_missing_files() {
        let dir = tempdir().unwrap();
        backup_if_exists(&dir.path().join("absent.log")).unwrap();
    }

    #[test]
    fn log_directory_layout() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("logs");
        let created = create_log_directory(base.to_str().unwrap()).unwrap();

        assert!(created.join("node_coordinators").is_dir());
        assert!(created.join("run_logs").is_dir());

        let batch = create_batch_directory(&created, 3).unwrap();
        assert!(batch.ends_with("run_logs/batch_3"));
        assert!(batch.is_dir());
    }
}
