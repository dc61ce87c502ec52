//! `themis list-files` — JSON file listing for input discovery.
//!
//! Executed over ssh on each worker node. Prints a JSON array with one
//! entry per requested directory, each a list of `[absolute_path,
//! length]` pairs, or `null` when any directory is missing.

use anyhow::{Context, Result};

use crate::inputs::list_local_files;

pub fn cmd_list_files(directories: &[String]) -> Result<()> {
    let listing = list_local_files(directories).context("Failed to walk input directories")?;
    println!(
        "{}",
        serde_json::to_string(&listing).context("Failed to serialize file listing")?
    );
    Ok(())
}
