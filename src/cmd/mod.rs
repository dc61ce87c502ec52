//! CLI command implementations.
//!
//! Each submodule owns one subcommand:
//!
//! | Module       | Command handled                                    |
//! |--------------|-----------------------------------------------------|
//! | `cluster`    | `cluster` — run the cluster coordinator            |
//! | `node`       | `node` — run a node coordinator                    |
//! | `submit`     | `submit` — push a job-spec file onto the job queue |
//! | `queues`     | `queues` — inspect or flush read-request queues    |
//! | `list_files` | `list-files` — JSON file listing used over ssh     |

pub mod cluster;
pub mod list_files;
pub mod node;
pub mod queues;
pub mod submit;

pub use cluster::cmd_cluster;
pub use list_files::cmd_list_files;
pub use node::cmd_node;
pub use queues::cmd_queues;
pub use submit::cmd_submit;

use anyhow::{Context, Result};

use themis_store::CoordinatorDb;

/// Connection parameters for the coordination store, shared by every
/// subcommand.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub host: String,
    pub port: u16,
    pub db: i64,
}

impl StoreOptions {
    pub fn connect(&self) -> Result<CoordinatorDb> {
        CoordinatorDb::connect(&self.host, self.port, self.db)
            .context("Failed to connect to the coordination store")
    }
}
