use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use themis::cmd::queues::QueuesAction;
use themis::cmd::{
    StoreOptions, cmd_cluster, cmd_list_files, cmd_node, cmd_queues, cmd_submit,
};

#[derive(Parser)]
#[command(name = "themis")]
#[command(version, about = "Control plane for the Themis MapReduce cluster")]
pub struct Cli {
    /// Hostname of the coordination store
    #[arg(long, default_value = "localhost", global = true)]
    pub store_host: String,

    /// Port of the coordination store
    #[arg(long, default_value = "6379", global = true)]
    pub store_port: u16,

    /// Database index within the coordination store
    #[arg(long, default_value = "0", global = true)]
    pub store_db: i64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cluster coordinator
    Cluster {
        /// Path to the data-plane binary on every node
        binary: String,
        /// YAML config file for the data plane
        config: PathBuf,
        /// Directory for coordinator and batch logs
        #[arg(short, long, default_value = "~/themis_logs")]
        log_directory: String,
        /// Seconds between node keepalive refreshes
        #[arg(long, default_value = "2")]
        keepalive_refresh: u64,
        /// Seconds without a keepalive before a node is presumed dead
        #[arg(long, default_value = "10")]
        keepalive_timeout: u64,
        /// Command used to launch this CLI on worker nodes
        #[arg(long, default_value = "themis")]
        themis_command: String,
    },
    /// Run a node coordinator (normally spawned over ssh by `cluster`)
    Node {
        /// Path to the data-plane binary on this node
        binary: String,
        /// YAML config file for the data plane
        config: PathBuf,
        /// Directory for coordinator and batch logs
        log_directory: String,
        /// This node's fully-qualified hostname
        #[arg(long)]
        hostname: Option<String>,
        /// Nonce mixed into scratch-directory names
        #[arg(long)]
        batch_nonce: Option<String>,
        #[arg(long, default_value = "2")]
        keepalive_refresh: u64,
        #[arg(long, default_value = "10")]
        keepalive_timeout: u64,
    },
    /// Submit a job specification file to the cluster
    Submit {
        /// JSON file holding a job, a batch of jobs, or a list of batches
        spec_file: PathBuf,
        /// Wait for the submitted jobs to finish
        #[arg(long)]
        wait: bool,
    },
    /// List the per-worker read-request queues
    Queues {
        #[command(subcommand)]
        command: QueuesCommands,
    },
    /// Print a JSON listing of the files under each directory
    #[command(hide = true)]
    ListFiles {
        #[arg(required = true)]
        directories: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueuesCommands {
    /// Render every queue's contents
    List,
    /// Delete every queue
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = StoreOptions {
        host: cli.store_host.clone(),
        port: cli.store_port,
        db: cli.store_db,
    };

    match &cli.command {
        Commands::Cluster {
            binary,
            config,
            log_directory,
            keepalive_refresh,
            keepalive_timeout,
            themis_command,
        } => {
            cmd_cluster(
                &store,
                binary,
                config,
                log_directory,
                *keepalive_refresh,
                *keepalive_timeout,
                themis_command,
            )
            .await?;
        }
        Commands::Node {
            binary,
            config,
            log_directory,
            hostname,
            batch_nonce,
            keepalive_refresh,
            keepalive_timeout,
        } => {
            cmd_node(
                &store,
                binary,
                config,
                log_directory,
                hostname.clone(),
                batch_nonce.clone(),
                *keepalive_refresh,
                *keepalive_timeout,
            )
            .await?;
        }
        Commands::Submit { spec_file, wait } => {
            cmd_submit(&store, spec_file, *wait).await?;
        }
        Commands::Queues { command } => {
            let action = match command {
                QueuesCommands::List => QueuesAction::List,
                QueuesCommands::Flush => QueuesAction::Flush,
            };
            cmd_queues(&store, action).await?;
        }
        Commands::ListFiles { directories } => {
            cmd_list_files(directories)?;
        }
    }

    Ok(())
}
