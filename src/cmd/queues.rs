//! `themis queues` — inspect or flush the read-request queues.

use anyhow::Result;
use console::style;

use crate::cmd::StoreOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuesAction {
    List,
    Flush,
}

pub async fn cmd_queues(store: &StoreOptions, action: QueuesAction) -> Result<()> {
    let db = store.connect()?;

    for host in db.known_nodes().await? {
        let Some(host_ip) = db.ipv4_address(&host).await? else {
            continue;
        };

        let queues = db.read_request_queues(&host_ip).await?;

        match action {
            QueuesAction::List => {
                println!("{}:", style(&host).bold());

                for queue in queues {
                    // Queue keys look like read_requests:<ip>:reader:<id>.
                    let worker_id = queue.rsplit(':').next().unwrap_or("?");
                    let requests = db.read_queue_contents(&queue).await?;

                    println!(
                        "reader {worker_id} ({} element(s) in queue):",
                        requests.len()
                    );
                    for (index, request) in requests.iter().enumerate() {
                        println!("{:5}. {}", index + 1, request.describe());
                    }
                    println!();
                }
            }
            QueuesAction::Flush => {
                for queue in queues {
                    db.flush_read_queue(&queue).await?;
                }
                println!("Flushed read request queues for {host}");
            }
        }
    }

    Ok(())
}
