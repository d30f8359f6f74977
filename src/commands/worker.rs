//! Worker command implementation

use crate::blob::FsBlobStore;
use crate::config::Config;
use crate::deck::default_reader;
use crate::embed::create_embedder;
use crate::error::Result;
use crate::llm::HttpSlideModel;
use crate::meta::MetaDb;
use crate::queue::SqliteQueue;
use crate::workers::{run_workers, Services, WorkerKind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Wire the production collaborators for a worker process
pub fn build_services(config: &Config, db: MetaDb) -> Result<Services> {
    Ok(Services {
        queue: Arc::new(SqliteQueue::new(db.pool().clone())),
        blobs: Arc::new(FsBlobStore::new(config.storage_root())),
        model: Arc::new(HttpSlideModel::new(&config.llm)?),
        embedder: create_embedder(&config.embedding)?,
        reader: default_reader(),
        config: Arc::new(config.clone()),
        db,
    })
}

/// Parse a worker selection; `all` selects every stage
pub fn parse_worker_selection(value: &str) -> Result<Vec<WorkerKind>> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(WorkerKind::ALL.to_vec());
    }
    value
        .split(',')
        .map(|s| s.trim().parse::<WorkerKind>())
        .collect()
}

/// Run the selected workers until Ctrl-C
pub async fn cmd_worker(config: &Config, db: MetaDb, kinds: Vec<WorkerKind>) -> Result<()> {
    let services = build_services(config, db)?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight jobs");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for Ctrl-C");
                // Keep the sender alive so the workers keep running
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });

    let names: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
    info!(workers = %names.join(","), "Starting workers");
    run_workers(services, &kinds, rx).await
}
