//! Application entrypoint: load configuration, initialise tracing, connect
//! the database, and run the per-chain import pipelines until Ctrl-C.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use beefy_importer::config::Config;
use beefy_importer::errors::ImporterError;
use beefy_importer::pipeline::Orchestrator;
use beefy_importer::storage::{get_shared_pool, Store};

#[tokio::main]
async fn main() -> Result<(), ImporterError> {
    // Keep library chatter down while leaving importer logs at info
    let filter = EnvFilter::from_default_env()
        .add_directive("ethers_providers=warn".parse().expect("static directive"))
        .add_directive("tokio_postgres=warn".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("beefy_importer=info".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(
        Config::load_from_directory("config")
            .await
            .map_err(|e| ImporterError::Config(e.to_string()))?,
    );
    info!(
        chains = config.enabled_chains().len(),
        "Configuration loaded"
    );

    let pool = get_shared_pool(&config).await?;
    let store = Store::new(pool);

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(config, store);

    let runner_cancel = cancel.clone();
    let runner = tokio::spawn(async move { orchestrator.run(runner_cancel).await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ImporterError::Pipeline(format!("failed to listen for ctrl-c: {}", e)))?;
    info!("SIGINT received, draining pipelines");
    cancel.cancel();

    match runner.await {
        Ok(result) => result?,
        Err(e) => {
            error!("Orchestrator task panicked: {}", e);
            return Err(ImporterError::Pipeline(e.to_string()));
        }
    }

    info!("Importer stopped");
    Ok(())
}
