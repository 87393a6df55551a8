//! The orchestrator: one recurring historical and one recurring recent
//! pipeline per enabled chain, plus the global oracle price loop.
//!
//! Ticks are best-effort: a failing tick is logged and the next one starts
//! on schedule. Shutdown is cooperative; in-flight ticks drain before the
//! task returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::errors::ImporterError;
use crate::storage::Store;

use super::{
    import_investments_historical, import_investments_recent, import_oracle_prices,
    import_share_rates_historical, import_share_rates_recent, ChainContext, OracleContext,
};

const RECENT_TICK_INTERVAL: Duration = Duration::from_secs(15);
const HISTORICAL_TICK_INTERVAL: Duration = Duration::from_secs(30);
const ORACLE_TICK_INTERVAL: Duration = Duration::from_secs(300);

pub struct Orchestrator {
    config: Arc<Config>,
    store: Store,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        Self { config, store }
    }

    /// Spawn every pipeline and wait for shutdown.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ImporterError> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for chain_cfg in self.config.enabled_chains() {
            let ctx = Arc::new(
                ChainContext::new(&self.config, chain_cfg.clone(), self.store.clone())
                    .map_err(|e| ImporterError::Config(e.to_string()))?,
            );
            info!(chain = %ctx.chain(), "Starting chain pipelines");

            let recent_ctx = ctx.clone();
            let recent_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_ticks(recent_cancel, RECENT_TICK_INTERVAL, "recent", || {
                    let ctx = recent_ctx.clone();
                    async move {
                        import_investments_recent(&ctx, None).await?;
                        import_share_rates_recent(&ctx, None).await
                    }
                })
                .await;
            }));

            let historical_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_ticks(historical_cancel, HISTORICAL_TICK_INTERVAL, "historical", || {
                    let ctx = ctx.clone();
                    async move {
                        import_investments_historical(&ctx).await?;
                        import_share_rates_historical(&ctx).await
                    }
                })
                .await;
            }));
        }

        let oracle_ctx = Arc::new(OracleContext::new(&self.config, self.store.clone())?);
        let oracle_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_ticks(oracle_cancel, ORACLE_TICK_INTERVAL, "oracle", || {
                let ctx = oracle_ctx.clone();
                async move { import_oracle_prices(&ctx).await }
            })
            .await;
        }));

        for handle in handles {
            if let Err(e) = handle.await {
                return Err(ImporterError::Pipeline(format!("pipeline task died: {}", e)));
            }
        }
        Ok(())
    }
}

/// Run `tick` on a fixed schedule until cancellation. Errors are logged and
/// the loop continues; cancellation waits for the current tick to finish.
async fn run_ticks<F, Fut>(cancel: CancellationToken, interval: Duration, label: &str, tick: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), ImporterError>>,
{
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(pipeline = label, "Pipeline stopped");
                return;
            }
            _ = timer.tick() => {
                if let Err(e) = tick().await {
                    error!(pipeline = label, error = %e, "Pipeline tick failed");
                }
            }
        }
    }
}
