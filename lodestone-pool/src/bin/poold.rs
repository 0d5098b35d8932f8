use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};

use lodestone_pool::config::PoolConfig;
use lodestone_pool::pool::Pool;
use lodestone_pool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pool.json".to_string());
    let config = PoolConfig::load_from(std::path::Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;
    let config = std::sync::Arc::new(config);

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (pool, mut share_rx) = Pool::new(config.clone(), running.clone())?;
    tracker.spawn({
        let running = running.clone();
        let tracker = tracker.clone();
        async move {
            if let Err(e) = pool.run(tracker).await {
                error!(error = %e, "pool failed");
                running.cancel();
            }
        }
    });

    // Share sink. Accepted shares are only logged here; persistence hangs
    // off this same stream.
    tracker.spawn(async move {
        while let Some(share) = share_rx.recv().await {
            info!(
                miner = %share.miner,
                worker = share.worker.as_deref().unwrap_or("-"),
                difficulty = share.difficulty,
                height = share.block_height,
                candidate = share.is_block_candidate,
                "share accepted"
            );
        }
    });
    tracker.close();
    info!(pool = %config.id, "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
