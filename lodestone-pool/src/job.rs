//! Job lifecycle and the coin-family seam.
//!
//! [`JobManager`] is coin-agnostic: it drives a small state machine (wait
//! for the daemon to respond, wait for it to sync, run one-shot setup,
//! then poll for work) against a [`JobSource`], and owns the ring of jobs
//! miners may still submit against. Everything coin-specific, from the
//! upstream probes to the wire encoding and share validation, lives
//! behind [`JobSource`] and [`PoolJob`]; the Bitcoin family implements
//! both in [`crate::coin::bitcoin`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::coin::ExtraNonceProvider;
use crate::coin::bitcoin::ProcessedShare;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::stratum::rpc::StratumException;
use crate::tracing::prelude::*;

/// Jobs kept live for submissions after a new one is published.
const MAX_ACTIVE_JOBS: usize = 4;

/// How long a job may be the newest before it is rebroadcast.
const REBROADCAST_INTERVAL: Duration = Duration::from_secs(25);

/// Delay between retries while the daemon is down or syncing.
const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// One frozen unit of work, as the stratum layer sees it.
///
/// A job is immutable once built; a connection's difficulty enters at
/// share-processing time, never into the job itself.
pub trait PoolJob: Send + Sync {
    fn id(&self) -> &str;
    fn height(&self) -> u64;
    /// Coinbase value in base units.
    fn reward(&self) -> u64;
    fn network_difficulty(&self) -> f64;

    /// The parameter array for the new-work notification.
    fn notify_params(&self, clean: bool) -> Value;

    /// Validate one submission and grade it against `difficulty`.
    fn process_share(
        &self,
        extranonce1: &str,
        difficulty: f64,
        previous_difficulty: Option<f64>,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> std::result::Result<ProcessedShare, StratumException>;
}

/// Sync probe outcome.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub synced: bool,
    /// Human-readable progress for the log.
    pub detail: String,
}

/// Upstream capability surface of one coin family.
///
/// The manager retries every probe on a fixed delay; implementations
/// report errors, they do not retry themselves.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    /// Cheap liveness probe; `Ok` carries a description for the log.
    async fn probe_health(&self) -> Result<String>;

    async fn probe_sync(&self) -> Result<SyncState>;

    /// One-shot setup. An error here aborts pool startup.
    async fn initialize(&self) -> Result<()>;

    /// Check upstream for work. Returns a job under `job_id` when the
    /// chain moved, or when `rebroadcast` asks for a refresh of the
    /// current work.
    async fn refresh(&self, job_id: String, rebroadcast: bool) -> Result<Option<JobUpdate>>;

    /// Hand a solved block to the daemon. `None` means accepted.
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>>;
}

/// A job published to the pool's broadcast path.
#[derive(Clone)]
pub struct JobUpdate {
    pub job: Arc<dyn PoolJob>,
    /// Miners must abandon earlier jobs when set.
    pub clean: bool,
}

pub struct JobManager {
    source: Arc<dyn JobSource>,
    config: Arc<PoolConfig>,
    extranonce: ExtraNonceProvider,
    job_seq: AtomicU64,
    /// Newest job first.
    valid_jobs: Mutex<VecDeque<Arc<dyn PoolJob>>>,
    job_tx: broadcast::Sender<JobUpdate>,
    has_job_tx: watch::Sender<bool>,
}

impl JobManager {
    pub fn new(config: Arc<PoolConfig>, source: Arc<dyn JobSource>) -> Self {
        let (job_tx, _) = broadcast::channel(16);
        let (has_job_tx, _) = watch::channel(false);
        Self {
            source,
            config,
            extranonce: ExtraNonceProvider::new(),
            job_seq: AtomicU64::new(1),
            valid_jobs: Mutex::new(VecDeque::new()),
            job_tx,
            has_job_tx,
        }
    }

    /// Subscribe to job publications. Late subscribers use
    /// [`JobManager::current_job`] to catch up; the channel replays
    /// nothing.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.job_tx.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<dyn PoolJob>> {
        self.valid_jobs.lock().front().cloned()
    }

    /// Look up a job a submission references. Misses mean stale work.
    pub fn get_job(&self, id: &str) -> Option<Arc<dyn PoolJob>> {
        self.valid_jobs.lock().iter().find(|j| j.id() == id).cloned()
    }

    /// Assign a fresh extranonce1 to a subscribing connection.
    pub fn assign_extranonce(&self) -> String {
        self.extranonce.next()
    }

    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    /// Block until the first job exists, so listeners never greet miners
    /// without work to hand out.
    pub async fn wait_for_first_job(&self, cancel: &CancellationToken) -> bool {
        let mut has_job = self.has_job_tx.subscribe();
        loop {
            if *has_job.borrow() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                result = has_job.changed() => {
                    if result.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Drive the source state machine until cancelled.
    ///
    /// Returns an error only for fatal startup problems; transient
    /// upstream failures are logged and retried.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.await_health(&cancel).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.await_sync(&cancel).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.source.initialize().await?;
        self.poll(&cancel).await;
        Ok(())
    }

    async fn await_health(&self, cancel: &CancellationToken) {
        loop {
            match self.source.probe_health().await {
                Ok(description) => {
                    info!(daemon = %description, "daemon is responding");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "daemon not reachable yet");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECOVERY_DELAY) => {}
            }
        }
    }

    async fn await_sync(&self, cancel: &CancellationToken) {
        loop {
            match self.source.probe_sync().await {
                Ok(state) if state.synced => {
                    info!(state = %state.detail, "daemon is synced");
                    return;
                }
                Ok(state) => {
                    info!(state = %state.detail, "daemon is syncing");
                }
                Err(e) => {
                    warn!(error = %e, "sync probe failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECOVERY_DELAY) => {}
            }
        }
    }

    async fn poll(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval));
        let mut last_broadcast = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let job_id = format!("{:x}", self.job_seq.fetch_add(1, Ordering::Relaxed));
            let rebroadcast = last_broadcast.elapsed() >= REBROADCAST_INTERVAL;

            match self.source.refresh(job_id, rebroadcast).await {
                Ok(Some(update)) => {
                    last_broadcast = tokio::time::Instant::now();
                    if update.clean {
                        info!(
                            job = %update.job.id(),
                            height = update.job.height(),
                            "new job for new block"
                        );
                    } else {
                        debug!(job = %update.job.id(), "job rebroadcast");
                    }
                    self.publish(update);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "work refresh failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RECOVERY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Push a job onto the ring and broadcast it.
    pub(crate) fn publish(&self, update: JobUpdate) {
        {
            let mut jobs = self.valid_jobs.lock();
            if update.clean {
                jobs.clear();
            }
            jobs.push_front(update.job.clone());
            jobs.truncate(MAX_ACTIVE_JOBS);
        }
        self.has_job_tx.send_replace(true);

        // No receivers is fine; connections catch up via current_job.
        let _ = self.job_tx.send(update);
    }
}
