//! Pool orchestration: the stratum method handlers and the broadcast,
//! vardiff, and banning policies tying the other modules together.
//!
//! [`Pool`] implements [`ConnectionHandler`], so every parsed request from
//! every connection lands in [`Pool::on_request`]. Job publications fan
//! out from the broadcast loop; a separate sweep retargets idle vardiff
//! connections and boots zombies.

pub mod context;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::banning::BanManager;
use crate::coin::EXTRANONCE2_BYTES;
use crate::coin::bitcoin::{BitcoinJobSource, ProcessedShare};
use crate::config::{BanningConfig, PoolConfig};
use crate::error::Result;
use crate::job::{JobManager, JobUpdate, PoolJob};
use crate::share::Share;
use crate::stratum::connection::ConnectionHandler;
use crate::stratum::rpc::{Request, StratumError, methods};
use crate::stratum::{StratumConnection, StratumServer};
use crate::tracing::prelude::*;
use crate::vardiff::VarDiffManager;
use context::{ShareStats, parse_static_difficulty};

/// Connections that never subscribe get this long before being booted.
const ZOMBIE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections silent this long are presumed dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Ban for peers that try to mine without authorizing.
const UNAUTHORIZED_BAN: Duration = Duration::from_secs(60);

/// Cadence of the idle vardiff / zombie sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const SHARE_QUEUE_CAPACITY: usize = 256;

/// The verdict of the invalid-share ban policy.
#[derive(Debug, PartialEq, Eq)]
enum BanVerdict {
    Ban,
    ResetStats,
    TooEarly,
}

fn ban_verdict(stats: &ShareStats, config: &BanningConfig) -> BanVerdict {
    if !config.enabled || stats.total() <= config.check_threshold {
        return BanVerdict::TooEarly;
    }
    let ratio_bad = stats.invalid as f64 / stats.total() as f64;
    if ratio_bad >= config.invalid_percent / 100.0 {
        BanVerdict::Ban
    } else {
        BanVerdict::ResetStats
    }
}

fn is_zombie(subscribed: bool, connected_for: Duration, silent_for: Duration) -> bool {
    (!subscribed && connected_for >= ZOMBIE_TIMEOUT) || silent_for >= IDLE_TIMEOUT
}

pub struct Pool {
    config: Arc<PoolConfig>,
    server: Arc<StratumServer>,
    jobs: Arc<JobManager>,
    bans: Arc<BanManager>,
    /// Vardiff policy per endpoint index; `None` means static difficulty.
    vardiff: Vec<Option<VarDiffManager>>,
    share_tx: mpsc::Sender<Share>,
    cancel: CancellationToken,
}

impl Pool {
    /// Build the pool and return the receiver accepted shares flow out of.
    pub fn new(
        config: Arc<PoolConfig>,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Share>)> {
        let bans = Arc::new(BanManager::new());
        let server = Arc::new(StratumServer::new(
            config.clone(),
            bans.clone(),
            cancel.clone(),
        )?);
        let source = Arc::new(BitcoinJobSource::new(config.clone()));
        let jobs = Arc::new(JobManager::new(config.clone(), source));
        let vardiff = config
            .ports
            .iter()
            .map(|endpoint| endpoint.vardiff.clone().map(VarDiffManager::new))
            .collect();
        let (share_tx, share_rx) = mpsc::channel(SHARE_QUEUE_CAPACITY);

        let pool = Arc::new(Self {
            config,
            server,
            jobs,
            bans,
            vardiff,
            share_tx,
            cancel,
        });
        Ok((pool, share_rx))
    }

    /// Run until cancelled: daemon state machine first, listeners only
    /// after the first job exists, so no miner is greeted without work.
    pub async fn run(self: Arc<Self>, tracker: TaskTracker) -> Result<()> {
        {
            let jobs = self.jobs.clone();
            let cancel = self.cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = jobs.run(cancel.clone()).await {
                    error!(error = %e, "job manager failed, shutting down");
                    cancel.cancel();
                }
            });
        }

        if !self.jobs.wait_for_first_job(&self.cancel).await {
            return Ok(());
        }
        info!(pool = %self.config.id, "first job acquired, opening endpoints");

        tracker.spawn(self.clone().broadcast_loop());
        tracker.spawn(self.clone().sweep_loop());
        self.server.clone().run(self.clone(), tracker).await
    }

    /// Fan each published job out to all authorized connections.
    async fn broadcast_loop(self: Arc<Self>) {
        let mut updates = self.jobs.subscribe();
        loop {
            let update = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = updates.recv() => match received {
                    Ok(update) => update,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "broadcast loop lagged behind job publications");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            };
            self.broadcast_job(update).await;
        }
    }

    async fn broadcast_job(&self, update: JobUpdate) {
        // Snapshot outside the registry lock; slow peers are the send
        // queue's problem, not the registry's.
        let connections = self.server.connections();
        let params = update.job.notify_params(update.clean);

        for conn in connections {
            if !conn.is_alive() {
                continue;
            }

            let (subscribed, authorized) = {
                let ctx = conn.context();
                (ctx.is_subscribed, ctx.is_authorized)
            };

            if is_zombie(
                subscribed,
                conn.connected_at().elapsed(),
                conn.last_seen().elapsed(),
            ) {
                debug!(id = %conn.id(), "booting zombie connection");
                conn.close();
                continue;
            }

            if !subscribed || !authorized {
                continue;
            }

            let announce = conn.context().apply_pending_difficulty();
            if let Some(difficulty) = announce {
                let _ = conn
                    .notify(methods::SET_DIFFICULTY, json!([difficulty]))
                    .await;
            }
            let _ = conn.notify(methods::NOTIFY, params.clone()).await;
        }
    }

    /// Retarget idle vardiff connections and boot zombies between jobs.
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = OffsetDateTime::now_utc().unix_timestamp() as f64;
            for conn in self.server.connections() {
                if !conn.is_alive() {
                    continue;
                }

                let subscribed = conn.context().is_subscribed;
                if is_zombie(
                    subscribed,
                    conn.connected_at().elapsed(),
                    conn.last_seen().elapsed(),
                ) {
                    debug!(id = %conn.id(), "booting zombie connection");
                    conn.close();
                    continue;
                }

                let Some(manager) = &self.vardiff[conn.endpoint()] else {
                    continue;
                };

                let retarget = {
                    let mut ctx = conn.context();
                    if !ctx.is_authorized || ctx.static_difficulty {
                        None
                    } else {
                        let difficulty = ctx.difficulty;
                        manager
                            .update(&mut ctx.vardiff, difficulty, now, true)
                            .map(|new_diff| {
                                ctx.enqueue_difficulty(new_diff);
                                new_diff
                            })
                    }
                };

                if retarget.is_some() {
                    self.announce_difficulty(&conn).await;
                }
            }
        }
    }

    /// Push a staged difficulty to the miner along with fresh work.
    async fn announce_difficulty(&self, conn: &StratumConnection) {
        let Some(difficulty) = conn.context().apply_pending_difficulty() else {
            return;
        };
        debug!(id = %conn.id(), difficulty, "difficulty changed");
        let _ = conn
            .notify(methods::SET_DIFFICULTY, json!([difficulty]))
            .await;
        if let Some(job) = self.jobs.current_job() {
            let _ = conn.notify(methods::NOTIFY, job.notify_params(false)).await;
        }
    }

    async fn handle_subscribe(&self, conn: &StratumConnection, request: Request) -> Result<()> {
        let user_agent = request.params.get(0).and_then(Value::as_str).map(String::from);
        let extranonce1 = self.jobs.assign_extranonce();
        let endpoint_difficulty = self.config.ports[conn.endpoint()].difficulty;

        {
            let mut ctx = conn.context();
            ctx.is_subscribed = true;
            ctx.user_agent = user_agent.clone();
            ctx.extranonce1 = Some(extranonce1.clone());
            if ctx.difficulty == 0.0 {
                ctx.difficulty = endpoint_difficulty;
            }
        }
        debug!(
            id = %conn.id(),
            user_agent = user_agent.as_deref().unwrap_or("-"),
            "subscribed"
        );

        let result = json!([
            [
                [methods::SET_DIFFICULTY, conn.id()],
                [methods::NOTIFY, conn.id()],
            ],
            extranonce1,
            EXTRANONCE2_BYTES,
        ]);
        conn.respond(request.id.unwrap_or(Value::Null), result).await
    }

    async fn handle_authorize(&self, conn: &StratumConnection, request: Request) -> Result<()> {
        let worker_value = request
            .params
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        let password = request.params.get(1).and_then(Value::as_str).unwrap_or("");

        let mut split = worker_value.splitn(2, '.');
        let miner = split.next().unwrap_or("").to_string();
        let worker = split.next().map(String::from);

        if miner.is_empty() {
            conn.respond_error(
                request.id.unwrap_or(Value::Null),
                StratumError::UnauthorizedWorker.with_message("missing workername"),
            )
            .await?;
            if self.config.banning.enabled {
                self.bans.ban(conn.remote_addr().ip(), UNAUTHORIZED_BAN);
            }
            conn.close();
            return Ok(());
        }

        let static_diff = parse_static_difficulty(password);
        let difficulty = {
            let mut ctx = conn.context();
            ctx.is_authorized = true;
            ctx.miner = Some(miner.clone());
            ctx.worker = worker.clone();
            if let Some(diff) = static_diff {
                ctx.previous_difficulty = Some(ctx.difficulty);
                ctx.difficulty = diff;
                ctx.static_difficulty = true;
            }
            ctx.difficulty
        };

        info!(
            id = %conn.id(),
            miner = %miner,
            worker = worker.as_deref().unwrap_or("-"),
            static_diff = static_diff.is_some(),
            "worker authorized"
        );

        conn.respond(request.id.unwrap_or(Value::Null), json!(true)).await?;

        // Initial work: difficulty first, then the current job.
        conn.notify(methods::SET_DIFFICULTY, json!([difficulty])).await?;
        if let Some(job) = self.jobs.current_job() {
            conn.notify(methods::NOTIFY, job.notify_params(true)).await?;
        }
        Ok(())
    }

    async fn handle_submit(&self, conn: &StratumConnection, request: Request) -> Result<()> {
        let id = request.id.unwrap_or(Value::Null);

        let (subscribed, authorized) = {
            let ctx = conn.context();
            (ctx.is_subscribed, ctx.is_authorized)
        };
        if !subscribed {
            return conn
                .respond_error(id, StratumError::NotSubscribed.into_rpc())
                .await;
        }
        if !authorized {
            conn.respond_error(id, StratumError::UnauthorizedWorker.into_rpc())
                .await?;
            if self.config.banning.enabled {
                self.bans.ban(conn.remote_addr().ip(), UNAUTHORIZED_BAN);
            }
            conn.close();
            return Ok(());
        }

        let params: Vec<&str> = (0..5)
            .map(|i| request.params.get(i).and_then(Value::as_str))
            .collect::<Option<_>>()
            .unwrap_or_default();
        let [_worker_value, job_id, extranonce2, ntime, nonce] = params[..] else {
            self.record_invalid(conn).await;
            return conn
                .respond_error(id, StratumError::Other.with_message("invalid params"))
                .await;
        };

        let Some(job) = self.jobs.get_job(job_id) else {
            self.record_invalid(conn).await;
            return conn
                .respond_error(id, StratumError::JobNotFound.into_rpc())
                .await;
        };

        let (extranonce1, difficulty, previous_difficulty) = {
            let ctx = conn.context();
            (
                ctx.extranonce1.clone().unwrap_or_default(),
                ctx.difficulty,
                ctx.previous_difficulty,
            )
        };

        match job.process_share(
            &extranonce1,
            difficulty,
            previous_difficulty,
            extranonce2,
            ntime,
            nonce,
        ) {
            Ok(processed) => {
                conn.respond(id, json!(true)).await?;
                self.accept_share(conn, &job, processed).await;
                Ok(())
            }
            Err(exception) => {
                debug!(id = %conn.id(), error = %exception, "share rejected");
                self.record_invalid(conn).await;
                conn.respond_error(id, exception.into_rpc()).await
            }
        }
    }

    /// Book an accepted share: stats, vardiff, enrichment, candidate
    /// submission.
    async fn accept_share(
        &self,
        conn: &StratumConnection,
        job: &Arc<dyn PoolJob>,
        processed: ProcessedShare,
    ) {
        let now = OffsetDateTime::now_utc();

        let (miner, worker, user_agent, retargeted) = {
            let mut ctx = conn.context();
            ctx.stats.valid += 1;

            let mut retargeted = false;
            if !ctx.static_difficulty {
                if let Some(manager) = &self.vardiff[conn.endpoint()] {
                    let difficulty = ctx.difficulty;
                    if let Some(new_diff) = manager.update(
                        &mut ctx.vardiff,
                        difficulty,
                        now.unix_timestamp() as f64,
                        false,
                    ) {
                        ctx.enqueue_difficulty(new_diff);
                        retargeted = true;
                    }
                }
            }

            (
                ctx.miner.clone().unwrap_or_default(),
                ctx.worker.clone(),
                ctx.user_agent.clone(),
                retargeted,
            )
        };

        if retargeted {
            self.announce_difficulty(conn).await;
        }

        let share = Share {
            pool_id: self.config.id.clone(),
            miner,
            worker,
            user_agent,
            ip_address: conn.remote_addr().ip().to_string(),
            difficulty: processed.difficulty,
            network_difficulty: processed.network_difficulty,
            block_height: processed.height,
            block_reward: processed.is_block_candidate.then(|| job.reward()),
            block_hash: processed.block_hash.clone(),
            is_block_candidate: processed.is_block_candidate,
            created: now,
        };

        if processed.is_block_candidate {
            info!(
                height = processed.height,
                hash = processed.block_hash.as_deref().unwrap_or("-"),
                miner = %share.miner,
                "block candidate found"
            );
            if let Some(block_hex) = processed.block_hex {
                self.submit_candidate(block_hex, processed.height);
            }
        }

        if let Err(e) = self.share_tx.try_send(share) {
            warn!(error = %e, "share sink backlogged, dropping share");
        }
    }

    /// Submit a candidate block without holding up the stratum path. A
    /// daemon rejection does not invalidate the share that produced it.
    fn submit_candidate(&self, block_hex: String, height: u64) {
        let source = self.jobs.source().clone();
        tokio::spawn(async move {
            match source.submit_block(&block_hex).await {
                Ok(None) => info!(height, "daemon accepted block"),
                Ok(Some(reason)) => warn!(height, %reason, "daemon rejected block"),
                Err(e) => warn!(height, error = %e, "block submission failed"),
            }
        });
    }

    /// Count an invalid share and apply the ratio ban policy.
    async fn record_invalid(&self, conn: &StratumConnection) {
        let verdict = {
            let mut ctx = conn.context();
            ctx.stats.invalid += 1;
            let verdict = ban_verdict(&ctx.stats, &self.config.banning);
            if verdict == BanVerdict::ResetStats {
                ctx.stats.reset();
            }
            verdict
        };

        if verdict == BanVerdict::Ban {
            warn!(
                id = %conn.id(),
                remote = %conn.remote_addr(),
                "banning peer for excessive invalid shares"
            );
            self.bans
                .ban(conn.remote_addr().ip(), Duration::from_secs(self.config.banning.time));
            conn.close();
        }
    }

    async fn handle_suggest_difficulty(
        &self,
        conn: &StratumConnection,
        request: Request,
    ) -> Result<()> {
        conn.respond(request.id.unwrap_or(Value::Null), json!(true)).await?;

        let suggested = request.params.get(0).and_then(Value::as_f64);
        let base = self.config.ports[conn.endpoint()].difficulty;
        if let Some(value) = suggested {
            // Suggestions below the endpoint floor are ignored.
            if value > base {
                conn.context().enqueue_difficulty(value);
                self.announce_difficulty(conn).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionHandler for Pool {
    async fn on_request(&self, conn: &StratumConnection, request: Request) -> Result<()> {
        // A ban placed mid-session takes effect here.
        if self.bans.is_banned(conn.remote_addr().ip()) {
            conn.close();
            return Ok(());
        }

        if !request.expects_response() {
            return conn
                .respond_error(Value::Null, StratumError::InvalidRequest.into_rpc())
                .await;
        }

        let method = request.method.clone();
        match method.as_str() {
            methods::SUBSCRIBE => self.handle_subscribe(conn, request).await,
            methods::AUTHORIZE => self.handle_authorize(conn, request).await,
            methods::SUBMIT => self.handle_submit(conn, request).await,
            methods::SUGGEST_DIFFICULTY => self.handle_suggest_difficulty(conn, request).await,
            methods::EXTRANONCE_SUBSCRIBE => {
                conn.respond(request.id.unwrap_or(Value::Null), json!(true)).await
            }
            methods::GET_TRANSACTIONS => {
                conn.respond_error(
                    request.id.unwrap_or(Value::Null),
                    StratumError::Other.with_message("not supported"),
                )
                .await
            }
            other => {
                debug!(id = %conn.id(), method = %other, "unsupported method");
                conn.respond_error(
                    request.id.unwrap_or(Value::Null),
                    StratumError::Other.with_message("unsupported method"),
                )
                .await
            }
        }
    }

    async fn on_disconnect(&self, conn: &StratumConnection) {
        let (miner, shares) = {
            let ctx = conn.context();
            (ctx.miner.clone(), ctx.stats.valid)
        };
        debug!(
            id = %conn.id(),
            miner = miner.as_deref().unwrap_or("-"),
            shares,
            "session ended"
        );
    }
}
