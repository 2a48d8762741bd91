// src/orchestrator.rs

//! Reads the validated configuration, builds one target per entry, and
//! wires the bulk migrator, the single shared incremental driver, the
//! recovery supervisor, and the status server together. Mirrors the
//! teacher's Warden `run()` — one task per monitored target — but corrected
//! for the invariant that the incremental cycle itself is shared across
//! every target rather than duplicated per target.

use crate::config::{Config, IncrementalMethod, SyncMode, TargetConfig};
use crate::conn::{ConnectionManager, RedisClient, RetryPolicy};
use crate::coordinator::state::{Phase, Statistics, TargetHandle, TargetState};
use crate::coordinator::FanoutCoordinator;
use crate::incremental::{PsyncHandler, ScanIncrementalHandler, SyncHandler};
use crate::migrate::{BulkMigrator, Verifier};
use crate::server;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEDUP_WINDOW: Duration = Duration::from_secs(5);
const MAX_RECENT_COMMANDS: usize = 1000;
/// Placeholder announced via `REPLCONF listening-port`; this engine never
/// accepts inbound replica connections of its own.
const LISTENING_PORT: u16 = 0;

#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self, once: bool) -> Result<()> {
        let states: Arc<DashMap<String, TargetState>> = Arc::new(DashMap::new());
        let stats: Arc<DashMap<String, Statistics>> = Arc::new(DashMap::new());
        let started_at = Instant::now();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let enabled: Vec<TargetConfig> = self
            .config
            .targets
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            anyhow::bail!("no enabled targets configured");
        }

        {
            let mut source = RedisClient::connect(&self.config.source)
                .await
                .context("source unreachable at startup")?;
            if !source.ping().await.context("source did not respond to PING")? {
                anyhow::bail!("source did not respond PONG to PING");
            }
        }

        if once {
            for target in &enabled {
                self.run_full_sync(target, &states, &stats).await;
            }
            info!("--once: full sync complete for every target, exiting");
            return Ok(());
        }

        let mut join_set: JoinSet<()> = JoinSet::new();

        if self.config.web_ui.enabled {
            let web_cfg = self.config.web_ui.clone();
            let states_for_server = states.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            join_set.spawn(async move {
                if let Err(e) =
                    server::run_status_server(web_cfg, states_for_server, started_at, shutdown_rx)
                        .await
                {
                    error!(error = %e, "status server exited with error");
                }
            });
        }

        if self.config.sync.mode != SyncMode::Incremental {
            for target in enabled.clone() {
                let orchestrator = self.clone();
                let states = states.clone();
                let stats = stats.clone();
                join_set.spawn(async move {
                    orchestrator.run_full_sync(&target, &states, &stats).await;
                });
            }
        } else {
            // Incremental-only mode has no bulk migration step to gate on: the
            // operator is asserting targets already hold a matching dataset.
            for target in &enabled {
                states
                    .entry(target.name.clone())
                    .or_default()
                    .phase = Phase::Incremental;
            }
        }

        if self.config.sync.mode != SyncMode::Full {
            let orchestrator = self.clone();
            let states = states.clone();
            let stats = stats.clone();
            let targets = enabled.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            join_set.spawn(async move {
                orchestrator
                    .run_incremental_driver(targets, states, stats, &mut shutdown_rx)
                    .await;
            });
        }

        {
            let orchestrator = self.clone();
            let states = states.clone();
            let stats = stats.clone();
            let targets = enabled.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            join_set.spawn(async move {
                orchestrator
                    .run_recovery_supervisor(targets, states, stats, &mut shutdown_rx)
                    .await;
            });
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to install ctrl-c handler")?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        Ok(())
    }

    async fn run_full_sync(
        &self,
        target: &TargetConfig,
        states: &Arc<DashMap<String, TargetState>>,
        stats: &Arc<DashMap<String, Statistics>>,
    ) {
        states.entry(target.name.clone()).or_default().phase = Phase::Connecting;

        let mut source = match RedisClient::connect(&self.config.source).await {
            Ok(c) => c,
            Err(e) => {
                self.mark_failed(target, states, e);
                return;
            }
        };
        let mut target_client = match RedisClient::connect(&target.endpoint).await {
            Ok(c) => c,
            Err(e) => {
                self.mark_failed(target, states, e);
                return;
            }
        };
        states
            .entry(target.name.clone())
            .and_modify(|s| s.phase = Phase::FullSync);

        let migrator = BulkMigrator::new(&self.config.sync.full_sync);
        let report = match migrator.run(&mut source, &mut target_client, None).await {
            Ok(r) => r,
            Err(e) => {
                self.mark_failed(target, states, e);
                return;
            }
        };
        info!(
            target = %target.name,
            migrated = report.migrated,
            failed = report.failed,
            estimated = report.total_estimated,
            "bulk migration complete"
        );

        if self.config.sync.full_sync.verify_migration {
            let verifier = Verifier::new(
                self.config.sync.full_sync.verify_mode,
                self.config.sync.full_sync.verify_sample_size,
            );
            match verifier
                .run(
                    &mut source,
                    &mut target_client,
                    &self.config.sync.full_sync.pattern,
                )
                .await
            {
                Ok(v) if v.passed() => {
                    info!(target = %target.name, pass_rate = v.pass_rate(), "verification passed");
                }
                Ok(v) => {
                    // A target that failed verification must not start receiving
                    // live traffic on top of a confirmed-bad dataset; force it
                    // unhealthy so the recovery supervisor retries full sync.
                    warn!(target = %target.name, pass_rate = v.pass_rate(), "verification below pass threshold, leaving target unhealthy");
                    states.entry(target.name.clone()).and_modify(|s| {
                        s.phase = Phase::Unhealthy;
                        s.record_failure(
                            format!("verification pass rate {:.3} below threshold", v.pass_rate()),
                            self.config.service.failover.max_failures,
                        );
                    });
                    return;
                }
                Err(e) => {
                    warn!(target = %target.name, error = %e, "verification failed to run, leaving target unhealthy");
                    states.entry(target.name.clone()).and_modify(|s| {
                        s.phase = Phase::Unhealthy;
                        s.record_failure(e.to_string(), self.config.service.failover.max_failures);
                    });
                    return;
                }
            }
        }

        states.entry(target.name.clone()).and_modify(|s| {
            s.phase = Phase::Incremental;
            s.record_success();
        });
        stats
            .entry(target.name.clone())
            .and_modify(|s| {
                s.commands_synced += report.migrated;
                s.commands_failed += report.failed;
            })
            .or_insert(Statistics {
                commands_synced: report.migrated,
                commands_failed: report.failed,
                ..Default::default()
            });
    }

    async fn run_incremental_driver(
        &self,
        targets: Vec<TargetConfig>,
        states: Arc<DashMap<String, TargetState>>,
        stats: Arc<DashMap<String, Statistics>>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let target_handles: Vec<TargetHandle> = targets
            .iter()
            .map(|t| TargetHandle {
                name: t.name.clone(),
                manager: ConnectionManager::new(t.endpoint.clone(), RetryPolicy::default()),
            })
            .collect();
        let mut coordinator = FanoutCoordinator::new(
            target_handles,
            states,
            stats,
            DEDUP_WINDOW,
            MAX_RECENT_COMMANDS,
            self.config.service.failover.max_failures,
        );

        match self.config.sync.incremental_sync.method {
            IncrementalMethod::Scan => {
                self.run_scan_incremental(&mut coordinator, shutdown_rx).await
            }
            IncrementalMethod::Psync => {
                self.run_stream_incremental(&mut coordinator, shutdown_rx, true)
                    .await
            }
            IncrementalMethod::Sync => {
                self.run_stream_incremental(&mut coordinator, shutdown_rx, false)
                    .await
            }
        }
    }

    async fn run_scan_incremental(
        &self,
        coordinator: &mut FanoutCoordinator,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let mut source_mgr =
            ConnectionManager::new(self.config.source.clone(), RetryPolicy::default());
        let handler = ScanIncrementalHandler::new(self.config.sync.incremental_sync.clone());
        let mut last_sync_wall_time = SystemTime::now();
        let mut ticker = tokio::time::interval(self.config.sync.incremental_sync.interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("incremental driver (scan) shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = source_mgr.connect().await {
                        warn!(error = %e, "source reconnect failed, skipping scan cycle");
                        continue;
                    }
                    let Some(representative) = coordinator.targets.first_mut() else { continue };
                    if let Err(e) = representative.manager.connect().await {
                        warn!(error = %e, "representative target unreachable, skipping scan cycle");
                        continue;
                    }

                    let source = source_mgr.client_mut().expect("connected above");
                    let repr_client = representative.manager.client_mut().expect("connected above");
                    let changed = match handler.detect_changes(source, repr_client, last_sync_wall_time).await {
                        Ok(keys) => keys,
                        Err(e) => {
                            warn!(error = %e, "scan change detection failed");
                            continue;
                        }
                    };
                    last_sync_wall_time = SystemTime::now();

                    if changed.is_empty() {
                        continue;
                    }
                    info!(changed = changed.len(), "scan cycle detected changed keys");
                    let source = source_mgr.client_mut().expect("connected above");
                    coordinator
                        .dispatch_changeset(source, &changed, self.config.sync.full_sync.preserve_ttl)
                        .await;
                }
            }
        }
    }

    async fn run_stream_incremental(
        &self,
        coordinator: &mut FanoutCoordinator,
        shutdown_rx: &mut broadcast::Receiver<()>,
        psync: bool,
    ) {
        let mut psync_handler = psync.then(|| PsyncHandler::new(self.config.source.clone(), LISTENING_PORT));
        let mut sync_handler = (!psync).then(|| SyncHandler::new(self.config.source.clone()));

        loop {
            let outcome = if let Some(handler) = psync_handler.as_mut() {
                tokio::select! {
                    _ = shutdown_rx.recv() => { info!("incremental driver (psync) shutting down"); return; }
                    cmd = handler.next_command() => cmd,
                }
            } else {
                let handler = sync_handler.as_mut().expect("sync handler present");
                tokio::select! {
                    _ = shutdown_rx.recv() => { info!("incremental driver (sync) shutting down"); return; }
                    cmd = handler.next_command() => cmd,
                }
            };

            match outcome {
                Ok(cmd) => coordinator.dispatch_command(&cmd).await,
                Err(e) => {
                    warn!(error = %e, "replication stream error, backing off before reconnect");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn run_recovery_supervisor(
        &self,
        targets: Vec<TargetConfig>,
        states: Arc<DashMap<String, TargetState>>,
        stats: Arc<DashMap<String, Statistics>>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let recovery_delay = self.config.service.failover.recovery_delay;
        let mut ticker = tokio::time::interval(RECOVERY_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("recovery supervisor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    for target in &targets {
                        let should_recover = states
                            .get(&target.name)
                            .map(|s| {
                                s.phase == Phase::Unhealthy
                                    && s.last_failure_wall_time
                                        .and_then(|t| t.elapsed().ok())
                                        .map(|elapsed| elapsed >= recovery_delay)
                                        .unwrap_or(true)
                            })
                            .unwrap_or(false);
                        if should_recover {
                            info!(target = %target.name, "attempting recovery full-sync");
                            self.run_full_sync(target, &states, &stats).await;
                        }
                    }
                }
            }
        }
    }

    fn mark_failed(
        &self,
        target: &TargetConfig,
        states: &Arc<DashMap<String, TargetState>>,
        error: impl std::fmt::Display,
    ) {
        error!(target = %target.name, error = %error, "full sync failed");
        let max_failures = self.config.service.failover.max_failures;
        states
            .entry(target.name.clone())
            .or_default()
            .record_failure(error.to_string(), max_failures);
    }
}
