// src/coordinator/mod.rs

//! The fan-out coordinator: owns the single shared incremental cycle for a
//! source and dispatches its output (one `ChangeSet` or one decoded
//! command) to every healthy target in parallel. The coordinator never
//! scans the source more than once per cycle, regardless of target count —
//! full-sync per target runs independently elsewhere.

pub mod state;

use crate::conn::RedisClient;
use crate::errors::ReplError;
use crate::incremental::ReplicatedCommand;
use crate::protocol::RespFrame;
use bytes::Bytes;
use state::{DedupCache, Statistics, TargetHandle, TargetState};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_BATCH_TIMEOUT: Duration = Duration::from_secs(300);
pub const DUMP_RESTORE_BATCH: usize = 500;

pub struct FanoutCoordinator {
    pub targets: Vec<TargetHandle>,
    pub states: Arc<dashmap::DashMap<String, TargetState>>,
    pub stats: Arc<dashmap::DashMap<String, Statistics>>,
    dedup: DedupCache,
    max_failures: u32,
}

impl FanoutCoordinator {
    pub fn new(
        targets: Vec<TargetHandle>,
        states: Arc<dashmap::DashMap<String, TargetState>>,
        stats: Arc<dashmap::DashMap<String, Statistics>>,
        dedup_window: Duration,
        max_recent_commands: usize,
        max_failures: u32,
    ) -> Self {
        for t in &targets {
            states.entry(t.name.clone()).or_default();
            stats.entry(t.name.clone()).or_default();
        }
        Self {
            targets,
            states,
            stats,
            dedup: DedupCache::new(dedup_window, max_recent_commands),
            max_failures,
        }
    }

    /// A target is a valid fan-out destination only once its own full sync
    /// has completed (and passed verification) and it hasn't since gone
    /// unhealthy. A target still `Connecting`/`FullSync` must never receive
    /// live incremental traffic ahead of its own bulk-migrated dataset.
    fn is_healthy(&self, name: &str) -> bool {
        self.states
            .get(name)
            .map(|s| s.accepts_incremental())
            .unwrap_or(false)
    }

    /// PSYNC/SYNC-mode fan-out: applies one decoded command to every
    /// healthy target in parallel via `execute_command`.
    pub async fn dispatch_command(&mut self, cmd: &ReplicatedCommand) {
        if self.dedup.check_and_insert(&cmd.argv) {
            for target in &self.targets {
                if let Some(mut stat) = self.stats.get_mut(&target.name) {
                    stat.commands_deduplicated += 1;
                }
            }
            return;
        }

        let argv = cmd.argv.clone();
        let healthy: Vec<&str> = self
            .targets
            .iter()
            .map(|t| t.name.as_str())
            .filter(|n| self.is_healthy(n))
            .collect();
        let healthy: std::collections::HashSet<&str> = healthy.into_iter().collect();

        let mut futs = Vec::new();
        for target in self.targets.iter_mut() {
            if !healthy.contains(target.name.as_str()) {
                continue;
            }
            let name = target.name.clone();
            let argv = argv.clone();
            futs.push(async move {
                let outcome = tokio::time::timeout(
                    COMMAND_TIMEOUT,
                    target
                        .manager
                        .execute_with_retry(|c| {
                            let argv = argv.clone();
                            async move { c.execute_argv(&argv).await }
                        }),
                )
                .await;
                (name, outcome)
            });
        }

        let results = futures::future::join_all(futs).await;
        for (name, outcome) in results {
            let mut state = self.states.entry(name.clone()).or_default();
            let mut stat = self.stats.entry(name.clone()).or_default();
            stat.commands_received += 1;
            match outcome {
                Ok(Ok(_)) => {
                    state.record_success();
                    stat.commands_synced += 1;
                }
                Ok(Err(e)) => {
                    warn!(target = %name, error = %e, "command replication failed");
                    state.record_failure(e.to_string(), self.max_failures);
                    stat.commands_failed += 1;
                }
                Err(_) => {
                    warn!(target = %name, "command replication timed out");
                    state.record_failure("command timed out", self.max_failures);
                    stat.commands_failed += 1;
                }
            }
        }
    }

    /// SCAN-mode fan-out: DUMPs the change set off the source exactly once,
    /// then RESTOREs it onto every healthy target in parallel.
    pub async fn dispatch_changeset(
        &mut self,
        source: &mut RedisClient,
        keys: &[Bytes],
        preserve_ttl: bool,
    ) {
        for batch in keys.chunks(DUMP_RESTORE_BATCH) {
            let triples = match dump_batch(source, batch, preserve_ttl).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, batch_size = batch.len(), "source DUMP pipeline failed, skipping batch");
                    continue;
                }
            };
            if triples.is_empty() {
                continue;
            }

            let healthy: std::collections::HashSet<&str> = self
                .targets
                .iter()
                .map(|t| t.name.as_str())
                .filter(|n| self.is_healthy(n))
                .collect();

            let mut futs = Vec::new();
            for target in self.targets.iter_mut() {
                if !healthy.contains(target.name.as_str()) {
                    continue;
                }
                let name = target.name.clone();
                let triples = triples.clone();
                futs.push(async move {
                    let outcome = tokio::time::timeout(
                        KEY_BATCH_TIMEOUT,
                        target.manager.execute_with_retry(|c| {
                            let triples = triples.clone();
                            async move { restore_triples(c, &triples).await }
                        }),
                    )
                    .await;
                    (name, outcome)
                });
            }

            let batch_len = triples.len() as u64;
            let results = futures::future::join_all(futs).await;
            for (name, outcome) in results {
                let mut state = self.states.entry(name.clone()).or_default();
                let mut stat = self.stats.entry(name.clone()).or_default();
                match outcome {
                    Ok(Ok(n)) => {
                        stat.commands_received += n;
                        stat.commands_synced += n;
                        state.record_success();
                    }
                    Ok(Err(e)) => {
                        warn!(target = %name, error = %e, "restore batch failed");
                        stat.commands_received += batch_len;
                        stat.commands_failed += batch_len;
                        state.record_failure(e.to_string(), self.max_failures);
                    }
                    Err(_) => {
                        warn!(target = %name, "restore batch timed out");
                        stat.commands_received += batch_len;
                        stat.commands_failed += batch_len;
                        state.record_failure("restore batch timed out", self.max_failures);
                    }
                }
            }
        }
    }
}

async fn dump_batch(
    source: &mut RedisClient,
    keys: &[Bytes],
    preserve_ttl: bool,
) -> Result<Vec<(Bytes, i64, Bytes)>, ReplError> {
    let mut cmds: Vec<Vec<Bytes>> = Vec::with_capacity(keys.len() * 2);
    for key in keys {
        cmds.push(vec![Bytes::from_static(b"DUMP"), key.clone()]);
        if preserve_ttl {
            cmds.push(vec![Bytes::from_static(b"PTTL"), key.clone()]);
        }
    }
    let replies = source.pipeline(&cmds).await?;
    let mut it = replies.into_iter();
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let payload = match it.next() {
            Some(RespFrame::BulkString(b)) => b,
            _ => {
                if preserve_ttl {
                    it.next();
                }
                continue;
            }
        };
        let ttl_ms = if preserve_ttl {
            match it.next() {
                Some(RespFrame::Integer(n)) => n.max(0),
                _ => 0,
            }
        } else {
            0
        };
        out.push((key.clone(), ttl_ms, payload));
    }
    Ok(out)
}

async fn restore_triples(
    client: &mut RedisClient,
    triples: &[(Bytes, i64, Bytes)],
) -> Result<u64, ReplError> {
    let cmds: Vec<Vec<Bytes>> = triples
        .iter()
        .map(|(key, ttl_ms, payload)| {
            vec![
                Bytes::from_static(b"RESTORE"),
                key.clone(),
                ttl_ms.to_string().into_bytes().into(),
                payload.clone(),
                Bytes::from_static(b"REPLACE"),
            ]
        })
        .collect();
    let replies = client.pipeline(&cmds).await?;
    let mut restored = 0u64;
    for reply in replies {
        if let RespFrame::SimpleString(_) = reply {
            restored += 1;
        }
    }
    Ok(restored)
}
