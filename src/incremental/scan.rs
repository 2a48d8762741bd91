// src/incremental/scan.rs

//! SCAN-based incremental change detection: a cheap `OBJECT IDLETIME` sweep
//! backed by a value-compare fallback for keys IDLETIME would miss (written
//! but not read since the last cycle).

use crate::conn::RedisClient;
use crate::config::IncrementalSyncConfig;
use crate::errors::ReplError;
use crate::protocol::RespFrame;
use bytes::Bytes;
use std::time::{Duration, SystemTime};

const IDLETIME_BATCH: usize = 1000;
const STAGE_B_CAP: usize = 50_000;
const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

pub struct ScanIncrementalHandler {
    config: IncrementalSyncConfig,
}

impl ScanIncrementalHandler {
    pub fn new(config: IncrementalSyncConfig) -> Self {
        Self { config }
    }

    /// Returns the list of keys believed to have changed since
    /// `last_sync_wall_time`, capped at `max_changes_per_sync`.
    pub async fn detect_changes(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        last_sync_wall_time: SystemTime,
    ) -> Result<Vec<Bytes>, ReplError> {
        let elapsed_since_sync = SystemTime::now()
            .duration_since(last_sync_wall_time)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        let threshold = elapsed_since_sync + CLOCK_SKEW_TOLERANCE_SECS;

        let mut changed = Vec::new();
        let mut seen: std::collections::HashSet<Bytes> = std::collections::HashSet::new();
        let mut cursor = 0u64;

        loop {
            let (next_cursor, keys) = source
                .scan(cursor, &self.config.key_pattern, 1000)
                .await?;
            cursor = next_cursor;

            for batch in keys.chunks(IDLETIME_BATCH) {
                if changed.len() >= self.config.max_changes_per_sync {
                    return Ok(changed);
                }
                let idle_times = idletime_pipeline(source, batch).await?;
                let candidates: Vec<Bytes> = batch
                    .iter()
                    .zip(idle_times)
                    .filter(|(_, idle)| *idle <= threshold)
                    .map(|(key, _)| key.clone())
                    .collect();
                if candidates.is_empty() {
                    continue;
                }
                let allowed = self.type_allowed_pipeline(source, &candidates).await?;
                for (key, ok) in candidates.into_iter().zip(allowed) {
                    if changed.len() >= self.config.max_changes_per_sync {
                        return Ok(changed);
                    }
                    if ok && seen.insert(key.clone()) {
                        changed.push(key);
                    }
                }
            }

            if cursor == 0 {
                break;
            }
        }

        if changed.len() >= self.config.max_changes_per_sync {
            return Ok(changed);
        }

        // Stage B: value-compare backfill for keys Stage A's IDLETIME sweep missed.
        cursor = 0;
        let mut stage_b_scanned = 0usize;
        loop {
            if changed.len() >= self.config.max_changes_per_sync
                || stage_b_scanned >= STAGE_B_CAP
            {
                break;
            }
            let (next_cursor, keys) = source
                .scan(cursor, &self.config.key_pattern, 1000)
                .await?;
            cursor = next_cursor;
            for key in keys {
                if changed.len() >= self.config.max_changes_per_sync
                    || stage_b_scanned >= STAGE_B_CAP
                {
                    break;
                }
                stage_b_scanned += 1;
                if seen.contains(&key) {
                    continue;
                }
                if !self.type_allowed(source, &key).await? {
                    continue;
                }
                if !self.values_match(source, target, &key).await? {
                    seen.insert(key.clone());
                    changed.push(key);
                }
            }
            if cursor == 0 {
                break;
            }
        }

        Ok(changed)
    }

    async fn type_allowed(&self, source: &mut RedisClient, key: &Bytes) -> Result<bool, ReplError> {
        Ok(self
            .type_allowed_pipeline(source, std::slice::from_ref(key))
            .await?
            .into_iter()
            .next()
            .unwrap_or(false))
    }

    /// Pipelines a `TYPE` call per key and checks each against the configured
    /// type allowlist. Keys are all allowed when no allowlist is configured.
    async fn type_allowed_pipeline(
        &self,
        source: &mut RedisClient,
        keys: &[Bytes],
    ) -> Result<Vec<bool>, ReplError> {
        let Some(wanted) = &self.config.key_types else {
            return Ok(vec![true; keys.len()]);
        };
        let cmds: Vec<Vec<Bytes>> = keys
            .iter()
            .map(|k| vec![Bytes::from_static(b"TYPE"), k.clone()])
            .collect();
        let replies = source.pipeline(&cmds).await?;
        Ok(replies
            .into_iter()
            .map(|r| match r {
                RespFrame::SimpleString(t) => wanted.iter().any(|w| w.eq_ignore_ascii_case(&t)),
                _ => false,
            })
            .collect())
    }

    /// Single-key value comparison, type-dispatched the same way the full
    /// verifier compares values, but without its SCAN-by-pattern sampling.
    async fn values_match(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        key: &Bytes,
    ) -> Result<bool, ReplError> {
        if !target.exists(key).await? {
            return Ok(false);
        }
        let source_type = source.type_of(key).await?;
        let target_type = target.type_of(key).await?;
        if source_type != target_type {
            return Ok(false);
        }
        let equal = match source_type.as_str() {
            "string" => source.get(key).await? == target.get(key).await?,
            "list" => source.lrange_all(key).await? == target.lrange_all(key).await?,
            "set" => {
                let mut s = source.smembers(key).await?;
                let mut t = target.smembers(key).await?;
                s.sort();
                t.sort();
                s == t
            }
            "zset" => {
                let mut s = source.zrange_withscores(key).await?;
                let mut t = target.zrange_withscores(key).await?;
                s.sort_by(|a, b| a.0.cmp(&b.0));
                t.sort_by(|a, b| a.0.cmp(&b.0));
                s == t
            }
            "hash" => {
                let mut s = source.hgetall(key).await?;
                let mut t = target.hgetall(key).await?;
                s.sort_by(|a, b| a.0.cmp(&b.0));
                t.sort_by(|a, b| a.0.cmp(&b.0));
                s == t
            }
            _ => true,
        };
        Ok(equal)
    }
}

/// Pipelines `OBJECT IDLETIME` across `keys`, returning one idle-seconds
/// value per key in the same order. Non-integer replies (e.g. a key expired
/// between SCAN and this call) are treated as idle enough to skip.
async fn idletime_pipeline(source: &mut RedisClient, keys: &[Bytes]) -> Result<Vec<i64>, ReplError> {
    let cmds: Vec<Vec<Bytes>> = keys
        .iter()
        .map(|k| vec![Bytes::from_static(b"OBJECT"), Bytes::from_static(b"IDLETIME"), k.clone()])
        .collect();
    let replies = source.pipeline(&cmds).await?;
    Ok(replies
        .into_iter()
        .map(|r| match r {
            RespFrame::Integer(n) => n,
            _ => i64::MAX,
        })
        .collect())
}
