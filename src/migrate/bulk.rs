// src/migrate/bulk.rs

//! The bulk (full) migrator: DUMP/RESTORE batched over non-transactional
//! pipelines, with TTL preservation and sampled-extrapolation progress
//! estimation.

use crate::conn::RedisClient;
use crate::config::FullSyncConfig;
use crate::errors::ReplError;
use crate::protocol::RespFrame;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::warn;

const TYPE_SAMPLE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationReport {
    pub total_estimated: u64,
    pub migrated: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

/// Callback invoked after every migrated page with `(current, total_estimated)`.
pub type ProgressCallback<'a> = dyn FnMut(u64, u64) + Send + 'a;

pub struct BulkMigrator<'a> {
    config: &'a FullSyncConfig,
}

impl<'a> BulkMigrator<'a> {
    pub fn new(config: &'a FullSyncConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        mut progress: Option<&mut ProgressCallback<'_>>,
    ) -> Result<MigrationReport, ReplError> {
        let start = Instant::now();
        if self.config.clear_target {
            target.flushdb().await?;
        }

        let total_estimated = self.estimate_total(source).await?;

        let mut migrated = 0u64;
        let mut failed = 0u64;
        let mut cursor = 0u64;
        loop {
            let (next_cursor, keys) = source
                .scan(cursor, &self.config.pattern, self.config.scan_count)
                .await?;
            cursor = next_cursor;

            if !keys.is_empty() {
                let filtered = self.filter_by_type(source, keys).await?;
                for batch in filtered.chunks(self.config.batch_size) {
                    match self.migrate_batch(source, target, batch).await {
                        Ok((ok, bad)) => {
                            migrated += ok;
                            failed += bad;
                        }
                        Err(e) => {
                            warn!(error = %e, batch_size = batch.len(), "batch migration failed outright");
                            failed += batch.len() as u64;
                        }
                    }
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(migrated + failed, total_estimated);
                    }
                }
            }

            if cursor == 0 {
                break;
            }
        }

        Ok(MigrationReport {
            total_estimated,
            migrated,
            failed,
            elapsed: start.elapsed(),
        })
    }

    async fn estimate_total(&self, source: &mut RedisClient) -> Result<u64, ReplError> {
        let dbsize = source.dbsize().await?.max(0) as u64;
        if dbsize == 0 || (self.config.pattern == "*" && self.config.key_types.is_none()) {
            return Ok(dbsize);
        }

        let (_, sample_keys) = source.scan(0, &self.config.pattern, TYPE_SAMPLE_SIZE).await?;
        let sampled = sample_keys.len().max(1);
        let matching = self.filter_by_type(source, sample_keys).await?.len();
        let ratio = matching as f64 / sampled as f64;
        Ok((ratio * dbsize as f64).round() as u64)
    }

    async fn filter_by_type(
        &self,
        source: &mut RedisClient,
        keys: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, ReplError> {
        let Some(wanted) = &self.config.key_types else {
            return Ok(keys);
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let t = source.type_of(&key).await?;
            if wanted.iter().any(|w| w.eq_ignore_ascii_case(&t)) {
                out.push(key);
            }
        }
        Ok(out)
    }

    /// Migrates one batch via a DUMP(+PTTL) pipeline on the source followed
    /// by a RESTORE pipeline on the target. Returns `(migrated, failed)`;
    /// only a connection-level error propagates as `Err`, per-key rejections
    /// (nil DUMP, target RESTORE error) are folded into `failed`.
    async fn migrate_batch(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        batch: &[Bytes],
    ) -> Result<(u64, u64), ReplError> {
        let mut dump_cmds: Vec<Vec<Bytes>> = Vec::with_capacity(batch.len() * 2);
        for key in batch {
            dump_cmds.push(vec![Bytes::from_static(b"DUMP"), key.clone()]);
            if self.config.preserve_ttl {
                dump_cmds.push(vec![Bytes::from_static(b"PTTL"), key.clone()]);
            }
        }
        let replies = source.pipeline(&dump_cmds).await?;
        let mut replies = replies.into_iter();

        let mut triples = Vec::with_capacity(batch.len());
        let mut failed = 0u64;
        for key in batch {
            let payload = match replies.next() {
                Some(RespFrame::BulkString(b)) => b,
                Some(RespFrame::Null) | None => {
                    failed += 1;
                    if self.config.preserve_ttl {
                        replies.next();
                    }
                    continue;
                }
                Some(_) => {
                    failed += 1;
                    if self.config.preserve_ttl {
                        replies.next();
                    }
                    continue;
                }
            };
            let ttl_ms = if self.config.preserve_ttl {
                match replies.next() {
                    Some(RespFrame::Integer(n)) => n.max(0),
                    _ => 0,
                }
            } else {
                0
            };
            triples.push((key.clone(), ttl_ms, payload));
        }

        if triples.is_empty() {
            return Ok((0, failed));
        }

        let restore_cmds: Vec<Vec<Bytes>> = triples
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
        let restore_replies = target.pipeline(&restore_cmds).await?;

        let mut migrated = 0u64;
        for reply in restore_replies {
            match reply {
                RespFrame::SimpleString(_) => migrated += 1,
                RespFrame::Error(e) => {
                    warn!(error = %e, "target rejected RESTORE for one key");
                    failed += 1;
                }
                _ => failed += 1,
            }
        }
        Ok((migrated, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FullSyncConfig {
        FullSyncConfig {
            pattern: "*".into(),
            key_types: None,
            batch_size: 100,
            scan_count: 1000,
            preserve_ttl: true,
            clear_target: false,
            verify_migration: true,
            verify_mode: crate::config::VerifyMode::Fast,
            verify_sample_size: 100,
        }
    }

    #[test]
    fn default_report_has_zero_counts() {
        let report = MigrationReport::default();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn unfiltered_full_scan_skips_sampling() {
        let cfg = config();
        assert!(cfg.key_types.is_none());
        assert_eq!(cfg.pattern, "*");
    }
}
