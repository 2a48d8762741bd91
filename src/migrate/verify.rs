// src/migrate/verify.rs

//! Post-migration verification: a cheap "fast" sampled check, or an
//! exhaustive "full" value-equal comparison.

use crate::conn::RedisClient;
use crate::config::VerifyMode;
use crate::errors::ReplError;
use crate::protocol::RespFrame;
use bytes::Bytes;

const PASS_THRESHOLD: f64 = 0.95;
const TTL_TOLERANCE_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyReport {
    pub total_compared: u64,
    pub matching: u64,
    pub missing_in_target: u64,
    pub type_mismatch: u64,
    pub value_mismatch: u64,
}

impl VerifyReport {
    pub fn pass_rate(&self) -> f64 {
        if self.total_compared == 0 {
            return 1.0;
        }
        self.matching as f64 / self.total_compared as f64
    }

    pub fn passed(&self) -> bool {
        self.pass_rate() >= PASS_THRESHOLD
    }
}

pub struct Verifier {
    mode: VerifyMode,
    sample_size: usize,
}

impl Verifier {
    pub fn new(mode: VerifyMode, sample_size: usize) -> Self {
        Self { mode, sample_size }
    }

    pub async fn run(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        pattern: &str,
    ) -> Result<VerifyReport, ReplError> {
        let keys = self.sample_keys(source, pattern).await?;
        match self.mode {
            VerifyMode::Fast => self.verify_fast(source, target, &keys).await,
            VerifyMode::Full => self.verify_full(source, target, &keys).await,
        }
    }

    async fn sample_keys(
        &self,
        source: &mut RedisClient,
        pattern: &str,
    ) -> Result<Vec<Bytes>, ReplError> {
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, page) = source.scan(cursor, pattern, self.sample_size).await?;
            keys.extend(page);
            cursor = next_cursor;
            if cursor == 0 || keys.len() >= self.sample_size {
                break;
            }
        }
        keys.truncate(self.sample_size);
        Ok(keys)
    }

    async fn verify_fast(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        keys: &[Bytes],
    ) -> Result<VerifyReport, ReplError> {
        let mut report = VerifyReport::default();
        if keys.is_empty() {
            return Ok(report);
        }

        let source_type_cmds: Vec<Vec<Bytes>> = keys
            .iter()
            .map(|k| vec![Bytes::from_static(b"TYPE"), k.clone()])
            .collect();
        let target_cmds: Vec<Vec<Bytes>> = keys
            .iter()
            .flat_map(|k| {
                [
                    vec![Bytes::from_static(b"EXISTS"), k.clone()],
                    vec![Bytes::from_static(b"TYPE"), k.clone()],
                ]
            })
            .collect();

        let source_replies = source.pipeline(&source_type_cmds).await?;
        let target_replies = target.pipeline(&target_cmds).await?;

        let mut target_it = target_replies.into_iter();
        for source_reply in source_replies {
            report.total_compared += 1;
            let exists = matches!(target_it.next(), Some(RespFrame::Integer(n)) if n > 0);
            let target_type = match target_it.next() {
                Some(RespFrame::SimpleString(t)) => t,
                _ => String::new(),
            };
            if !exists {
                report.missing_in_target += 1;
                continue;
            }
            let source_type = match source_reply {
                RespFrame::SimpleString(t) => t,
                _ => String::new(),
            };
            if source_type != target_type {
                report.type_mismatch += 1;
                continue;
            }
            report.matching += 1;
        }
        Ok(report)
    }

    async fn verify_full(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        keys: &[Bytes],
    ) -> Result<VerifyReport, ReplError> {
        let mut report = VerifyReport::default();
        for key in keys {
            report.total_compared += 1;
            if !target.exists(key).await? {
                report.missing_in_target += 1;
                continue;
            }
            let source_type = source.type_of(key).await?;
            let target_type = target.type_of(key).await?;
            if source_type != target_type {
                report.type_mismatch += 1;
                continue;
            }

            let values_match = self
                .values_equal(source, target, key, &source_type)
                .await?;
            if !values_match {
                report.value_mismatch += 1;
                continue;
            }

            if !self.ttl_within_tolerance(source, target, key).await? {
                report.value_mismatch += 1;
                continue;
            }

            report.matching += 1;
        }
        Ok(report)
    }

    async fn values_equal(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        key: &[u8],
        kind: &str,
    ) -> Result<bool, ReplError> {
        Ok(match kind {
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
        })
    }

    async fn ttl_within_tolerance(
        &self,
        source: &mut RedisClient,
        target: &mut RedisClient,
        key: &[u8],
    ) -> Result<bool, ReplError> {
        let source_ttl = source.ttl(key).await?;
        let target_ttl = target.ttl(key).await?;
        if source_ttl <= 0 || target_ttl <= 0 {
            return Ok(true);
        }
        Ok((source_ttl - target_ttl).abs() <= TTL_TOLERANCE_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_rate_is_perfect_when_nothing_was_compared() {
        let report = VerifyReport::default();
        assert_eq!(report.pass_rate(), 1.0);
        assert!(report.passed());
    }

    #[test]
    fn fails_below_threshold() {
        let report = VerifyReport {
            total_compared: 100,
            matching: 90,
            missing_in_target: 10,
            type_mismatch: 0,
            value_mismatch: 0,
        };
        assert!(!report.passed());
    }

    #[test]
    fn passes_at_threshold() {
        let report = VerifyReport {
            total_compared: 100,
            matching: 95,
            missing_in_target: 5,
            type_mismatch: 0,
            value_mismatch: 0,
        };
        assert!(report.passed());
    }
}
