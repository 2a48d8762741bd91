// src/coordinator/state.rs

//! Per-target lifecycle state, statistics, and the dedup cache shared by
//! both incremental modes.

use crate::conn::ConnectionManager;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    FullSync,
    Incremental,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct TargetState {
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub last_sync_wall_time: Option<SystemTime>,
    pub last_failure_wall_time: Option<SystemTime>,
    pub last_error: Option<String>,
    pub total_synced: u64,
    pub total_failed: u64,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            consecutive_failures: 0,
            last_sync_wall_time: None,
            last_failure_wall_time: None,
            last_error: None,
            total_synced: 0,
            total_failed: 0,
        }
    }
}

impl TargetState {
    pub fn is_healthy(&self) -> bool {
        !matches!(self.phase, Phase::Unhealthy)
    }

    /// Ready to receive live incremental traffic: full sync (if any) has
    /// already completed and passed verification for this target.
    pub fn accepts_incremental(&self) -> bool {
        self.phase == Phase::Incremental
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_synced += 1;
        self.last_sync_wall_time = Some(SystemTime::now());
    }

    pub fn record_failure(&mut self, error: impl Into<String>, max_failures: u32) {
        self.consecutive_failures += 1;
        self.total_failed += 1;
        self.last_error = Some(error.into());
        self.last_failure_wall_time = Some(SystemTime::now());
        if self.consecutive_failures >= max_failures {
            self.phase = Phase::Unhealthy;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub commands_received: u64,
    pub commands_synced: u64,
    pub commands_failed: u64,
    pub commands_deduplicated: u64,
}

/// Bounded LRU of `hash(argv) -> last seen at`, suppressing repeats within
/// `dedup_window`.
pub struct DedupCache {
    window: Duration,
    inner: Mutex<LruCache<u128, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration, max_recent_commands: usize) -> Self {
        let cap = NonZeroUsize::new(max_recent_commands.max(1)).unwrap();
        Self {
            window,
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns `true` if `argv` was seen within the dedup window and should
    /// be suppressed; otherwise records it and returns `false`.
    pub fn check_and_insert(&self, argv: &[Bytes]) -> bool {
        let hash = Self::hash_argv(argv);
        let mut cache = self.inner.lock();
        if let Some(seen_at) = cache.get(&hash) {
            if seen_at.elapsed() < self.window {
                return true;
            }
        }
        cache.put(hash, Instant::now());
        false
    }

    fn hash_argv(argv: &[Bytes]) -> u128 {
        use std::hash::{Hash, Hasher};
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        0xA5u8.hash(&mut h2);
        for part in argv {
            part.hash(&mut h1);
            part.hash(&mut h2);
        }
        let low = h1.finish() as u128;
        let high = h2.finish() as u128;
        (high << 64) | low
    }
}

/// One target's live connection plus its identity, owned exclusively by the
/// coordinator that drives it.
pub struct TargetHandle {
    pub name: String,
    pub manager: ConnectionManager,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_repeat_within_window() {
        let cache = DedupCache::new(Duration::from_secs(5), 10);
        let argv = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"x")];
        assert!(!cache.check_and_insert(&argv));
        assert!(cache.check_and_insert(&argv));
    }

    #[test]
    fn dedup_distinguishes_different_commands() {
        let cache = DedupCache::new(Duration::from_secs(5), 10);
        let a = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"x")];
        let b = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"y")];
        assert!(!cache.check_and_insert(&a));
        assert!(!cache.check_and_insert(&b));
    }

    #[test]
    fn target_becomes_unhealthy_after_max_failures() {
        let mut state = TargetState::default();
        state.phase = Phase::Incremental;
        for _ in 0..3 {
            state.record_failure("boom", 3);
        }
        assert_eq!(state.phase, Phase::Unhealthy);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 50,
            ..ProptestConfig::default()
        })]

        /// `TargetState` only ever becomes `Unhealthy` once `consecutive_failures`
        /// has reached `max_failures`, never before, and a single intervening
        /// success always resets the counter back to zero.
        #[test]
        fn target_state_unhealthy_iff_consecutive_failures_reach_max(
            failures in 0usize..20,
            max_failures in 1u32..10,
            succeed_before_last in prop::bool::ANY,
        ) {
            let mut state = TargetState::default();
            state.phase = Phase::Incremental;

            if succeed_before_last && failures > 0 && max_failures > 1 {
                state.record_failure("boom", max_failures);
                prop_assert!(state.consecutive_failures <= max_failures);
                prop_assert_ne!(state.phase, Phase::Unhealthy);
                state.record_success();
                prop_assert_eq!(state.consecutive_failures, 0);
            }

            for _ in 0..failures {
                state.record_failure("boom", max_failures);
            }

            if failures as u32 >= max_failures {
                prop_assert_eq!(state.phase, Phase::Unhealthy);
            } else {
                prop_assert_ne!(state.phase, Phase::Unhealthy);
            }
        }

        /// The dedup cache suppresses an exact repeat of the same command
        /// submitted back to back, and never suppresses a different command
        /// that has never been seen before.
        #[test]
        fn dedup_cache_suppresses_only_exact_repeats(
            a in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..6),
            b in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..6),
        ) {
            let cache = DedupCache::new(Duration::from_secs(5), 1000);
            let argv_a: Vec<Bytes> = a.iter().map(|v| Bytes::from(v.clone())).collect();
            let argv_b: Vec<Bytes> = b.iter().map(|v| Bytes::from(v.clone())).collect();

            let first_a = cache.check_and_insert(&argv_a);
            prop_assert!(!first_a);
            let repeat_a = cache.check_and_insert(&argv_a);
            prop_assert!(repeat_a);

            if argv_a != argv_b {
                let first_b = cache.check_and_insert(&argv_b);
                prop_assert!(!first_b);
            }
        }
    }
}
