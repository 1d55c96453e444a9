//! Preflight memoization and failure backoff.
//!
//! A "can buy" preflight is reusable for a few seconds by the same account
//! on the same target. Preflight errors push the target's next preflight
//! out exponentially, but never earlier than a pending rush start.

use std::collections::HashMap;
use std::time::Duration;

use crate::model::{AccountId, PreflightResult, TargetId};

/// Failures beyond this count stop doubling the delay.
const MAX_DOUBLINGS: u32 = 4;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: PreflightResult,
    at_ms: i64,
}

#[derive(Debug)]
pub struct PreflightCache {
    ttl_ms: i64,
    entries: HashMap<(AccountId, TargetId), CacheEntry>,
}

impl PreflightCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as i64,
            entries: HashMap::new(),
        }
    }

    /// A hit must exist, carry a payload, and be younger than the TTL.
    /// Anything else found under the key is dropped.
    pub fn get(&mut self, account_id: &str, target_id: &str, now_ms: i64) -> Option<PreflightResult> {
        let key = (account_id.to_string(), target_id.to_string());
        let entry = self.entries.get(&key)?;
        let fresh = now_ms - entry.at_ms < self.ttl_ms;
        if fresh && entry.result.can_buy && entry.result.has_payload() {
            return Some(entry.result.clone());
        }
        self.entries.remove(&key);
        None
    }

    /// Remember a "can buy" result; any other result clears the key.
    pub fn record(&mut self, account_id: &str, target_id: &str, result: &PreflightResult, now_ms: i64) {
        let key = (account_id.to_string(), target_id.to_string());
        if result.can_buy && result.has_payload() {
            self.entries.insert(
                key,
                CacheEntry {
                    result: result.clone(),
                    at_ms: now_ms,
                },
            );
        } else {
            self.entries.remove(&key);
        }
    }

    pub fn invalidate(&mut self, account_id: &str, target_id: &str) {
        self.entries
            .remove(&(account_id.to_string(), target_id.to_string()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BackoffState {
    failures: u32,
    retry_at_ms: i64,
}

#[derive(Debug)]
pub struct PreflightBackoff {
    base_ms: i64,
    max_ms: i64,
    targets: HashMap<TargetId, BackoffState>,
}

/// `min(base * 2^min(failures - 1, 4), max)`; zero failures means no delay.
pub fn backoff_delay_ms(base_ms: i64, max_ms: i64, failures: u32) -> i64 {
    if failures == 0 {
        return 0;
    }
    let doublings = (failures - 1).min(MAX_DOUBLINGS);
    base_ms.saturating_mul(1 << doublings).min(max_ms)
}

impl PreflightBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as i64,
            max_ms: max.as_millis() as i64,
            targets: HashMap::new(),
        }
    }

    /// Count a failure and return the instant the next preflight may run.
    /// `rush_at_ms` (if non-zero and still ahead) is a floor.
    pub fn record_failure(&mut self, target_id: &str, now_ms: i64, rush_at_ms: i64) -> i64 {
        let state = self.targets.entry(target_id.to_string()).or_default();
        state.failures = state.failures.saturating_add(1);
        let mut retry_at = now_ms + backoff_delay_ms(self.base_ms, self.max_ms, state.failures);
        if rush_at_ms > now_ms {
            retry_at = retry_at.max(rush_at_ms);
        }
        state.retry_at_ms = retry_at;
        retry_at
    }

    pub fn record_success(&mut self, target_id: &str) {
        self.targets.remove(target_id);
    }

    pub fn can_preflight_now(&self, target_id: &str, now_ms: i64) -> bool {
        self.targets
            .get(target_id)
            .is_none_or(|s| now_ms >= s.retry_at_ms)
    }

    pub fn failures(&self, target_id: &str) -> u32 {
        self.targets.get(target_id).map_or(0, |s| s.failures)
    }

    pub fn retry_at(&self, target_id: &str) -> Option<i64> {
        self.targets.get(target_id).map(|s| s.retry_at_ms)
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }
}
