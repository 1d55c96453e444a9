//! Admission control: token buckets, per-account locks, the global
//! in-flight bound, and round-robin account selection.
//!
//! Locks and in-flight slots are semaphore permits, so release happens when
//! the guard drops, exactly once, on every exit path.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::model::AccountId;

// ---------------------------------------------------------------------------
// Rate limiters
// ---------------------------------------------------------------------------

fn quota(qps: f64, burst: u32) -> Option<Quota> {
    if !qps.is_finite() || qps <= 0.0 {
        return None;
    }
    // Rates so small the period overflows a Duration count as disabled.
    let period = Duration::try_from_secs_f64(1.0 / qps).ok()?;
    let burst = NonZeroU32::new(burst.max(1))?;
    Quota::with_period(period).map(|q| q.allow_burst(burst))
}

/// One global bucket plus one bucket per account. Per-account state is
/// created lazily the first time an account waits.
pub struct RateLimiters {
    global: Option<DefaultDirectRateLimiter>,
    per_account: Option<DefaultKeyedRateLimiter<AccountId>>,
}

impl RateLimiters {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            global: quota(limits.global_qps, limits.global_burst).map(RateLimiter::direct),
            per_account: quota(limits.per_account_qps, limits.per_account_burst)
                .map(RateLimiter::keyed),
        }
    }

    /// Block until both buckets grant a token, or the token is cancelled.
    pub async fn wait(&self, account_id: &str, cancel: &CancellationToken) -> Result<()> {
        if let Some(global) = &self.global {
            cancel
                .run_until_cancelled(global.until_ready())
                .await
                .ok_or(Error::Cancelled)?;
        }
        if let Some(per_account) = &self.per_account {
            let key = account_id.to_string();
            cancel
                .run_until_cancelled(per_account.until_key_ready(&key))
                .await
                .ok_or(Error::Cancelled)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiters")
            .field("global", &self.global.is_some())
            .field("per_account", &self.per_account.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Account lock
// ---------------------------------------------------------------------------

/// Single-slot lock for one account.
#[derive(Debug, Clone)]
pub struct AccountLock {
    slot: Arc<Semaphore>,
}

/// Proof that the holder owns the account. Dropping it releases the lock.
#[derive(Debug)]
pub struct AccountGuard {
    _permit: OwnedSemaphorePermit,
}

impl AccountGuard {
    pub fn release(self) {}
}

impl AccountLock {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn try_acquire(&self) -> Option<AccountGuard> {
        Arc::clone(&self.slot)
            .try_acquire_owned()
            .ok()
            .map(|p| AccountGuard { _permit: p })
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AccountGuard> {
        let permit = cancel
            .run_until_cancelled(Arc::clone(&self.slot).acquire_owned())
            .await
            .ok_or(Error::Cancelled)?
            .map_err(|_| Error::Other("account lock closed".into()))?;
        Ok(AccountGuard { _permit: permit })
    }

    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl Default for AccountLock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// In-flight bound
// ---------------------------------------------------------------------------

/// Global cap on concurrently executing attempts.
#[derive(Debug, Clone)]
pub struct InFlightBound {
    slots: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug)]
pub struct InFlightPermit {
    _permit: OwnedSemaphorePermit,
}

impl InFlightBound {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|p| InFlightPermit { _permit: p })
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<InFlightPermit> {
        let permit = cancel
            .run_until_cancelled(Arc::clone(&self.slots).acquire_owned())
            .await
            .ok_or(Error::Cancelled)?
            .map_err(|_| Error::Other("in-flight bound closed".into()))?;
        Ok(InFlightPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Round-robin selection
// ---------------------------------------------------------------------------

/// Accounts in a fixed cyclic order, each with its own lock.
#[derive(Debug, Default)]
pub struct AccountRing {
    ids: Vec<AccountId>,
    locks: HashMap<AccountId, AccountLock>,
    cursor: usize,
}

impl AccountRing {
    pub fn new(ids: Vec<AccountId>) -> Self {
        let locks = ids.iter().map(|id| (id.clone(), AccountLock::new())).collect();
        Self {
            ids,
            locks,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Lock the next free account after the cursor. Locked accounts are
    /// skipped; at most one pass is made, and `None` means every account
    /// is busy.
    pub fn pick(&mut self) -> Option<(AccountId, AccountGuard)> {
        let len = self.ids.len();
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            let id = &self.ids[idx];
            let Some(guard) = self.locks.get(id).and_then(AccountLock::try_acquire) else {
                continue;
            };
            self.cursor = (idx + 1) % len;
            return Some((id.clone(), guard));
        }
        None
    }

    pub fn lock_for(&self, id: &str) -> Option<&AccountLock> {
        self.locks.get(id)
    }
}
