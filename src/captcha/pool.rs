//! Ready-to-use verification tokens with TTL eviction.
//!
//! Every mutation bumps a generation counter published on a
//! `tokio::sync::watch` channel. Waiters subscribe while holding the pool
//! mutex, so a change made after they looked at the pool always wakes them.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CaptchaPoolSettings;
use crate::error::{Error, Result};
use crate::model::now_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolItem {
    pub id: Uuid,
    pub token: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl PoolItem {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Item metadata without the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolItemInfo {
    pub id: Uuid,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub settings: CaptchaPoolSettings,
    pub items: Vec<PoolItemInfo>,
}

impl PoolSnapshot {
    pub fn size(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug)]
struct PoolState {
    items: VecDeque<PoolItem>,
    settings: CaptchaPoolSettings,
}

#[derive(Debug)]
pub struct CaptchaPool {
    state: Mutex<PoolState>,
    generation: watch::Sender<u64>,
}

impl CaptchaPool {
    pub fn new(settings: CaptchaPoolSettings) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(PoolState {
                items: VecDeque::new(),
                settings,
            }),
            generation,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the state lock held.
    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn prune_locked(&self, state: &mut PoolState, now_ms: i64) -> usize {
        let before = state.items.len();
        state.items.retain(|item| !item.is_expired(now_ms));
        let removed = before - state.items.len();
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn settings(&self) -> CaptchaPoolSettings {
        self.lock().settings.clone()
    }

    /// Swap sizing and TTL. Items already pooled keep their expiry.
    pub fn update_settings(&self, settings: CaptchaPoolSettings) {
        let mut state = self.lock();
        state.settings = settings;
        self.bump();
    }

    pub fn add(&self, token: impl Into<String>) -> Uuid {
        self.add_at(token, now_ms())
    }

    pub fn add_at(&self, token: impl Into<String>, now_ms: i64) -> Uuid {
        let mut state = self.lock();
        let ttl_ms = (state.settings.item_ttl_seconds as i64).saturating_mul(1000);
        let item = PoolItem {
            id: Uuid::new_v4(),
            token: token.into(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        let id = item.id;
        state.items.push_back(item);
        self.bump();
        id
    }

    /// Pop the oldest unexpired item, if any.
    pub fn try_acquire(&self) -> Option<PoolItem> {
        self.try_acquire_at(now_ms())
    }

    pub fn try_acquire_at(&self, now_ms: i64) -> Option<PoolItem> {
        let mut state = self.lock();
        self.prune_locked(&mut state, now_ms);
        let item = state.items.pop_front()?;
        self.bump();
        Some(item)
    }

    /// Pop the oldest unexpired item, waiting for one to be added.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolItem> {
        loop {
            let mut changes = {
                let mut state = self.lock();
                self.prune_locked(&mut state, now_ms());
                if let Some(item) = state.items.pop_front() {
                    self.bump();
                    return Ok(item);
                }
                self.generation.subscribe()
            };
            cancel
                .run_until_cancelled(changes.changed())
                .await
                .ok_or(Error::Cancelled)?
                .map_err(|_| Error::Captcha("token pool dropped".into()))?;
        }
    }

    pub fn size(&self) -> usize {
        self.size_at(now_ms())
    }

    pub fn size_at(&self, now_ms: i64) -> usize {
        let mut state = self.lock();
        self.prune_locked(&mut state, now_ms);
        state.items.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot_at(now_ms())
    }

    pub fn snapshot_at(&self, now_ms: i64) -> PoolSnapshot {
        let mut state = self.lock();
        self.prune_locked(&mut state, now_ms);
        PoolSnapshot {
            generation: *self.generation.borrow(),
            settings: state.settings.clone(),
            items: state
                .items
                .iter()
                .map(|i| PoolItemInfo {
                    id: i.id,
                    created_at_ms: i.created_at_ms,
                    expires_at_ms: i.expires_at_ms,
                })
                .collect(),
        }
    }

    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let removed = state.items.len();
        state.items.clear();
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Observe every pool change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

impl Default for CaptchaPool {
    fn default() -> Self {
        Self::new(CaptchaPoolSettings::default())
    }
}
