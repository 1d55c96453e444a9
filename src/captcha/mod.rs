//! Verification tokens: a TTL pool in front of a browser-driven slider
//! solver, refilled in the background while targets need tokens.

pub mod breaker;
pub mod maintainer;
pub mod page;
pub mod pool;
pub mod solver;
pub mod trajectory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use maintainer::{DemandSignal, PoolMaintainer};
use pool::{CaptchaPool, PoolSnapshot};
use solver::CaptchaSolver;

pub use breaker::{BreakingService, ChallengeImages, HttpBreaker};
pub use page::{BrowserDriver, CaptchaPage, CaptchaPageManager, PageDriver, PageInfo, PageState};

/// Anything that can hand out a verification token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<String>;
}

/// Pool first, solver on a miss.
pub struct CaptchaService {
    pool: Arc<CaptchaPool>,
    solver: Arc<CaptchaSolver>,
}

impl CaptchaService {
    pub fn new(pool: Arc<CaptchaPool>, solver: Arc<CaptchaSolver>) -> Self {
        Self { pool, solver }
    }

    pub fn pool(&self) -> &Arc<CaptchaPool> {
        &self.pool
    }

    pub fn solver(&self) -> &Arc<CaptchaSolver> {
        &self.solver
    }

    /// Solve `n` tokens one after another and pool them. Failed solves are
    /// logged and skipped; the call fails only if none succeeded.
    pub async fn fill(&self, n: usize, cancel: &CancellationToken) -> Result<usize> {
        let mut added = 0;
        let mut last_error = None;
        for _ in 0..n {
            match self.solver.solve(cancel).await {
                Ok(token) => {
                    self.pool.add(token);
                    added += 1;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(error = %e, "manual fill solve failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if added == 0 => Err(e),
            _ => Ok(added),
        }
    }

    /// Abort every solve in flight. The pool itself is untouched.
    pub fn stop_all_solving(&self) {
        self.solver.pages().stop_all_solving();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Background refill driven by `demand`.
    pub fn maintainer(&self, demand: Arc<dyn DemandSignal>) -> PoolMaintainer {
        let solver: Arc<dyn TokenSource> = self.solver.clone();
        PoolMaintainer::new(Arc::clone(&self.pool), solver, demand)
    }
}

#[async_trait]
impl TokenSource for CaptchaService {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<String> {
        if let Some(item) = self.pool.try_acquire() {
            debug!(item = %item.id, "token served from pool");
            return Ok(item.token);
        }
        self.solver.solve(cancel).await
    }
}
