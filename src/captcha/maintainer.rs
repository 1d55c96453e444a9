//! Background refill of the token pool.
//!
//! While something wants tokens the maintainer keeps `pool_size` tokens
//! ready (counting solves already running); otherwise it lets the pool
//! drain. It re-evaluates on every pool change and on a slow tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::TokenSource;
use super::pool::CaptchaPool;
use crate::config::CaptchaPoolSettings;
use crate::model::now_ms;

/// Tells the maintainer whether tokens are wanted right now.
pub trait DemandSignal: Send + Sync {
    fn wants_tokens(&self, now_ms: i64, settings: &CaptchaPoolSettings) -> bool;
}

/// Demand that never changes. Handy for manual fills and tests.
#[derive(Debug, Clone, Copy)]
pub struct ConstantDemand(pub bool);

impl DemandSignal for ConstantDemand {
    fn wants_tokens(&self, _now_ms: i64, _settings: &CaptchaPoolSettings) -> bool {
        self.0
    }
}

pub struct PoolMaintainer {
    pool: Arc<CaptchaPool>,
    solver: Arc<dyn TokenSource>,
    demand: Arc<dyn DemandSignal>,
    in_progress: Arc<AtomicUsize>,
    tick: Duration,
    failure_pause: Duration,
}

impl PoolMaintainer {
    pub fn new(
        pool: Arc<CaptchaPool>,
        solver: Arc<dyn TokenSource>,
        demand: Arc<dyn DemandSignal>,
    ) -> Self {
        Self {
            pool,
            solver,
            demand,
            in_progress: Arc::new(AtomicUsize::new(0)),
            tick: Duration::from_secs(1),
            failure_pause: Duration::from_secs(2),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_failure_pause(mut self, pause: Duration) -> Self {
        self.failure_pause = pause;
        self
    }

    /// Solves currently running on the pool's behalf.
    pub fn in_progress(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_progress)
    }

    /// Number of tokens the pool should hold right now.
    pub fn desired(&self) -> usize {
        let settings = self.pool.settings();
        if self.demand.wants_tokens(now_ms(), &settings) {
            settings.pool_size
        } else {
            0
        }
    }

    /// Run until `cancel` fires, then wait for outstanding solves.
    pub async fn run(self, cancel: CancellationToken) {
        let mut changes = self.pool.subscribe();
        let solves = TaskTracker::new();
        info!("captcha pool maintainer started");

        loop {
            let desired = self.desired();
            let have = self.pool.size() + self.in_progress.load(Ordering::SeqCst);
            for _ in have..desired {
                self.spawn_solve(&solves, &cancel);
            }
            if desired > have {
                debug!(desired, have, "refilling captcha pool");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
        }

        solves.close();
        solves.wait().await;
        info!("captcha pool maintainer stopped");
    }

    fn spawn_solve(&self, solves: &TaskTracker, cancel: &CancellationToken) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(&self.pool);
        let solver = Arc::clone(&self.solver);
        let in_progress = Arc::clone(&self.in_progress);
        let cancel = cancel.clone();
        let pause = self.failure_pause;

        solves.spawn(async move {
            match solver.acquire_token(&cancel).await {
                Ok(token) => {
                    pool.add(token);
                    in_progress.fetch_sub(1, Ordering::SeqCst);
                }
                Err(e) if e.is_cancelled() => {
                    in_progress.fetch_sub(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(error = %e, "background captcha solve failed");
                    let _ = cancel.run_until_cancelled(tokio::time::sleep(pause)).await;
                    in_progress.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });
    }
}
