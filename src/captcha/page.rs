//! Pool of reusable challenge pages.
//!
//! A page stays on the challenge URL between solves so the next solve can
//! start without navigating. Failed pages are closed and replaced in the
//! background. The browser itself sits behind [`BrowserDriver`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::model::now_ms;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Driver boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A network response observed by the page.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub url: String,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a fresh, isolated page (its own context and cookies).
    async fn new_page(&self) -> Result<Box<dyn PageDriver>>;
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    async fn element_exists(&self, selector: &str) -> Result<bool>;
    async fn click(&self, selector: &str) -> Result<()>;
    /// Resolves once the element is visible. Callers bound it with a timeout.
    async fn wait_visible(&self, selector: &str) -> Result<()>;
    async fn bounding_box(&self, selector: &str) -> Result<BoundingBox>;
    async fn mouse_move(&self, x: f64, y: f64) -> Result<()>;
    async fn mouse_down(&self) -> Result<()>;
    async fn mouse_up(&self) -> Result<()>;
    /// Current horizontal CSS offset of an element, in px.
    async fn css_offset(&self, selector: &str) -> Result<f64>;
    /// Responses seen from now on.
    fn responses(&self) -> broadcast::Receiver<InterceptedResponse>;
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Idle,
    Busy,
    Refreshing,
}

/// A checked-out page. Hand it back with [`CaptchaPageManager::release`] or
/// [`CaptchaPageManager::discard`].
pub struct CaptchaPage {
    pub id: Uuid,
    pub created_at_ms: i64,
    pub last_opened_at_ms: Option<i64>,
    pub last_used_at_ms: Option<i64>,
    pub last_error: Option<String>,
    driver: Box<dyn PageDriver>,
}

impl CaptchaPage {
    fn new(driver: Box<dyn PageDriver>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at_ms: now_ms(),
            last_opened_at_ms: None,
            last_used_at_ms: None,
            last_error: None,
            driver,
        }
    }

    pub fn driver(&self) -> &dyn PageDriver {
        self.driver.as_ref()
    }

    pub fn mark_opened(&mut self, at_ms: i64) {
        self.last_opened_at_ms = Some(at_ms);
    }

    /// Opened on the challenge URL within `window_ms`.
    pub fn opened_within(&self, now_ms: i64, window_ms: i64) -> bool {
        self.last_opened_at_ms
            .is_some_and(|at| now_ms - at < window_ms)
    }

    fn info(&self, state: PageState) -> PageInfo {
        PageInfo {
            id: self.id,
            state,
            created_at_ms: self.created_at_ms,
            last_opened_at_ms: self.last_opened_at_ms,
            last_used_at_ms: self.last_used_at_ms,
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for CaptchaPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaPage")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .field("last_opened_at_ms", &self.last_opened_at_ms)
            .finish()
    }
}

/// What the live-page list reports about one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub id: Uuid,
    pub state: PageState,
    pub created_at_ms: i64,
    pub last_opened_at_ms: Option<i64>,
    pub last_used_at_ms: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub recreated: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pool {
    idle: VecDeque<CaptchaPage>,
    live: HashMap<Uuid, PageInfo>,
    /// Most pages kept live. Extra pages are closed when they come back.
    capacity: usize,
    started: bool,
    closed: bool,
}

impl Pool {
    /// Live pages other than `id`.
    fn others(&self, id: &Uuid) -> usize {
        self.live.len() - usize::from(self.live.contains_key(id))
    }
}

pub struct CaptchaPageManager {
    browser: Arc<dyn BrowserDriver>,
    config: SolverConfig,
    pool: Mutex<Pool>,
    /// Shared by every solve; swapped for a fresh token on each stop.
    solve_token: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CaptchaPageManager {
    pub fn new(browser: Arc<dyn BrowserDriver>, config: SolverConfig) -> Arc<Self> {
        let pool = Pool {
            capacity: config.page_pool_size.max(1),
            ..Pool::default()
        };
        Arc::new(Self {
            browser,
            config,
            pool: Mutex::new(pool),
            solve_token: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    // -- lifecycle ----------------------------------------------------------

    /// Open the configured number of pages and park them on the challenge URL.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut pool = self.lock();
            if pool.closed {
                return Err(Error::Captcha("page manager is closed".into()));
            }
            if pool.started {
                return Ok(());
            }
            pool.started = true;
        }
        let created = self.ensure_page_pool(self.config.page_pool_size).await?;
        info!(pages = created, "captcha page pool started");
        Ok(())
    }

    /// Start on first use; fail once closed.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        let started = {
            let pool = self.lock();
            if pool.closed {
                return Err(Error::Captcha("page manager is closed".into()));
            }
            pool.started
        };
        if started { Ok(()) } else { self.start().await }
    }

    /// Stop all solves, wait for background replacements, close every page.
    pub async fn close(&self) {
        let idle: Vec<CaptchaPage> = {
            let mut pool = self.lock();
            if pool.closed {
                return;
            }
            pool.closed = true;
            pool.live.clear();
            pool.idle.drain(..).collect()
        };
        self.shutdown.cancel();
        self.stop_all_solving();
        self.tracker.close();
        self.tracker.wait().await;

        // Replacements that finished before the shutdown flag landed.
        let late: Vec<CaptchaPage> = self.lock().idle.drain(..).collect();
        for page in idle.into_iter().chain(late) {
            close_page(&page).await;
        }
        info!("captcha page pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // -- solve cancellation ---------------------------------------------------

    /// Token every solve watches. Cancelled by [`Self::stop_all_solving`].
    pub fn solve_token(&self) -> CancellationToken {
        self.solve_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Abort in-flight solves. Later solves get a fresh token.
    pub fn stop_all_solving(&self) {
        let old = {
            let mut token = self
                .solve_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        old.cancel();
        info!("stopped all captcha solving");
    }

    // -- pages ----------------------------------------------------------------

    async fn create_page(&self) -> Result<CaptchaPage> {
        let driver = self.browser.new_page().await?;
        Ok(CaptchaPage::new(driver))
    }

    /// Park a page on the challenge URL. Failures are recorded on the page.
    async fn warm(&self, page: &mut CaptchaPage) {
        if self.config.challenge_url.is_empty() {
            return;
        }
        match page.driver.goto(&self.config.challenge_url).await {
            Ok(()) => {
                page.mark_opened(now_ms());
                page.last_error = None;
            }
            Err(e) => {
                warn!(page = %page.id, error = %e, "page warmup failed");
                page.last_error = Some(e.to_string());
            }
        }
    }

    /// Pool a page as idle. The page is closed instead when the manager has
    /// shut down or the pool is already at capacity without it.
    async fn park(&self, page: CaptchaPage) {
        let rejected = {
            let mut pool = self.lock();
            if pool.closed || pool.others(&page.id) >= pool.capacity {
                pool.live.remove(&page.id);
                Some(page)
            } else {
                pool.live.insert(page.id, page.info(PageState::Idle));
                pool.idle.push_back(page);
                None
            }
        };
        if let Some(page) = rejected {
            debug!(page = %page.id, "closing surplus captcha page");
            close_page(&page).await;
        }
    }

    /// Check out a page: the oldest idle one, or a new one.
    pub async fn acquire(&self) -> Result<CaptchaPage> {
        {
            let mut pool = self.lock();
            if pool.closed {
                return Err(Error::Captcha("page manager is closed".into()));
            }
            if let Some(page) = pool.idle.pop_front() {
                pool.live.insert(page.id, page.info(PageState::Busy));
                return Ok(page);
            }
        }
        let page = self.create_page().await?;
        let closed = {
            let mut pool = self.lock();
            if !pool.closed {
                pool.live.insert(page.id, page.info(PageState::Busy));
            }
            pool.closed
        };
        if closed {
            close_page(&page).await;
            return Err(Error::Captcha("page manager is closed".into()));
        }
        debug!(page = %page.id, "created captcha page");
        Ok(page)
    }

    /// Return a page as-is. It stays on whatever it was showing.
    pub async fn release(&self, mut page: CaptchaPage) {
        page.last_used_at_ms = Some(now_ms());
        self.park(page).await;
    }

    /// Drop a page from the pool and rebuild a replacement in the background.
    pub fn discard(self: &Arc<Self>, page: CaptchaPage, reason: &str) {
        self.lock().live.remove(&page.id);
        metrics::pages_discarded().add(1, &[]);
        warn!(page = %page.id, reason, "discarding captcha page");

        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            close_page(&page).await;
            if manager.shutdown.is_cancelled() {
                return;
            }
            let full = {
                let pool = manager.lock();
                pool.live.len() >= pool.capacity
            };
            if full {
                debug!(old = %page.id, "pool at capacity, no replacement");
                return;
            }
            let created = manager
                .shutdown
                .run_until_cancelled(manager.create_page())
                .await;
            match created {
                Some(Ok(mut fresh)) => {
                    manager.warm(&mut fresh).await;
                    debug!(old = %page.id, new = %fresh.id, "captcha page replaced");
                    manager.park(fresh).await;
                }
                Some(Err(e)) => warn!(error = %e, "replacement page creation failed"),
                None => {}
            }
        });
    }

    /// Re-navigate every idle page. A page that fails to navigate (or every
    /// page, with `force_recreate`) is closed and rebuilt in place.
    pub async fn refresh_all(&self, force_recreate: bool) -> Result<RefreshReport> {
        let pages: Vec<CaptchaPage> = {
            let mut pool = self.lock();
            if pool.closed {
                return Err(Error::Captcha("page manager is closed".into()));
            }
            let pages: Vec<CaptchaPage> = pool.idle.drain(..).collect();
            for page in &pages {
                pool.live.insert(page.id, page.info(PageState::Refreshing));
            }
            pages
        };

        let mut report = RefreshReport::default();
        for mut page in pages {
            if !force_recreate && !self.config.challenge_url.is_empty() {
                match page.driver.goto(&self.config.challenge_url).await {
                    Ok(()) => {
                        page.mark_opened(now_ms());
                        page.last_error = None;
                        report.refreshed += 1;
                        self.park(page).await;
                        continue;
                    }
                    Err(e) => warn!(page = %page.id, error = %e, "refresh failed, recreating"),
                }
            }

            self.lock().live.remove(&page.id);
            close_page(&page).await;
            match self.create_page().await {
                Ok(mut fresh) => {
                    self.warm(&mut fresh).await;
                    report.recreated += 1;
                    self.park(fresh).await;
                }
                Err(e) => {
                    warn!(error = %e, "page recreation failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            refreshed = report.refreshed,
            recreated = report.recreated,
            failed = report.failed,
            "captcha pages refreshed"
        );
        Ok(report)
    }

    /// Make `n` the pool capacity and open and warm pages until `n` are
    /// live. Returns how many were opened.
    pub async fn ensure_page_pool(&self, n: usize) -> Result<usize> {
        let live = {
            let mut pool = self.lock();
            if pool.closed {
                return Err(Error::Captcha("page manager is closed".into()));
            }
            pool.capacity = n.max(1);
            pool.live.len()
        };
        let mut created = 0;
        for _ in live..n {
            let mut page = self.create_page().await?;
            self.warm(&mut page).await;
            self.park(page).await;
            created += 1;
        }
        Ok(created)
    }

    /// Every live page, oldest first.
    pub fn pages(&self) -> Vec<PageInfo> {
        let mut pages: Vec<PageInfo> = self.lock().live.values().cloned().collect();
        pages.sort_by_key(|p| (p.created_at_ms, p.id));
        pages
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Most pages kept live.
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

async fn close_page(page: &CaptchaPage) {
    if let Err(e) = page.driver.close().await {
        debug!(page = %page.id, error = %e, "page close failed");
    }
}

impl std::fmt::Debug for CaptchaPageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.lock();
        f.debug_struct("CaptchaPageManager")
            .field("live", &pool.live.len())
            .field("idle", &pool.idle.len())
            .field("closed", &pool.closed)
            .finish()
    }
}
