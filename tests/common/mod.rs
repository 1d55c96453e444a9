//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rushbuy::captcha::breaker::{BreakingService, ChallengeImages};
use rushbuy::captcha::page::{BoundingBox, BrowserDriver, InterceptedResponse, PageDriver};
use rushbuy::captcha::TokenSource;
use rushbuy::config::SolverConfig;
use rushbuy::error::{Error, Result};
use rushbuy::event::{Bus, EventKind, LogLevel};
use rushbuy::model::{Account, Mode, OrderResult, PreflightResult, Target, now_ms};
use rushbuy::provider::{OrderOutcome, PreflightOutcome, Provider};
use rushbuy::store::MemoryStore;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        mobile: format!("1380000{id}"),
        token: format!("tok-{id}"),
        ..Account::default()
    }
}

pub fn accounts(n: usize) -> Vec<Account> {
    (0..n).map(|i| account(&format!("a{i}"))).collect()
}

pub fn scan_target(id: &str, target_qty: u32) -> Target {
    Target {
        id: id.to_string(),
        name: format!("item {id}"),
        mode: Mode::Scan,
        target_qty,
        per_order_qty: 1,
        item_id: format!("item-{id}"),
        sku_id: format!("sku-{id}"),
        shop_id: "shop-1".to_string(),
        enabled: true,
        ..Target::default()
    }
}

pub fn rush_target(id: &str, target_qty: u32, rush_at_ms: i64) -> Target {
    Target {
        mode: Mode::Rush,
        rush_at_ms,
        ..scan_target(id, target_qty)
    }
}

pub fn store(accounts: Vec<Account>, targets: Vec<Target>) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(accounts, targets))
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Scriptable shop. Tracks how many calls run at once, overall and per account.
#[derive(Default)]
pub struct FakeProvider {
    pub need_captcha: bool,
    pub cannot_buy: AtomicBool,
    /// Preflight never returns (until the caller gives up).
    pub stall_preflight: bool,
    pub preflight_delay: Duration,
    pub order_delay: Duration,
    pub fail_preflights: AtomicBool,
    pub reject_orders: AtomicBool,
    /// `create_order` panics instead of returning.
    pub panic_orders: AtomicBool,
    pub panics: AtomicU32,
    pub preflights: AtomicU32,
    pub orders: AtomicU32,
    pub captcha_tokens: Mutex<Vec<Option<String>>>,
    active: Mutex<HashMap<String, usize>>,
    active_total: AtomicUsize,
    pub max_active_total: AtomicUsize,
    pub account_overlap: AtomicBool,
}

struct ActiveCall<'a> {
    provider: &'a FakeProvider,
    account: String,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.provider.active_total.fetch_sub(1, Ordering::SeqCst);
        let mut active = self.provider.active.lock().unwrap();
        if let Some(n) = active.get_mut(&self.account) {
            *n -= 1;
        }
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_captcha(mut self) -> Self {
        self.need_captcha = true;
        self
    }

    pub fn with_delays(mut self, preflight: Duration, order: Duration) -> Self {
        self.preflight_delay = preflight;
        self.order_delay = order;
        self
    }

    pub fn stalling(mut self) -> Self {
        self.stall_preflight = true;
        self
    }

    fn enter(&self, account: &str) -> ActiveCall<'_> {
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_total.fetch_max(total, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap();
        let n = active.entry(account.to_string()).or_insert(0);
        *n += 1;
        if *n > 1 {
            self.account_overlap.store(true, Ordering::SeqCst);
        }
        ActiveCall {
            provider: self,
            account: account.to_string(),
        }
    }

    pub fn orders(&self) -> u32 {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn preflights(&self) -> u32 {
        self.preflights.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn preflight(&self, account: &Account, target: &Target) -> Result<PreflightOutcome> {
        let _call = self.enter(&account.id);
        self.preflights.fetch_add(1, Ordering::SeqCst);
        if self.stall_preflight {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.preflight_delay).await;
        if self.fail_preflights.load(Ordering::SeqCst) {
            return Err(Error::Provider("preflight 503".into()));
        }
        let mut updated = account.clone();
        updated
            .cookies
            .insert("session".into(), format!("s-{}", now_ms()));
        Ok(PreflightOutcome {
            result: PreflightResult {
                can_buy: !self.cannot_buy.load(Ordering::SeqCst),
                need_captcha: self.need_captcha,
                total_fee: 1999,
                trace_id: format!("pf-{}", target.id),
                render_payload: json!({ "sku": target.sku_id }),
            },
            account: updated,
        })
    }

    async fn create_order(
        &self,
        account: &Account,
        _target: &Target,
        preflight: &PreflightResult,
        captcha_token: Option<&str>,
    ) -> Result<OrderOutcome> {
        let _call = self.enter(&account.id);
        tokio::time::sleep(self.order_delay).await;
        if self.panic_orders.load(Ordering::SeqCst) {
            self.panics.fetch_add(1, Ordering::SeqCst);
            panic!("shop client blew up");
        }
        self.captcha_tokens
            .lock()
            .unwrap()
            .push(captcha_token.map(str::to_string));
        if self.reject_orders.load(Ordering::SeqCst) {
            return Ok(OrderOutcome {
                result: OrderResult {
                    success: false,
                    order_id: String::new(),
                    trace_id: preflight.trace_id.clone(),
                },
                account: account.clone(),
            });
        }
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OrderOutcome {
            result: OrderResult {
                success: true,
                order_id: format!("O{n:04}"),
                trace_id: preflight.trace_id.clone(),
            },
            account: account.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBus {
    pub events: Mutex<Vec<EventKind>>,
    pub logs: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingBus {
    pub fn events(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_log(&self, message: &str) -> bool {
        self.logs.lock().unwrap().iter().any(|(_, m)| m == message)
    }
}

impl Bus for RecordingBus {
    fn log(&self, level: LogLevel, message: &str, _fields: serde_json::Value) {
        self.logs.lock().unwrap().push((level, message.to_string()));
    }

    fn publish(&self, kind: EventKind) {
        self.events.lock().unwrap().push(kind);
    }
}

// ---------------------------------------------------------------------------
// Token sources
// ---------------------------------------------------------------------------

/// Hands out `fixed-1`, `fixed-2`, ... after an optional delay.
#[derive(Default)]
pub struct CountingTokens {
    pub delay: Duration,
    pub fail: AtomicBool,
    pub issued: AtomicU32,
}

#[async_trait]
impl TokenSource for CountingTokens {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<String> {
        cancel
            .run_until_cancelled(tokio::time::sleep(self.delay))
            .await
            .ok_or(Error::Cancelled)?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Captcha("solver down".into()));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("fixed-{n}"))
    }
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

pub const BG_URL: &str = "https://challenge.test/captcha/bg/1.png";
pub const SLIDE_URL: &str = "https://challenge.test/captcha/slide/1.png";
pub const VERIFY_URL: &str = "https://challenge.test/captcha/verify?cb=jq1";

pub fn solver_config() -> SolverConfig {
    SolverConfig {
        challenge_url: "https://challenge.test/page".to_string(),
        page_pool_size: 1,
        drag_step_delay: Duration::ZERO,
        ..SolverConfig::default()
    }
}

/// Knobs and counters shared by every page a [`FakeBrowser`] opens.
#[derive(Default)]
pub struct BrowserScript {
    pub reject_verification: AtomicBool,
    pub fail_goto: AtomicBool,
    /// Delay before a new page is handed out.
    pub new_page_delay_ms: AtomicU64,
    pub pages_created: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub gotos: AtomicUsize,
    pub reloads: AtomicUsize,
    pub clicks: AtomicUsize,
    pub tokens_issued: AtomicU32,
}

#[derive(Default, Clone)]
pub struct FakeBrowser {
    pub script: Arc<BrowserScript>,
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>> {
        let delay = self.script.new_page_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.script.pages_created.fetch_add(1, Ordering::SeqCst);
        let (responses, _) = broadcast::channel(32);
        Ok(Box::new(FakePage {
            script: Arc::clone(&self.script),
            responses,
            pointer: Mutex::new(PointerState::default()),
        }))
    }
}

#[derive(Default)]
struct PointerState {
    x: f64,
    pressed_at: Option<f64>,
    piece: f64,
}

/// Page whose puzzle piece follows the pointer 1:1 while pressed.
pub struct FakePage {
    script: Arc<BrowserScript>,
    responses: broadcast::Sender<InterceptedResponse>,
    pointer: Mutex<PointerState>,
}

impl FakePage {
    fn emit(&self, url: &str, body: &[u8]) {
        let _ = self.responses.send(InterceptedResponse {
            url: url.to_string(),
            body: body.to_vec(),
        });
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, _url: &str) -> Result<()> {
        self.script.gotos.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_goto.load(Ordering::SeqCst) {
            return Err(Error::Captcha("navigation failed".into()));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.script.reloads.fetch_add(1, Ordering::SeqCst);
        self.pointer.lock().unwrap().piece = 0.0;
        Ok(())
    }

    async fn element_exists(&self, _selector: &str) -> Result<bool> {
        Ok(true)
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        self.script.clicks.fetch_add(1, Ordering::SeqCst);
        self.emit(BG_URL, b"background-bytes");
        self.emit(SLIDE_URL, b"slider-bytes");
        Ok(())
    }

    async fn wait_visible(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn bounding_box(&self, _selector: &str) -> Result<BoundingBox> {
        Ok(BoundingBox {
            x: 10.0,
            y: 100.0,
            width: 40.0,
            height: 40.0,
        })
    }

    async fn mouse_move(&self, x: f64, _y: f64) -> Result<()> {
        let mut p = self.pointer.lock().unwrap();
        p.x = x;
        if let Some(origin) = p.pressed_at {
            p.piece = (x - origin).max(0.0);
        }
        Ok(())
    }

    async fn mouse_down(&self) -> Result<()> {
        let mut p = self.pointer.lock().unwrap();
        p.pressed_at = Some(p.x);
        Ok(())
    }

    async fn mouse_up(&self) -> Result<()> {
        self.pointer.lock().unwrap().pressed_at = None;
        if self.script.reject_verification.load(Ordering::SeqCst) {
            self.emit(VERIFY_URL, br#"jq1({"success":false,"msg":"mismatch"})"#);
        } else {
            let n = self.script.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
            let body = format!(r#"jq1({{"success":true,"data":{{"securityToken":"sig-{n}"}}}})"#);
            self.emit(VERIFY_URL, body.as_bytes());
        }
        Ok(())
    }

    async fn css_offset(&self, _selector: &str) -> Result<f64> {
        Ok(self.pointer.lock().unwrap().piece)
    }

    fn responses(&self) -> broadcast::Receiver<InterceptedResponse> {
        self.responses.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.script.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

pub struct FakeBreaker {
    pub offset: f64,
    pub delay_ms: AtomicU32,
    pub calls: AtomicU32,
}

impl FakeBreaker {
    pub fn new(offset: f64) -> Self {
        Self {
            offset,
            delay_ms: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BreakingService for FakeBreaker {
    async fn locate(&self, images: &ChallengeImages) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(images.background, b"background-bytes");
        assert_eq!(images.slider, b"slider-bytes");
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(self.offset)
    }
}
