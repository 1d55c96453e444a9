//! The purchase scheduler: one loop per target, bounded bursts of attempts.
//!
//! All mutable scheduler state lives in one `Inner` behind a single mutex.
//! The mutex is never held across an await point. Each run of the engine
//! gets a fresh epoch; attempts from an earlier run that finish late see a
//! different epoch and leave the new run's bookkeeping alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, info, warn};

use super::limits::{AccountGuard, AccountRing, InFlightBound, InFlightPermit, RateLimiters};
use super::preflight::{PreflightBackoff, PreflightCache};
use super::reservation::ReservationLedger;
use crate::captcha::TokenSource;
use crate::captcha::maintainer::DemandSignal;
use crate::config::{CaptchaPoolSettings, EngineConfig, LimitsConfig, NotifySettings, Settings};
use crate::error::{Error, Result};
use crate::event::{Bus, DisableReason, EventKind, LogLevel, TracingBus};
use crate::model::{
    Account, AccountId, Mode, OrderCreatedEvent, PreflightResult, Target, TargetId, TaskState,
    now_ms,
};
use crate::notify::{LogNotifier, Notifier};
use crate::provider::{PreflightOutcome, Provider};
use crate::store::Store;
use crate::telemetry::attempt::{record_stage, start_attempt_span};
use crate::telemetry::metrics;

/// Handle to a scheduler. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    notifier: Arc<dyn Notifier>,
    bus: Arc<dyn Bus>,
    captcha: Option<Arc<dyn TokenSource>>,
    config: EngineConfig,
    limits: Settings<LimitsConfig>,
    notify: Settings<NotifySettings>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

struct Inner {
    running: bool,
    epoch: u64,
    root: Option<CancellationToken>,
    tracker: TaskTracker,
    accounts: HashMap<AccountId, Account>,
    ring: AccountRing,
    /// Live (enabled, not yet disabled) targets.
    targets: HashMap<TargetId, Target>,
    target_tokens: HashMap<TargetId, CancellationToken>,
    states: HashMap<TargetId, TaskState>,
    reservations: ReservationLedger,
    preflight_cache: PreflightCache,
    backoff: PreflightBackoff,
    limiters: Arc<RateLimiters>,
    in_flight: InFlightBound,
}

impl Inner {
    fn new(config: &EngineConfig, limits: &LimitsConfig) -> Self {
        Self {
            running: false,
            epoch: 0,
            root: None,
            tracker: TaskTracker::new(),
            accounts: HashMap::new(),
            ring: AccountRing::default(),
            targets: HashMap::new(),
            target_tokens: HashMap::new(),
            states: HashMap::new(),
            reservations: ReservationLedger::default(),
            preflight_cache: PreflightCache::new(config.preflight_cache_ttl),
            backoff: PreflightBackoff::new(config.backoff_base, config.backoff_max),
            limiters: Arc::new(RateLimiters::new(limits)),
            in_flight: InFlightBound::new(limits.max_in_flight),
        }
    }
}

pub struct EngineBuilder {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    notifier: Arc<dyn Notifier>,
    bus: Arc<dyn Bus>,
    captcha: Option<Arc<dyn TokenSource>>,
    config: EngineConfig,
    limits: LimitsConfig,
    notify: NotifySettings,
}

impl EngineBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = bus;
        self
    }

    /// Where verification tokens come from when a preflight asks for one.
    pub fn captcha(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.captcha = Some(source);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn notify_settings(mut self, notify: NotifySettings) -> Self {
        self.notify = notify;
        self
    }

    pub fn build(self) -> Engine {
        let inner = Inner::new(&self.config, &self.limits);
        Engine {
            shared: Arc::new(Shared {
                store: self.store,
                provider: self.provider,
                notifier: self.notifier,
                bus: self.bus,
                captcha: self.captcha,
                config: self.config,
                limits: Settings::new(self.limits),
                notify: Settings::new(self.notify),
                lifecycle: tokio::sync::Mutex::new(()),
                inner: Mutex::new(inner),
            }),
        }
    }
}

/// Everything one dispatched attempt holds. Dropping the slot gives it all
/// back: the reservation (unless committed), the per-target in-flight
/// count, then the in-flight permit and the account lock.
struct AttemptSlot {
    engine: Engine,
    epoch: u64,
    target_id: TargetId,
    account_id: AccountId,
    qty: u32,
    committed: bool,
    _account: AccountGuard,
    _permit: InFlightPermit,
}

impl Drop for AttemptSlot {
    fn drop(&mut self) {
        let state = {
            let mut inner = self.engine.lock();
            if inner.epoch != self.epoch {
                None
            } else {
                if !self.committed {
                    inner.reservations.release(&self.target_id, self.qty);
                }
                inner.states.get_mut(&self.target_id).map(|s| {
                    s.in_flight = s.in_flight.saturating_sub(1);
                    s.clone()
                })
            }
        };
        if let Some(state) = state {
            self.engine.shared.bus.publish(EventKind::TaskState(state));
        }
    }
}

impl Engine {
    pub fn builder(store: Arc<dyn Store>, provider: Arc<dyn Provider>) -> EngineBuilder {
        EngineBuilder {
            store,
            provider,
            notifier: Arc::new(LogNotifier),
            bus: Arc::new(TracingBus),
            captcha: None,
            config: EngineConfig::default(),
            limits: LimitsConfig::default(),
            notify: NotifySettings::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load accounts and targets and start one loop per enabled target.
    ///
    /// Calling this on a running engine does nothing. Fails with
    /// [`Error::NoAccounts`] or [`Error::NoTargets`] and leaves the engine
    /// stopped when there is nothing to do.
    pub async fn start_all(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.lock().running {
            return Ok(());
        }

        let accounts: Vec<Account> = self
            .shared
            .store
            .list_accounts()
            .await?
            .into_iter()
            .filter(Account::is_usable)
            .collect();
        if accounts.is_empty() {
            self.unwind();
            return Err(Error::NoAccounts);
        }
        let targets: Vec<Target> = self
            .shared
            .store
            .list_enabled_targets()
            .await?
            .into_iter()
            .filter(|t| t.enabled)
            .collect();
        if targets.is_empty() {
            self.unwind();
            return Err(Error::NoTargets);
        }

        let limits = self.shared.limits.load();
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();
        let account_count = accounts.len();
        let target_count = targets.len();

        let (epoch, loops, states) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.running = true;
            inner.root = Some(root.clone());
            inner.tracker = tracker.clone();
            inner.ring = AccountRing::new(accounts.iter().map(|a| a.id.clone()).collect());
            inner.accounts = accounts.into_iter().map(|a| (a.id.clone(), a)).collect();
            inner.limiters = Arc::new(RateLimiters::new(&limits));
            inner.in_flight = InFlightBound::new(limits.max_in_flight);
            inner.reservations.clear();
            inner.preflight_cache.clear();
            inner.backoff.clear();
            inner.states.clear();
            inner.targets.clear();
            inner.target_tokens.clear();

            let mut loops = Vec::with_capacity(targets.len());
            for target in targets {
                let token = root.child_token();
                inner.states.insert(target.id.clone(), TaskState::new(&target));
                inner.target_tokens.insert(target.id.clone(), token.clone());
                loops.push((target.id.clone(), token));
                inner.targets.insert(target.id.clone(), target);
            }
            let states: Vec<TaskState> = inner.states.values().cloned().collect();
            (inner.epoch, loops, states)
        };

        for state in states {
            self.shared.bus.publish(EventKind::TaskState(state));
        }
        for (target_id, token) in loops {
            let engine = self.clone();
            tracker.spawn(async move { engine.run_target(target_id, token, epoch).await });
        }

        info!(
            epoch,
            accounts = account_count,
            targets = target_count,
            provider = self.shared.provider.name(),
            "engine started"
        );
        self.shared.bus.log(
            LogLevel::Info,
            "engine started",
            json!({ "accounts": account_count, "targets": target_count }),
        );
        Ok(())
    }

    fn unwind(&self) {
        let mut inner = self.lock();
        inner.running = false;
        if let Some(root) = inner.root.take() {
            root.cancel();
        }
        inner.targets.clear();
        inner.target_tokens.clear();
    }

    /// Cancel every loop and attempt, then wait up to `timeout` for all of
    /// them to finish. Does nothing when the engine is not running.
    pub async fn stop_all(&self, timeout: Duration) -> Result<()> {
        self.stop(None, timeout).await
    }

    async fn stop(&self, only_epoch: Option<u64>, timeout: Duration) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let (tracker, states) = {
            let mut inner = self.lock();
            if !inner.running || only_epoch.is_some_and(|e| e != inner.epoch) {
                return Ok(());
            }
            inner.running = false;
            if let Some(root) = inner.root.take() {
                root.cancel();
            }
            inner.targets.clear();
            inner.target_tokens.clear();
            for state in inner.states.values_mut() {
                state.running = false;
            }
            inner.tracker.close();
            let states: Vec<TaskState> = inner.states.values().cloned().collect();
            (inner.tracker.clone(), states)
        };

        for state in states {
            self.shared.bus.publish(EventKind::TaskState(state));
        }

        match tokio::time::timeout(timeout, tracker.wait()).await {
            Ok(()) => {
                info!("engine stopped");
                self.shared
                    .bus
                    .log(LogLevel::Info, "engine stopped", json!({}));
                Ok(())
            }
            Err(_) => {
                warn!(
                    pending = tracker.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "engine stop timed out"
                );
                Err(Error::Timeout("stop_all"))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-target loop
    // -----------------------------------------------------------------------

    async fn run_target(self, target_id: TargetId, token: CancellationToken, epoch: u64) {
        let Some(target) = self.lock().targets.get(&target_id).cloned() else {
            return;
        };

        if target.is_rush() {
            if self.rush_expired(&target, now_ms()) {
                self.disable_target(&target_id, DisableReason::Expired, epoch)
                    .await;
                return;
            }
            let lead_ms = self.shared.config.rush_lead.as_millis() as i64;
            let wait_ms = target.rush_at_ms - lead_ms - now_ms();
            if wait_ms > 0 {
                debug!(target = %target_id, wait_ms, "waiting for rush start");
                let sleep = tokio::time::sleep(Duration::from_millis(wait_ms as u64));
                if token.run_until_cancelled(sleep).await.is_none() {
                    return;
                }
            }
        }

        let period = match target.mode {
            Mode::Rush => self.shared.config.rush_interval,
            Mode::Scan => self.shared.config.scan_interval,
        };
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately.
        while token.run_until_cancelled(ticker.tick()).await.is_some() {
            if target.is_rush() && self.rush_expired(&target, now_ms()) {
                self.disable_target(&target_id, DisableReason::Expired, epoch)
                    .await;
                break;
            }
            self.launch_attempts(&target_id, &token);
        }
        debug!(target = %target_id, "target loop exited");
    }

    /// Expiry counts from the nominal start, not the lead-adjusted one.
    fn rush_expired(&self, target: &Target, now_ms: i64) -> bool {
        let minutes = self.shared.notify.load().rush_expire_disable_minutes;
        if minutes == 0 || !target.is_rush() {
            return false;
        }
        // A window too long to represent never closes.
        match i64::try_from(minutes).ok().and_then(|m| m.checked_mul(60_000)) {
            Some(window) => now_ms > target.rush_at_ms.saturating_add(window),
            None => false,
        }
    }

    /// One dispatch burst. Never blocks: when no account, in-flight slot or
    /// remaining quantity is free, the burst stops early.
    fn launch_attempts(&self, target_id: &str, token: &CancellationToken) -> usize {
        let limits = self.shared.limits.load();
        let mut taken = Vec::new();
        let mut skipped = None;

        let (epoch, qty, mode, tracker, state) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if !inner.running || token.is_cancelled() {
                return 0;
            }
            let Some(target) = inner.targets.get(target_id) else {
                return 0;
            };
            let (qty, mode) = (target.order_qty(), target.mode);
            let Some(state) = inner.states.get(target_id) else {
                return 0;
            };
            let (target_qty, purchased) = (state.target_qty, state.purchased_qty);

            let slots = limits
                .max_per_target_in_flight
                .max(1)
                .saturating_sub(state.in_flight)
                .min(inner.ring.len());

            for _ in 0..slots {
                let Some((account_id, account)) = inner.ring.pick() else {
                    skipped = Some("no_account");
                    break;
                };
                let Some(permit) = inner.in_flight.try_acquire() else {
                    skipped = Some("in_flight");
                    break;
                };
                if !inner
                    .reservations
                    .try_reserve(target_id, qty, target_qty, purchased)
                {
                    skipped = Some("capacity");
                    break;
                }
                taken.push((account_id, account, permit));
            }

            let state = inner.states.get_mut(target_id).map(|s| {
                s.in_flight += taken.len();
                s.clone()
            });
            (inner.epoch, qty, mode, inner.tracker.clone(), state)
        };

        if let Some(reason) = skipped {
            debug!(target = target_id, reason, "dispatch burst cut short");
            metrics::record_skip(reason);
        }

        let launched = taken.len();
        if launched == 0 {
            return 0;
        }
        if let Some(state) = state {
            self.shared.bus.publish(EventKind::TaskState(state));
        }
        metrics::attempts_dispatched().add(
            launched as u64,
            &[KeyValue::new("mode", mode.to_string())],
        );

        for (account_id, account, permit) in taken {
            let slot = AttemptSlot {
                engine: self.clone(),
                epoch,
                target_id: target_id.to_string(),
                account_id,
                qty,
                committed: false,
                _account: account,
                _permit: permit,
            };
            let engine = self.clone();
            let token = token.clone();
            tracker.spawn(async move { engine.run_attempt(slot, token).await });
        }
        launched
    }

    // -----------------------------------------------------------------------
    // Attempt
    // -----------------------------------------------------------------------

    async fn run_attempt(self, mut slot: AttemptSlot, token: CancellationToken) {
        let span = start_attempt_span(&slot.target_id, &slot.account_id);
        let started = Instant::now();
        let result = self
            .attempt(&mut slot, &token, &span)
            .instrument(span.clone())
            .await;
        metrics::record_duration("attempt", started);

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                debug!(target = %slot.target_id, account = %slot.account_id, "attempt cancelled");
            }
            Err(err) => {
                warn!(target = %slot.target_id, account = %slot.account_id, error = %err, "attempt failed");
                self.shared.bus.log(
                    LogLevel::Warn,
                    "attempt failed",
                    json!({
                        "target_id": slot.target_id,
                        "account_id": slot.account_id,
                        "error": err.to_string(),
                    }),
                );
                let message = err.to_string();
                self.publish_state(self.update_state(slot.epoch, &slot.target_id, |s| {
                    s.last_error = Some(message);
                }));
            }
        }
        drop(slot);
    }

    async fn attempt(
        &self,
        slot: &mut AttemptSlot,
        token: &CancellationToken,
        span: &Span,
    ) -> Result<()> {
        let (target, mut account, limiters) = {
            let inner = self.lock();
            let target = inner
                .targets
                .get(&slot.target_id)
                .cloned()
                .ok_or(Error::Cancelled)?;
            let account = inner
                .accounts
                .get(&slot.account_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("account {}", slot.account_id)))?;
            (target, account, Arc::clone(&inner.limiters))
        };

        record_stage(span, "refresh_account");
        match token
            .run_until_cancelled(self.shared.store.get_account(&slot.account_id))
            .await
            .ok_or(Error::Cancelled)?
        {
            Ok(fresh) => {
                self.lock().accounts.insert(fresh.id.clone(), fresh.clone());
                account = fresh;
            }
            Err(e) => warn!(account = %slot.account_id, error = %e, "account refresh failed, using cached copy"),
        }
        self.publish_state(self.update_state(slot.epoch, &slot.target_id, |s| {
            s.last_attempt_ms = Some(now_ms());
        }));

        let Some(preflight) = self.preflight(&target, &mut account, token, span).await? else {
            return Ok(());
        };
        self.publish_state(self.update_state(slot.epoch, &slot.target_id, |s| {
            s.need_captcha = Some(preflight.need_captcha);
        }));
        if !preflight.can_buy {
            debug!(target = %target.id, "not buyable yet");
            return Ok(());
        }

        record_stage(span, "rate_limit");
        limiters.wait(&account.id, token).await?;

        let captcha_token = if preflight.need_captcha {
            record_stage(span, "captcha");
            Some(self.verification_token(&target, token).await?)
        } else {
            None
        };

        record_stage(span, "create_order");
        let started = Instant::now();
        let outcome = token
            .run_until_cancelled(self.shared.provider.create_order(
                &account,
                &target,
                &preflight,
                captcha_token.as_deref(),
            ))
            .await
            .ok_or(Error::Cancelled)?;
        metrics::record_duration("create_order", started);
        self.lock()
            .preflight_cache
            .invalidate(&account.id, &target.id);
        let outcome = outcome?;
        self.persist_account(&outcome.account).await;
        if !outcome.result.success {
            return Err(Error::Provider(format!(
                "order rejected (trace {})",
                outcome.result.trace_id
            )));
        }

        let Some(state) = self.commit(slot) else {
            return Ok(());
        };
        let order = outcome.result;
        info!(
            target = %target.id,
            account = %account.id,
            order_id = %order.order_id,
            purchased = state.purchased_qty,
            wanted = state.target_qty,
            "order created"
        );
        metrics::orders_created().add(1, &[KeyValue::new("mode", target.mode.to_string())]);
        self.shared.bus.publish(EventKind::Progress {
            target_id: target.id.clone(),
            purchased_qty: state.purchased_qty,
            target_qty: state.target_qty,
            order_id: order.order_id.clone(),
        });
        self.shared.bus.log(
            LogLevel::Info,
            "order created",
            json!({
                "target_id": target.id,
                "account_id": account.id,
                "order_id": order.order_id,
            }),
        );
        let complete = state.is_complete();
        self.shared.bus.publish(EventKind::TaskState(state));

        let event = OrderCreatedEvent {
            at: chrono::Utc::now(),
            account_id: account.id.clone(),
            mobile: account.mobile.clone(),
            target_id: target.id.clone(),
            target_name: target.name.clone(),
            mode: target.mode,
            item_id: target.item_id.clone(),
            sku_id: target.sku_id.clone(),
            shop_id: target.shop_id.clone(),
            quantity: slot.qty,
            order_id: order.order_id,
            trace_id: order.trace_id,
        };
        if let Err(e) = self.shared.notifier.notify_order_created(&event).await {
            warn!(target = %target.id, error = %e, "order notification failed");
        }

        if complete {
            self.disable_target(&target.id, DisableReason::Completed, slot.epoch)
                .await;
        }
        Ok(())
    }

    /// Cached result, backoff skip (`None`), or a fresh preflight call.
    async fn preflight(
        &self,
        target: &Target,
        account: &mut Account,
        token: &CancellationToken,
        span: &Span,
    ) -> Result<Option<PreflightResult>> {
        let now = now_ms();
        {
            let mut inner = self.lock();
            if let Some(hit) = inner.preflight_cache.get(&account.id, &target.id, now) {
                debug!(target = %target.id, account = %account.id, "preflight cache hit");
                return Ok(Some(hit));
            }
            if !inner.backoff.can_preflight_now(&target.id, now) {
                metrics::record_skip("backoff");
                return Ok(None);
            }
        }

        record_stage(span, "preflight");
        let started = Instant::now();
        let outcome = token
            .run_until_cancelled(self.shared.provider.preflight(account, target))
            .await
            .ok_or(Error::Cancelled)?;
        metrics::record_duration("preflight", started);

        match outcome {
            Ok(PreflightOutcome { result, account: updated }) => {
                {
                    let mut inner = self.lock();
                    inner.backoff.record_success(&target.id);
                    inner
                        .preflight_cache
                        .record(&account.id, &target.id, &result, now_ms());
                }
                *account = updated;
                self.persist_account(account).await;
                Ok(Some(result))
            }
            Err(e) => {
                let rush_at = if target.is_rush() { target.rush_at_ms } else { 0 };
                let retry_at = self
                    .lock()
                    .backoff
                    .record_failure(&target.id, now_ms(), rush_at);
                metrics::preflight_failures().add(1, &[]);
                debug!(target = %target.id, retry_at, "preflight failed, backing off");
                Err(e)
            }
        }
    }

    async fn verification_token(&self, target: &Target, token: &CancellationToken) -> Result<String> {
        if let Some(fixed) = target.override_token() {
            return Ok(fixed.to_string());
        }
        let source = self.shared.captcha.as_ref().ok_or_else(|| {
            Error::Captcha("verification required but no token source configured".into())
        })?;
        source.acquire_token(token).await
    }

    /// Persistence failures are logged; the in-memory copy stays authoritative.
    async fn persist_account(&self, account: &Account) {
        self.lock()
            .accounts
            .insert(account.id.clone(), account.clone());
        if let Err(e) = self.shared.store.upsert_account(account).await {
            warn!(account = %account.id, error = %e, "account persist failed");
        }
    }

    fn commit(&self, slot: &mut AttemptSlot) -> Option<TaskState> {
        slot.committed = true;
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.epoch != slot.epoch {
            return None;
        }
        let state = inner.states.get_mut(&slot.target_id)?;
        inner
            .reservations
            .commit(&slot.target_id, slot.qty, &mut state.purchased_qty);
        let now = now_ms();
        state.last_success_ms = Some(now);
        state.last_error = None;
        Some(state.clone())
    }

    fn update_state<F>(&self, epoch: u64, target_id: &str, f: F) -> Option<TaskState>
    where
        F: FnOnce(&mut TaskState),
    {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }
        let state = inner.states.get_mut(target_id)?;
        f(state);
        Some(state.clone())
    }

    fn publish_state(&self, state: Option<TaskState>) {
        if let Some(state) = state {
            self.shared.bus.publish(EventKind::TaskState(state));
        }
    }

    // -----------------------------------------------------------------------
    // Auto-disable
    // -----------------------------------------------------------------------

    async fn disable_target(&self, target_id: &str, reason: DisableReason, epoch: u64) {
        let (token, state, last) = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.targets.remove(target_id).is_none() {
                return;
            }
            let token = inner.target_tokens.remove(target_id);
            let state = inner.states.get_mut(target_id).map(|s| {
                s.running = false;
                s.clone()
            });
            (token, state, inner.targets.is_empty())
        };

        if let Err(e) = self.shared.store.set_target_enabled(target_id, false).await {
            warn!(target = target_id, error = %e, "failed to persist target disable");
        }
        if let Some(token) = token {
            token.cancel();
        }

        info!(target = target_id, %reason, "target disabled");
        self.shared.bus.log(
            LogLevel::Info,
            "target disabled",
            json!({ "target_id": target_id, "reason": reason }),
        );
        self.shared.bus.publish(EventKind::TargetDisabled {
            target_id: target_id.to_string(),
            reason,
        });
        self.publish_state(state);

        if last {
            let engine = self.clone();
            let timeout = self.shared.config.stop_timeout;
            tokio::spawn(async move {
                if let Err(e) = engine.stop(Some(epoch), timeout).await {
                    warn!(error = %e, "automatic stop after last target failed");
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Runtime settings
    // -----------------------------------------------------------------------

    /// Swap throughput limits. Attempts already running keep the in-flight
    /// slot they hold in the previous bound.
    pub fn update_limits(&self, limits: LimitsConfig) {
        {
            let mut inner = self.lock();
            inner.limiters = Arc::new(RateLimiters::new(&limits));
            if inner.in_flight.capacity() != limits.max_in_flight.max(1) {
                inner.in_flight = InFlightBound::new(limits.max_in_flight);
            }
        }
        info!(?limits, "limits updated");
        self.shared.limits.store(limits);
    }

    pub fn update_notify_settings(&self, notify: NotifySettings) {
        self.shared.notify.store(notify);
    }

    pub fn limits(&self) -> Arc<LimitsConfig> {
        self.shared.limits.load()
    }

    /// Whether a live target may soon want a verification token: any scan
    /// target, or a rush target inside its warmup window. Targets known not
    /// to need verification, or carrying a fixed token, never count.
    pub fn captcha_demand(&self, now_ms: i64, warmup: Duration) -> bool {
        let inner = self.lock();
        if !inner.running {
            return false;
        }
        let warmup_ms = warmup.as_millis() as i64;
        inner.targets.values().any(|t| {
            let known_free = inner
                .states
                .get(&t.id)
                .is_some_and(|s| s.need_captcha == Some(false));
            if known_free || t.override_token().is_some() {
                return false;
            }
            !t.is_rush() || now_ms >= t.rush_at_ms - warmup_ms
        })
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn task_states(&self) -> Vec<TaskState> {
        let mut states: Vec<TaskState> = self.lock().states.values().cloned().collect();
        states.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        states
    }

    pub fn task_state(&self, target_id: &str) -> Option<TaskState> {
        self.lock().states.get(target_id).cloned()
    }

    pub fn reserved(&self, target_id: &str) -> u32 {
        self.lock().reservations.reserved(target_id)
    }

    /// Attempts currently holding a global in-flight slot.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.in_use()
    }

    pub fn active_targets(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.lock().targets.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the account's lock is currently held by an attempt.
    pub fn account_busy(&self, account_id: &str) -> bool {
        self.lock()
            .ring
            .lock_for(account_id)
            .is_some_and(|l| l.is_held())
    }
}

impl DemandSignal for Engine {
    fn wants_tokens(&self, now_ms: i64, settings: &CaptchaPoolSettings) -> bool {
        self.captcha_demand(now_ms, Duration::from_secs(settings.warmup_seconds))
    }
}
