//! Integration tests for the purchase scheduler.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use rushbuy::config::{EngineConfig, LimitsConfig, NotifySettings};
use rushbuy::engine::Engine;
use rushbuy::error::Error;
use rushbuy::event::{DisableReason, EventKind};
use rushbuy::model::{Account, now_ms};
use rushbuy::store::{MemoryStore, Store};

fn fast_config() -> EngineConfig {
    EngineConfig {
        rush_interval: Duration::from_millis(20),
        scan_interval: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

fn open_limits() -> LimitsConfig {
    LimitsConfig {
        global_qps: 0.0,
        per_account_qps: 0.0,
        ..LimitsConfig::default()
    }
}

fn engine(store: Arc<MemoryStore>, provider: Arc<FakeProvider>, bus: Arc<RecordingBus>) -> Engine {
    Engine::builder(store, provider)
        .bus(bus)
        .config(fast_config())
        .limits(open_limits())
        .build()
}

// ---------------------------------------------------------------------------
// Start validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_fails_without_accounts() {
    let store = store(vec![], vec![scan_target("t1", 1)]);
    let engine = engine(store, Arc::new(FakeProvider::new()), Arc::default());
    let err = engine.start_all().await.unwrap_err();
    assert!(matches!(err, Error::NoAccounts));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn accounts_without_token_are_not_usable() {
    let tokenless = Account {
        id: "a0".into(),
        ..Account::default()
    };
    let store = store(vec![tokenless], vec![scan_target("t1", 1)]);
    let engine = engine(store, Arc::new(FakeProvider::new()), Arc::default());
    assert!(matches!(engine.start_all().await, Err(Error::NoAccounts)));
}

#[tokio::test]
async fn start_fails_without_enabled_targets() {
    let mut disabled = scan_target("t1", 1);
    disabled.enabled = false;
    let store = store(accounts(1), vec![disabled]);
    let engine = engine(store, Arc::new(FakeProvider::new()), Arc::default());
    assert!(matches!(engine.start_all().await, Err(Error::NoTargets)));
    assert!(!engine.is_running());
    assert!(engine.active_targets().is_empty());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_is_a_noop_when_idle() {
    let store = store(accounts(1), vec![scan_target("t1", 0)]);
    let provider = Arc::new(FakeProvider::new().stalling());
    let engine = engine(store, provider, Arc::default());

    engine.stop_all(Duration::from_millis(100)).await.unwrap();
    engine.start_all().await.unwrap();
    engine.start_all().await.unwrap();
    assert!(engine.is_running());
    assert_eq!(engine.active_targets(), vec!["t1".to_string()]);

    engine.stop_all(Duration::from_secs(2)).await.unwrap();
    assert!(!engine.is_running());
    let state = engine.task_state("t1").unwrap();
    assert!(!state.running);
}

// ---------------------------------------------------------------------------
// Purchasing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buys_exactly_the_target_quantity_then_disables_and_stops() {
    let store = store(accounts(3), vec![scan_target("t1", 3)]);
    let provider = Arc::new(
        FakeProvider::new().with_delays(Duration::from_millis(5), Duration::from_millis(15)),
    );
    let bus = Arc::new(RecordingBus::default());
    let engine = engine(store.clone(), provider.clone(), bus.clone());

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || !engine.is_running()).await);

    // Let any attempt still unwinding finish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.orders(), 3);
    let state = engine.task_state("t1").unwrap();
    assert_eq!(state.purchased_qty, 3);
    assert!(state.last_success_ms.is_some());
    assert_eq!(engine.reserved("t1"), 0);
    assert!(!store.get_target("t1").await.unwrap().enabled);

    let events = bus.events();
    assert!(events.iter().any(|e| matches!(
        e,
        EventKind::TargetDisabled { reason: DisableReason::Completed, .. }
    )));
    let progress = events
        .iter()
        .filter(|e| matches!(e, EventKind::Progress { .. }))
        .count();
    assert_eq!(progress, 3);
    // No published state ever shows more bought than wanted.
    for event in &events {
        if let EventKind::TaskState(s) = event {
            assert!(s.purchased_qty <= 3);
        }
    }
}

#[tokio::test]
async fn concurrency_stays_within_bounds() {
    let store = store(
        accounts(6),
        vec![scan_target("t1", 0), scan_target("t2", 0)],
    );
    let provider = Arc::new(
        FakeProvider::new().with_delays(Duration::from_millis(20), Duration::from_millis(20)),
    );
    let engine = Engine::builder(store, provider.clone())
        .config(fast_config())
        .limits(LimitsConfig {
            max_in_flight: 3,
            max_per_target_in_flight: 2,
            ..open_limits()
        })
        .build();

    engine.start_all().await.unwrap();
    let mut max_seen = 0;
    for _ in 0..40 {
        max_seen = max_seen.max(engine.in_flight());
        for id in ["t1", "t2"] {
            let state = engine.task_state(id).unwrap();
            assert!(state.in_flight <= 2, "per-target bound exceeded: {}", state.in_flight);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.stop_all(Duration::from_secs(2)).await.unwrap();

    assert!(max_seen <= 3);
    assert!(provider.max_active_total.load(Ordering::SeqCst) <= 3);
    assert!(!provider.account_overlap.load(Ordering::SeqCst));
    assert!(provider.orders() > 0);
}

#[tokio::test]
async fn stop_all_releases_every_in_flight_attempt() {
    let store = store(accounts(5), vec![scan_target("t1", 0)]);
    let provider = Arc::new(FakeProvider::new().stalling());
    let engine = Engine::builder(store, provider.clone())
        .config(fast_config())
        .limits(LimitsConfig {
            max_per_target_in_flight: 5,
            ..open_limits()
        })
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.in_flight() == 5).await);
    assert_eq!(engine.reserved("t1"), 5);

    engine.stop_all(Duration::from_secs(2)).await.unwrap();
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.reserved("t1"), 0);
    assert_eq!(engine.task_state("t1").unwrap().in_flight, 0);
    for i in 0..5 {
        assert!(!engine.account_busy(&format!("a{i}")));
    }
    // Cancelled attempts are not errors.
    assert_eq!(engine.task_state("t1").unwrap().last_error, None);
}

#[tokio::test]
async fn panicking_order_call_releases_locks_and_dispatch_continues() {
    let store = store(accounts(1), vec![scan_target("t1", 0)]);
    let provider = Arc::new(FakeProvider::new());
    provider.panic_orders.store(true, Ordering::SeqCst);
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    // One account: a leaked lock would stop the second attempt.
    assert!(wait_until(Duration::from_secs(2), || provider.panics.load(Ordering::SeqCst) >= 3).await);
    assert!(wait_until(Duration::from_secs(2), || {
        engine.in_flight() == 0 && engine.reserved("t1") == 0 && !engine.account_busy("a0")
    })
    .await);
    assert!(engine.is_running());

    provider.panic_orders.store(false, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || provider.orders() >= 1).await);

    engine.stop_all(Duration::from_secs(2)).await.unwrap();
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.reserved("t1"), 0);
    assert!(!engine.account_busy("a0"));
}

#[tokio::test]
async fn provider_accounts_are_persisted() {
    let store = store(accounts(1), vec![scan_target("t1", 1)]);
    let provider = Arc::new(FakeProvider::new());
    let engine = engine(store.clone(), provider, Arc::default());

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || !engine.is_running()).await);
    let account = store.get_account("a0").await.unwrap();
    assert!(account.cookies.contains_key("session"));
}

#[tokio::test]
async fn rejected_orders_record_last_error() {
    let store = store(accounts(1), vec![scan_target("t1", 1)]);
    let provider = Arc::new(FakeProvider::new());
    provider.reject_orders.store(true, Ordering::SeqCst);
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            engine
                .task_state("t1")
                .is_some_and(|s| s.last_error.is_some())
        })
        .await
    );
    engine.stop_all(Duration::from_secs(2)).await.unwrap();
    assert_eq!(engine.task_state("t1").unwrap().purchased_qty, 0);
    assert_eq!(engine.reserved("t1"), 0);
}

#[tokio::test]
async fn cannot_buy_is_not_an_error() {
    let store = store(accounts(1), vec![scan_target("t1", 1)]);
    let provider = Arc::new(FakeProvider::new());
    provider.cannot_buy.store(true, Ordering::SeqCst);
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || provider.preflights() >= 2).await);
    engine.stop_all(Duration::from_secs(2)).await.unwrap();

    let state = engine.task_state("t1").unwrap();
    assert_eq!(state.last_error, None);
    assert!(state.last_attempt_ms.is_some());
    assert_eq!(provider.orders(), 0);
}

// ---------------------------------------------------------------------------
// Preflight backoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_preflight_backs_off() {
    let store = store(accounts(1), vec![scan_target("t1", 1)]);
    let provider = Arc::new(FakeProvider::new());
    provider.fail_preflights.store(true, Ordering::SeqCst);
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    // One failure pushes the next preflight 1.5s out; ticks in between skip.
    assert_eq!(provider.preflights(), 1);
    let state = engine.task_state("t1").unwrap();
    assert!(state.last_error.unwrap().contains("preflight 503"));

    engine.stop_all(Duration::from_secs(2)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Verification tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn override_token_skips_the_token_source() {
    let mut target = scan_target("t1", 1);
    target.captcha_override = Some("operator-token".into());
    let store = store(accounts(1), vec![target]);
    let provider = Arc::new(FakeProvider::new().with_captcha());
    let tokens = Arc::new(CountingTokens::default());
    let engine = Engine::builder(store, provider.clone())
        .captcha(tokens.clone())
        .config(fast_config())
        .limits(open_limits())
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || !engine.is_running()).await);
    let seen = provider.captcha_tokens.lock().unwrap().clone();
    assert_eq!(seen, vec![Some("operator-token".to_string())]);
    assert_eq!(tokens.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn token_source_supplies_verification() {
    let store = store(accounts(1), vec![scan_target("t1", 2)]);
    let provider = Arc::new(FakeProvider::new().with_captcha());
    let tokens = Arc::new(CountingTokens::default());
    let engine = Engine::builder(store, provider.clone())
        .captcha(tokens.clone())
        .config(fast_config())
        .limits(open_limits())
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || !engine.is_running()).await);
    let seen = provider.captcha_tokens.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![Some("fixed-1".to_string()), Some("fixed-2".to_string())]
    );
    assert_eq!(engine.task_state("t1").unwrap().need_captcha, Some(true));
}

#[tokio::test]
async fn verification_without_a_source_fails_the_attempt() {
    let store = store(accounts(1), vec![scan_target("t1", 1)]);
    let provider = Arc::new(FakeProvider::new().with_captcha());
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            engine
                .task_state("t1")
                .and_then(|s| s.last_error)
                .is_some_and(|e| e.contains("captcha"))
        })
        .await
    );
    engine.stop_all(Duration::from_secs(2)).await.unwrap();
    assert_eq!(provider.orders(), 0);
}

// ---------------------------------------------------------------------------
// Rush timing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rush_target_waits_for_its_start() {
    let rush_at = now_ms() + 400;
    let store = store(accounts(1), vec![rush_target("t1", 1, rush_at)]);
    let provider = Arc::new(FakeProvider::new());
    let engine = engine(store, provider.clone(), Arc::default());

    engine.start_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(provider.preflights(), 0);

    assert!(wait_until(Duration::from_secs(3), || provider.orders() == 1).await);
    assert!(now_ms() >= rush_at);
    engine.stop_all(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn expired_rush_target_is_disabled_without_attempts() {
    let rush_at = now_ms() - 2 * 60_000;
    let store = store(accounts(1), vec![rush_target("t1", 1, rush_at)]);
    let provider = Arc::new(FakeProvider::new());
    let bus = Arc::new(RecordingBus::default());
    let engine = Engine::builder(store.clone(), provider.clone())
        .bus(bus.clone())
        .config(fast_config())
        .limits(open_limits())
        .notify_settings(NotifySettings {
            rush_expire_disable_minutes: 1,
        })
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || !engine.is_running()).await);
    assert_eq!(provider.preflights(), 0);
    assert!(!store.get_target("t1").await.unwrap().enabled);
    assert!(bus.events().iter().any(|e| matches!(
        e,
        EventKind::TargetDisabled { reason: DisableReason::Expired, .. }
    )));
}

#[tokio::test]
async fn disabling_one_target_leaves_the_others_running() {
    let store = store(
        accounts(2),
        vec![scan_target("done", 1), scan_target("open", 0)],
    );
    let provider = Arc::new(FakeProvider::new());
    let engine = engine(store, provider, Arc::default());

    engine.start_all().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            engine.active_targets() == vec!["open".to_string()]
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.is_running());
    assert_eq!(engine.task_state("done").unwrap().purchased_qty, 1);
    engine.stop_all(Duration::from_secs(2)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Captcha demand and live settings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn captcha_demand_follows_warmup_window() {
    let far = now_ms() + 3_600_000;
    let store = store(accounts(1), vec![rush_target("t1", 1, far)]);
    let provider = Arc::new(FakeProvider::new());
    let engine = engine(store, provider, Arc::default());

    assert!(!engine.captcha_demand(now_ms(), Duration::from_secs(30)));
    engine.start_all().await.unwrap();
    assert!(!engine.captcha_demand(now_ms(), Duration::from_secs(30)));
    assert!(engine.captcha_demand(now_ms(), Duration::from_secs(7200)));
    assert!(engine.captcha_demand(far - 10_000, Duration::from_secs(30)));
    engine.stop_all(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn limits_can_be_swapped_at_runtime() {
    let store = store(accounts(1), vec![scan_target("t1", 0)]);
    let engine = engine(store, Arc::new(FakeProvider::new()), Arc::default());
    let limits = LimitsConfig {
        max_in_flight: 1,
        max_per_target_in_flight: 1,
        ..LimitsConfig::default()
    };
    engine.update_limits(limits.clone());
    assert_eq!(*engine.limits(), limits);
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingNotifier {
    orders: std::sync::Mutex<Vec<rushbuy::model::OrderCreatedEvent>>,
}

#[async_trait::async_trait]
impl rushbuy::notify::Notifier for RecordingNotifier {
    async fn notify_order_created(
        &self,
        event: &rushbuy::model::OrderCreatedEvent,
    ) -> rushbuy::error::Result<()> {
        self.orders.lock().unwrap().push(event.clone());
        Err(Error::Other("mail server down".into()))
    }
}

#[tokio::test]
async fn dry_run_orders_reach_the_notifier() {
    let mut target = scan_target("t1", 4);
    target.per_order_qty = 2;
    let store = store(accounts(2), vec![target]);
    let provider = Arc::new(rushbuy::provider::DryRunProvider::new(false));
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::builder(store, provider.clone())
        .notifier(notifier.clone())
        .config(fast_config())
        .limits(open_limits())
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || !engine.is_running()).await);

    // Notifier failures do not undo purchases.
    assert_eq!(provider.orders_created(), 2);
    assert_eq!(engine.task_state("t1").unwrap().purchased_qty, 4);
    let orders = notifier.orders.lock().unwrap().clone();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.quantity == 2 && o.target_id == "t1"));
    assert!(orders.iter().all(|o| o.order_id.starts_with("DRY")));
}

#[tokio::test]
async fn dry_run_with_captcha_uses_dry_run_tokens() {
    let store = store(accounts(1), vec![scan_target("t1", 2)]);
    let provider = Arc::new(rushbuy::provider::DryRunProvider::new(true));
    let tokens = Arc::new(rushbuy::provider::DryRunTokens::default());
    let engine = Engine::builder(store, provider.clone())
        .captcha(tokens.clone())
        .config(fast_config())
        .limits(open_limits())
        .build();

    engine.start_all().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || !engine.is_running()).await);

    assert_eq!(provider.orders_created(), 2);
    assert!(tokens.issued() >= 2);
    assert_eq!(engine.task_state("t1").unwrap().purchased_qty, 2);
}
