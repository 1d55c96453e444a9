//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. The breaking
//! service credential is wrapped in secrecy::SecretString to prevent log
//! leaks. Limits, pool settings and notify settings are hot-swappable at
//! runtime through [`Settings`].

pub mod secrets;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Global and per-account throughput limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per second across all accounts. `<= 0` disables the bucket.
    pub global_qps: f64,
    pub global_burst: u32,
    /// Requests per second for each account. `<= 0` disables the bucket.
    pub per_account_qps: f64,
    pub per_account_burst: u32,
    /// Cap on concurrently executing attempts, all targets combined.
    pub max_in_flight: usize,
    /// Cap on concurrently executing attempts for a single target.
    pub max_per_target_in_flight: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_qps: 20.0,
            global_burst: 20,
            per_account_qps: 2.0,
            per_account_burst: 2,
            max_in_flight: 16,
            max_per_target_in_flight: 4,
        }
    }
}

/// Verification-token pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaPoolSettings {
    /// How long before a rush start the pool begins filling.
    pub warmup_seconds: u64,
    /// Desired number of ready tokens while demand exists.
    pub pool_size: usize,
    /// Lifetime of a solved token.
    pub item_ttl_seconds: u64,
}

impl Default for CaptchaPoolSettings {
    fn default() -> Self {
        Self {
            warmup_seconds: 30,
            pool_size: 0,
            item_ttl_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Disable a rush target this many minutes after its nominal start.
    /// Zero turns expiry off.
    pub rush_expire_disable_minutes: u64,
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rush_interval: Duration,
    pub scan_interval: Duration,
    /// Start the first rush attempt this long before the nominal start.
    pub rush_lead: Duration,
    /// Bound for the asynchronous stop triggered when the last target completes.
    pub stop_timeout: Duration,
    pub preflight_cache_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rush_interval: Duration::from_millis(300),
            scan_interval: Duration::from_millis(3000),
            rush_lead: Duration::ZERO,
            stop_timeout: Duration::from_secs(10),
            preflight_cache_ttl: Duration::from_secs(3),
            backoff_base: Duration::from_millis(1500),
            backoff_max: Duration::from_secs(12),
        }
    }
}

/// Slider challenge solving.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub challenge_url: String,
    pub selectors: ChallengeSelectors,
    /// URL substrings identifying intercepted responses.
    pub background_pattern: String,
    pub slider_pattern: String,
    pub verify_pattern: String,
    pub page_pool_size: usize,
    pub max_solve_attempts: u32,
    pub solve_timeout: Duration,
    pub slider_timeout: Duration,
    pub breaker_timeout: Duration,
    pub verify_timeout: Duration,
    /// An already-open page younger than this is reused without navigating.
    pub page_fresh_window: Duration,
    /// Closed-loop correction stops once the piece is this close (px).
    pub drag_tolerance_px: f64,
    pub drag_max_corrections: u32,
    /// Pause between pointer moves while dragging.
    pub drag_step_delay: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            challenge_url: String::new(),
            selectors: ChallengeSelectors::default(),
            background_pattern: "/captcha/bg".to_string(),
            slider_pattern: "/captcha/slide".to_string(),
            verify_pattern: "/captcha/verify".to_string(),
            page_pool_size: 1,
            max_solve_attempts: 3,
            solve_timeout: Duration::from_secs(360),
            slider_timeout: Duration::from_secs(15),
            breaker_timeout: Duration::from_secs(25),
            verify_timeout: Duration::from_secs(6),
            page_fresh_window: Duration::from_secs(120),
            drag_tolerance_px: 2.0,
            drag_max_corrections: 12,
            drag_step_delay: Duration::from_millis(8),
        }
    }
}

/// CSS selectors on the challenge page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSelectors {
    pub trigger: String,
    pub slider: String,
    pub piece: String,
}

impl Default for ChallengeSelectors {
    fn default() -> Self {
        Self {
            trigger: "#verify-button".to_string(),
            slider: ".slider-handle".to_string(),
            piece: ".puzzle-piece".to_string(),
        }
    }
}

/// External image→offset breaking service.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub url: String,
    pub credential: SecretString,
    pub kind: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub limits: LimitsConfig,
    pub captcha_pool: CaptchaPoolSettings,
    pub notify: NotifySettings,
    pub engine: EngineConfig,
    pub solver: SolverConfig,
    pub breaker: Option<BreakerConfig>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let limits_default = LimitsConfig::default();
        let limits = LimitsConfig {
            global_qps: parsed_var("RUSHBUY_GLOBAL_QPS", limits_default.global_qps)?,
            global_burst: parsed_var("RUSHBUY_GLOBAL_BURST", limits_default.global_burst)?,
            per_account_qps: parsed_var("RUSHBUY_ACCOUNT_QPS", limits_default.per_account_qps)?,
            per_account_burst: parsed_var(
                "RUSHBUY_ACCOUNT_BURST",
                limits_default.per_account_burst,
            )?,
            max_in_flight: parsed_var("RUSHBUY_MAX_IN_FLIGHT", limits_default.max_in_flight)?,
            max_per_target_in_flight: parsed_var(
                "RUSHBUY_MAX_PER_TARGET_IN_FLIGHT",
                limits_default.max_per_target_in_flight,
            )?,
        };

        let pool_default = CaptchaPoolSettings::default();
        let captcha_pool = CaptchaPoolSettings {
            warmup_seconds: parsed_var(
                "RUSHBUY_CAPTCHA_WARMUP_SECONDS",
                pool_default.warmup_seconds,
            )?,
            pool_size: parsed_var("RUSHBUY_CAPTCHA_POOL_SIZE", pool_default.pool_size)?,
            item_ttl_seconds: parsed_var(
                "RUSHBUY_CAPTCHA_ITEM_TTL_SECONDS",
                pool_default.item_ttl_seconds,
            )?,
        };

        let notify = NotifySettings {
            rush_expire_disable_minutes: parsed_var("RUSHBUY_RUSH_EXPIRE_DISABLE_MINUTES", 0)?,
        };

        let engine_default = EngineConfig::default();
        let engine = EngineConfig {
            rush_interval: millis_var("RUSHBUY_RUSH_INTERVAL_MS", engine_default.rush_interval)?,
            scan_interval: millis_var("RUSHBUY_SCAN_INTERVAL_MS", engine_default.scan_interval)?,
            rush_lead: millis_var("RUSHBUY_RUSH_LEAD_MS", engine_default.rush_lead)?,
            stop_timeout: millis_var("RUSHBUY_STOP_TIMEOUT_MS", engine_default.stop_timeout)?,
            ..engine_default
        };

        let solver_default = SolverConfig::default();
        let solver = SolverConfig {
            challenge_url: std::env::var("RUSHBUY_CHALLENGE_URL").unwrap_or_default(),
            page_pool_size: parsed_var("RUSHBUY_PAGE_POOL_SIZE", solver_default.page_pool_size)?,
            max_solve_attempts: parsed_var(
                "RUSHBUY_MAX_SOLVE_ATTEMPTS",
                solver_default.max_solve_attempts,
            )?,
            ..solver_default
        };

        let breaker = match std::env::var("RUSHBUY_BREAKER_URL") {
            Ok(url) if !url.is_empty() => Some(BreakerConfig {
                url,
                credential: SecretString::from(required_var("RUSHBUY_BREAKER_TOKEN")?),
                kind: std::env::var("RUSHBUY_BREAKER_TYPE").unwrap_or_else(|_| "slide".into()),
                timeout: solver.breaker_timeout,
            }),
            _ => None,
        };

        Ok(Self {
            limits,
            captcha_pool,
            notify,
            engine,
            solver,
            breaker,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw}: {e}"))),
        _ => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    let ms: u64 = parsed_var(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

/// A hot-swappable settings value. Readers always see a complete snapshot.
#[derive(Debug)]
pub struct Settings<T> {
    inner: ArcSwap<T>,
}

impl<T> Settings<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}

impl<T: Default> Default for Settings<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
