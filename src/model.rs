//! Core data model.
//!
//! Accounts buy, targets describe what to buy and when, and a task state
//! tracks the live progress of one target inside a running engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::secrets::redact;

pub type AccountId = String;
pub type TargetId = String;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// A buyer identity on the upstream shop. `Debug` masks the auth token
/// and cookie values.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub mobile: String,
    /// Upstream auth token. Accounts without one are not usable.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Cookie jar as name → value. Providers hand back updated jars.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl Account {
    pub fn is_usable(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookies: BTreeMap<&str, String> = self
            .cookies
            .iter()
            .map(|(name, value)| (name.as_str(), redact(value)))
            .collect();
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("mobile", &redact(&self.mobile))
            .field("token", &redact(&self.token))
            .field("proxy", &self.proxy)
            .field("user_agent", &self.user_agent)
            .field("cookies", &cookies)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// First attempt at a fixed instant, then fast polling.
    Rush,
    /// Steady, slower polling with no start time.
    #[default]
    Scan,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Rush => "rush",
            Mode::Scan => "scan",
        };
        write!(f, "{s}")
    }
}

/// Something to buy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    /// Nominal rush start (epoch ms). Zero means "no start time".
    #[serde(default)]
    pub rush_at_ms: i64,
    /// Total units wanted. Zero means unbounded.
    #[serde(default)]
    pub target_qty: u32,
    #[serde(default = "default_per_order_qty")]
    pub per_order_qty: u32,
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub sku_id: String,
    #[serde(default)]
    pub shop_id: String,
    /// Verification token to use instead of the pool/solver.
    #[serde(default)]
    pub captcha_override: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_per_order_qty() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Target {
    pub fn is_rush(&self) -> bool {
        self.mode == Mode::Rush && self.rush_at_ms > 0
    }

    /// Units per order, never zero.
    pub fn order_qty(&self) -> u32 {
        self.per_order_qty.max(1)
    }

    pub fn override_token(&self) -> Option<&str> {
        self.captcha_override
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Live progress of one target. Published on every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub target_id: TargetId,
    pub running: bool,
    pub purchased_qty: u32,
    pub target_qty: u32,
    /// Unknown until the first preflight answers.
    pub need_captcha: Option<bool>,
    pub last_error: Option<String>,
    pub last_attempt_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
    /// Attempts currently executing for this target.
    pub in_flight: usize,
}

impl TaskState {
    pub fn new(target: &Target) -> Self {
        Self {
            target_id: target.id.clone(),
            running: true,
            target_qty: target.target_qty,
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.target_qty > 0 && self.purchased_qty >= self.target_qty
    }
}

// ---------------------------------------------------------------------------
// Provider results
// ---------------------------------------------------------------------------

/// What a preflight call reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub can_buy: bool,
    pub need_captcha: bool,
    /// Order total in the shop's minor currency unit.
    pub total_fee: i64,
    pub trace_id: String,
    /// Opaque order-confirmation payload handed back to `create_order`.
    pub render_payload: serde_json::Value,
}

impl PreflightResult {
    /// A payload-less result cannot be replayed into an order call.
    pub fn has_payload(&self) -> bool {
        match &self.render_payload {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Object(m) => !m.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: String,
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Emitted once per successfully created order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub at: DateTime<Utc>,
    pub account_id: AccountId,
    pub mobile: String,
    pub target_id: TargetId,
    pub target_name: String,
    pub mode: Mode,
    pub item_id: String,
    pub sku_id: String,
    pub shop_id: String,
    pub quantity: u32,
    pub order_id: String,
    pub trace_id: String,
}
