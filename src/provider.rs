//! Upstream shop API boundary.
//!
//! A provider performs the two network calls an attempt needs. Both calls
//! hand back a possibly-updated account (fresh cookies, rotated tokens)
//! which the engine persists.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::captcha::TokenSource;
use crate::error::{Error, Result};
use crate::model::{Account, OrderResult, PreflightResult, Target};

#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub result: PreflightResult,
    pub account: Account,
}

#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub result: OrderResult,
    pub account: Account,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Read-only check: can this account buy this target right now?
    async fn preflight(&self, account: &Account, target: &Target) -> Result<PreflightOutcome>;

    /// Place the order. `captcha_token` is present when preflight asked for one.
    async fn create_order(
        &self,
        account: &Account,
        target: &Target,
        preflight: &PreflightResult,
        captcha_token: Option<&str>,
    ) -> Result<OrderOutcome>;
}

/// Provider that never leaves the process. Every preflight says "can buy"
/// and every order succeeds with a synthetic id.
#[derive(Debug, Default)]
pub struct DryRunProvider {
    need_captcha: bool,
    orders: AtomicU64,
}

impl DryRunProvider {
    pub fn new(need_captcha: bool) -> Self {
        Self {
            need_captcha,
            orders: AtomicU64::new(0),
        }
    }

    pub fn orders_created(&self) -> u64 {
        self.orders.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for DryRunProvider {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn preflight(&self, account: &Account, target: &Target) -> Result<PreflightOutcome> {
        Ok(PreflightOutcome {
            result: PreflightResult {
                can_buy: true,
                need_captcha: self.need_captcha,
                total_fee: 0,
                trace_id: format!("dry-{}", uuid::Uuid::new_v4()),
                render_payload: json!({
                    "item_id": target.item_id,
                    "sku_id": target.sku_id,
                    "quantity": target.order_qty(),
                }),
            },
            account: account.clone(),
        })
    }

    async fn create_order(
        &self,
        account: &Account,
        _target: &Target,
        preflight: &PreflightResult,
        _captcha_token: Option<&str>,
    ) -> Result<OrderOutcome> {
        let n = self.orders.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(OrderOutcome {
            result: OrderResult {
                success: true,
                order_id: format!("DRY{n:08}"),
                trace_id: preflight.trace_id.clone(),
            },
            account: account.clone(),
        })
    }
}

/// Token source for dry runs: hands out `dry-token-1`, `dry-token-2`, ...
/// without touching a browser.
#[derive(Debug, Default)]
pub struct DryRunTokens {
    issued: AtomicU64,
}

impl DryRunTokens {
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TokenSource for DryRunTokens {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("dry-token-{n}"))
    }
}
