//! Order notifications.
//!
//! Formatting and delivery (mail, chat) belong to the implementor; the
//! engine only reports that an order exists.

use async_trait::async_trait;
use tracing::info;

use crate::config::secrets::redact;
use crate::error::Result;
use crate::model::OrderCreatedEvent;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_order_created(&self, event: &OrderCreatedEvent) -> Result<()>;
}

/// Writes one structured log line per order.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_order_created(&self, event: &OrderCreatedEvent) -> Result<()> {
        info!(
            account_id = %event.account_id,
            mobile = %redact(&event.mobile),
            target_id = %event.target_id,
            target = %event.target_name,
            mode = %event.mode,
            quantity = event.quantity,
            order_id = %event.order_id,
            trace_id = %event.trace_id,
            "order created"
        );
        Ok(())
    }
}
