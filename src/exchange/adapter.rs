use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{ExchangeError, Result};
use crate::models::{MarginUpdate, Position, Symbol, Trade};

use super::retry::RetryPolicy;
use super::{ExchangeClient, LeverageAck, OrderSubmission};

/// Wraps any [`ExchangeClient`] with the bounded-retry policy.
///
/// Only the actions retry; snapshots and the streaming buffers pass
/// straight through. A response that fails its success predicate (an
/// order echo without a status, a leverage ack without the leverage
/// field) counts as a retryable anomaly, not a success.
pub struct RetryingClient {
    inner: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn ExchangeClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ExchangeClient for RetryingClient {
    async fn fetch_margins(&self) -> Result<Vec<MarginUpdate>> {
        self.inner.fetch_margins().await
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        self.inner.fetch_positions().await
    }

    async fn fetch_orders(&self, limit: u32, reverse: bool) -> Result<Vec<Trade>> {
        self.inner.fetch_orders(limit, reverse).await
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        self.inner.fetch_tickers().await
    }

    async fn watch_margins(&self) -> Result<Vec<MarginUpdate>> {
        self.inner.watch_margins().await
    }

    async fn watch_positions(&self) -> Result<Vec<Position>> {
        self.inner.watch_positions().await
    }

    async fn watch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        self.inner.watch_tickers().await
    }

    async fn watch_orders(&self) -> Result<Vec<Trade>> {
        self.inner.watch_orders().await
    }

    async fn watch_my_trades(&self) -> Result<Vec<Trade>> {
        self.inner.watch_my_trades().await
    }

    async fn create_order(&self, submission: &OrderSubmission) -> Result<Trade> {
        let inner = Arc::clone(&self.inner);
        self.policy
            .run("create_order", move || {
                let inner = Arc::clone(&inner);
                let submission = submission.clone();
                async move {
                    let echo = inner.create_order(&submission).await?;
                    if !echo.has_status() {
                        return Err(ExchangeError::BadResponse(format!(
                            "order {} echoed without a status",
                            echo.order_id
                        ))
                        .into());
                    }
                    Ok(echo)
                }
            })
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Trade> {
        let inner = Arc::clone(&self.inner);
        self.policy
            .run("cancel_order", move || {
                let inner = Arc::clone(&inner);
                let order_id = order_id.to_string();
                async move { inner.cancel_order(&order_id).await }
            })
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<LeverageAck> {
        let inner = Arc::clone(&self.inner);
        self.policy
            .run("set_leverage", move || {
                let inner = Arc::clone(&inner);
                let symbol = symbol.to_string();
                async move {
                    let ack = inner.set_leverage(&symbol, leverage).await?;
                    if ack.leverage.is_none() {
                        return Err(ExchangeError::BadResponse(format!(
                            "leverage call for {symbol} returned no leverage"
                        ))
                        .into());
                    }
                    Ok(ack)
                }
            })
            .await
    }

    fn safe_symbol(&self, raw: &str) -> String {
        self.inner.safe_symbol(raw)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
