//! The exchange client contract and its retrying adapter.
//!
//! Everything above this module (orchestrator, lifecycle, fan-out)
//! talks to [`ExchangeClient`] only; the concrete BitMEX client lives
//! in [`bitmex`] and test doubles in the testkit.

pub mod adapter;
pub mod bitmex;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{MarginUpdate, OrderSide, OrderType, Position, Symbol, Trade};

pub use adapter::RetryingClient;
pub use retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Exchange-specific knobs of an order submission that ride in the
/// params map of the underlying API call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitParams {
    pub exec_inst: Option<String>,
    pub stop_price: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub peg_price_type: Option<String>,
    pub peg_offset_value: Option<Decimal>,
}

/// A fully resolved order ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSubmission {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    /// Contracts; `None` lets `execInst=Close` flatten the position.
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub params: SubmitParams,
}

/// Acknowledgement of a leverage change. `leverage` present (including
/// `0` for cross margin) means the call took effect.
#[derive(Debug, Clone, PartialEq)]
pub struct LeverageAck {
    pub symbol: String,
    pub leverage: Option<Decimal>,
}

/// The exchange library facade: REST snapshots, five streaming
/// buffers, and the order/cancel/leverage actions.
///
/// `watch_*` resolves with the next frame of its stream; callers loop.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_margins(&self) -> Result<Vec<MarginUpdate>>;
    async fn fetch_positions(&self) -> Result<Vec<Position>>;
    async fn fetch_orders(&self, limit: u32, reverse: bool) -> Result<Vec<Trade>>;
    async fn fetch_tickers(&self) -> Result<HashMap<String, Symbol>>;

    async fn watch_margins(&self) -> Result<Vec<MarginUpdate>>;
    async fn watch_positions(&self) -> Result<Vec<Position>>;
    async fn watch_tickers(&self) -> Result<HashMap<String, Symbol>>;
    async fn watch_orders(&self) -> Result<Vec<Trade>>;
    async fn watch_my_trades(&self) -> Result<Vec<Trade>>;

    async fn create_order(&self, submission: &OrderSubmission) -> Result<Trade>;
    async fn cancel_order(&self, order_id: &str) -> Result<Trade>;
    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<LeverageAck>;

    /// Normalize a caller-supplied symbol to the exchange spelling.
    fn safe_symbol(&self, raw: &str) -> String {
        raw.replace(['/', ':'], "").to_ascii_uppercase()
    }

    async fn close(&self) -> Result<()>;

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Option<Decimal>,
        params: SubmitParams,
    ) -> Result<Trade> {
        self.create_order(&OrderSubmission {
            symbol: symbol.to_string(),
            order_type: OrderType::Limit,
            side,
            quantity: Some(quantity),
            price,
            params,
        })
        .await
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        params: SubmitParams,
    ) -> Result<Trade> {
        self.create_order(&OrderSubmission {
            symbol: symbol.to_string(),
            order_type: OrderType::Market,
            side,
            quantity: Some(quantity),
            price: None,
            params,
        })
        .await
    }
}

/// Async constructor for exchange sessions; the account lifecycle owns
/// one of these and calls it on every bind.
#[async_trait]
pub trait ConnectExchange: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        sandbox: bool,
    ) -> Result<Arc<dyn ExchangeClient>>;
}

/// Production connector: a signed BitMEX client behind the retry
/// adapter.
#[derive(Default)]
pub struct BitmexConnector {
    pub retry: RetryPolicy,
}

#[async_trait]
impl ConnectExchange for BitmexConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        sandbox: bool,
    ) -> Result<Arc<dyn ExchangeClient>> {
        let client = bitmex::BitmexClient::connect(credentials.clone(), sandbox)?;
        Ok(Arc::new(RetryingClient::new(client, self.retry.clone())))
    }
}

/// Extract the human error out of an exchange library message.
///
/// The library formats failures as `bitmex {json body}`; the remainder
/// decodes to `{"error": {"message": ...}}`. Anything else collapses
/// to `"Unknown Error"`.
pub fn parse_error_message(raw: &str) -> String {
    let body = raw.strip_prefix("bitmex ").unwrap_or(raw);
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Unknown Error".to_string())
}
