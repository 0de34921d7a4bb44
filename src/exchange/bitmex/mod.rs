//! A thin BitMEX client implementing the exchange contract.
//!
//! REST snapshots and actions are individually signed requests; the
//! five streaming buffers are fed by one authenticated realtime
//! socket. Testnet is selected by the sandbox flag at connect time.

mod rest;
mod signing;
mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{ExchangeError, Result};
use crate::models::{MarginUpdate, Position, Symbol, Trade};

use super::{Credentials, ExchangeClient, LeverageAck, OrderSubmission};
use rest::{CancelOrderBody, LeverageBody, NewOrderBody};
use ws::StreamBuffers;

const MAINNET_REST: &str = "https://www.bitmex.com";
const TESTNET_REST: &str = "https://testnet.bitmex.com";
const MAINNET_WS: &str = "wss://ws.bitmex.com/realtime";
const TESTNET_WS: &str = "wss://ws.testnet.bitmex.com/realtime";

const REST_TIMEOUT: Duration = Duration::from_secs(30);

struct Receivers {
    margins: AsyncMutex<broadcast::Receiver<Vec<MarginUpdate>>>,
    positions: AsyncMutex<broadcast::Receiver<Vec<Position>>>,
    tickers: AsyncMutex<broadcast::Receiver<HashMap<String, Symbol>>>,
    orders: AsyncMutex<broadcast::Receiver<Vec<Trade>>>,
    my_trades: AsyncMutex<broadcast::Receiver<Vec<Trade>>>,
}

pub struct BitmexClient {
    http: reqwest::Client,
    credentials: Credentials,
    rest_url: String,
    receivers: Receivers,
    closed: Arc<AtomicBool>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
}

impl BitmexClient {
    /// Build a client and start its realtime socket.
    pub fn connect(credentials: Credentials, sandbox: bool) -> Result<Arc<Self>> {
        let (rest_url, ws_url) = if sandbox {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };
        info!(sandbox, rest = rest_url, "connecting BitMEX client");

        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(rest::map_transport_error)?;

        let buffers = StreamBuffers::new();
        let receivers = Receivers {
            margins: AsyncMutex::new(buffers.margins.subscribe()),
            positions: AsyncMutex::new(buffers.positions.subscribe()),
            tickers: AsyncMutex::new(buffers.tickers.subscribe()),
            orders: AsyncMutex::new(buffers.orders.subscribe()),
            my_trades: AsyncMutex::new(buffers.my_trades.subscribe()),
        };

        let closed = Arc::new(AtomicBool::new(false));
        let socket_task = tokio::spawn(ws::run_socket(
            ws_url.to_string(),
            credentials.clone(),
            buffers,
            Arc::clone(&closed),
        ));

        Ok(Arc::new(Self {
            http,
            credentials,
            rest_url: rest_url.to_string(),
            receivers,
            closed,
            socket_task: Mutex::new(Some(socket_task)),
        }))
    }
}

/// Await the next frame on a buffer, skipping over lag.
async fn next_frame<T: Clone>(
    receiver: &AsyncMutex<broadcast::Receiver<T>>,
) -> Result<T> {
    let mut receiver = receiver.lock().await;
    loop {
        match receiver.recv().await {
            Ok(frame) => return Ok(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "stream buffer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(ExchangeError::Network("realtime stream closed".into()).into())
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for BitmexClient {
    async fn fetch_margins(&self) -> Result<Vec<MarginUpdate>> {
        // currency=all returns one row per margined currency.
        self.signed_request::<(), Vec<MarginUpdate>>(
            Method::GET,
            "/api/v1/user/margin?currency=all",
            None,
        )
        .await
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        self.signed_request::<(), Vec<Position>>(Method::GET, "/api/v1/position", None)
            .await
    }

    async fn fetch_orders(&self, limit: u32, reverse: bool) -> Result<Vec<Trade>> {
        let path = format!("/api/v1/order?count={limit}&reverse={reverse}");
        self.signed_request::<(), Vec<Trade>>(Method::GET, &path, None)
            .await
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        let rows: Vec<Symbol> = self
            .signed_request::<(), Vec<Symbol>>(Method::GET, "/api/v1/instrument/active", None)
            .await?;
        Ok(rows
            .into_iter()
            .map(|symbol| (symbol.symbol.clone(), symbol))
            .collect())
    }

    async fn watch_margins(&self) -> Result<Vec<MarginUpdate>> {
        next_frame(&self.receivers.margins).await
    }

    async fn watch_positions(&self) -> Result<Vec<Position>> {
        next_frame(&self.receivers.positions).await
    }

    async fn watch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        next_frame(&self.receivers.tickers).await
    }

    async fn watch_orders(&self) -> Result<Vec<Trade>> {
        next_frame(&self.receivers.orders).await
    }

    async fn watch_my_trades(&self) -> Result<Vec<Trade>> {
        next_frame(&self.receivers.my_trades).await
    }

    async fn create_order(&self, submission: &OrderSubmission) -> Result<Trade> {
        let body = NewOrderBody {
            symbol: submission.symbol.clone(),
            ord_type: submission.order_type.as_exchange().to_string(),
            side: submission.side.as_exchange().to_string(),
            order_qty: submission.quantity,
            price: submission.price,
            stop_px: submission.params.stop_price,
            exec_inst: submission.params.exec_inst.clone(),
            cl_ord_id: submission.params.client_order_id.clone(),
            peg_price_type: submission.params.peg_price_type.clone(),
            peg_offset_value: submission.params.peg_offset_value,
        };
        self.signed_request(Method::POST, "/api/v1/order", Some(&body))
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Trade> {
        let body = CancelOrderBody {
            order_id: order_id.to_string(),
        };
        let mut canceled: Vec<Trade> = self
            .signed_request(Method::DELETE, "/api/v1/order", Some(&body))
            .await?;
        if canceled.is_empty() {
            return Err(ExchangeError::OrderNotFound(format!(
                "bitmex {{\"error\":{{\"message\":\"Unable to cancel order {order_id}\"}}}}"
            ))
            .into());
        }
        Ok(canceled.remove(0))
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<LeverageAck> {
        let body = LeverageBody {
            symbol: symbol.to_string(),
            leverage,
        };
        let response: serde_json::Value = self
            .signed_request(Method::POST, "/api/v1/position/leverage", Some(&body))
            .await?;
        let leverage = response
            .get("leverage")
            .and_then(serde_json::Value::as_f64)
            .and_then(Decimal::from_f64_retain);
        Ok(LeverageAck {
            symbol: symbol.to_string(),
            leverage,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.socket_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
