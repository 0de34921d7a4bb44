//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! The centerpiece is [`StubExchange`]: a scripted [`ExchangeClient`]
//! whose action results pop from per-action queues (defaulting to a
//! success echo mirroring the submission) and whose streaming buffers
//! are fed by the test through `push_*` handles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::bus::{handler, BusEvent, EventBus, EventKey};
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{
    ConnectExchange, Credentials, ExchangeClient, LeverageAck, OrderSubmission, RetryPolicy,
    RetryingClient,
};
use crate::models::{MarginUpdate, Position, Symbol, Trade};

/// Everything the stub was asked to do, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    FetchMargins,
    FetchPositions,
    FetchOrders { limit: u32, reverse: bool },
    FetchTickers,
    CreateOrder(OrderSubmission),
    CancelOrder(String),
    SetLeverage { symbol: String, leverage: Decimal },
    Close,
}

/// One scripted action result: echo the default, reply with a fixed
/// value, or fail.
pub enum ScriptedOutcome<T> {
    Default,
    Reply(T),
    Fail(ExchangeError),
}

type ActionScript<T> = Mutex<VecDeque<ScriptedOutcome<T>>>;

struct StreamFeed<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Default for StreamFeed<T> {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: AsyncMutex::new(receiver),
        }
    }
}

impl<T> StreamFeed<T> {
    async fn next(&self) -> Result<T> {
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ExchangeError::Network("stream closed".into()).into())
    }
}

#[derive(Default)]
pub struct StubExchange {
    calls: Mutex<Vec<RecordedCall>>,
    echo_counter: AtomicU64,

    margin_snapshot: Mutex<Vec<MarginUpdate>>,
    position_snapshot: Mutex<Vec<Position>>,
    order_snapshot: Mutex<Vec<Trade>>,
    ticker_snapshot: Mutex<HashMap<String, Symbol>>,
    fetch_margin_failure: Mutex<Option<ExchangeError>>,

    create_order_script: ActionScript<Trade>,
    cancel_order_script: ActionScript<Trade>,
    set_leverage_script: ActionScript<LeverageAck>,

    margins_feed: StreamFeed<Vec<MarginUpdate>>,
    positions_feed: StreamFeed<Vec<Position>>,
    tickers_feed: StreamFeed<HashMap<String, Symbol>>,
    orders_feed: StreamFeed<Vec<Trade>>,
    my_trades_feed: StreamFeed<Vec<Trade>>,
}

impl StubExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of<F: Fn(&RecordedCall) -> bool>(&self, filter: F) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| filter(c)).cloned().collect()
    }

    /// Forget recorded calls (e.g. the snapshot fetches of a bind).
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().push(call);
    }

    // Scripting ------------------------------------------------------

    pub fn seed_margin_snapshot(&self, rows: Vec<MarginUpdate>) {
        *self.margin_snapshot.lock() = rows;
    }

    pub fn seed_position_snapshot(&self, rows: Vec<Position>) {
        *self.position_snapshot.lock() = rows;
    }

    pub fn seed_order_snapshot(&self, rows: Vec<Trade>) {
        *self.order_snapshot.lock() = rows;
    }

    pub fn seed_ticker_snapshot(&self, rows: HashMap<String, Symbol>) {
        *self.ticker_snapshot.lock() = rows;
    }

    /// Make every `fetch_margins` fail; used to simulate rejected keys.
    pub fn fail_margins_with(&self, error: ExchangeError) {
        *self.fetch_margin_failure.lock() = Some(error);
    }

    /// Queue the next `create_order` outcomes. When the queue is
    /// empty the stub echoes the submission back with a fresh order
    /// id.
    pub fn script_create_order(&self, outcomes: Vec<ScriptedOutcome<Trade>>) {
        self.create_order_script.lock().extend(outcomes);
    }

    pub fn script_cancel_order(&self, outcomes: Vec<ScriptedOutcome<Trade>>) {
        self.cancel_order_script.lock().extend(outcomes);
    }

    pub fn script_set_leverage(&self, outcomes: Vec<ScriptedOutcome<LeverageAck>>) {
        self.set_leverage_script.lock().extend(outcomes);
    }

    // Stream feeds ---------------------------------------------------

    pub fn push_margins(&self, frame: Vec<MarginUpdate>) {
        let _ = self.margins_feed.sender.send(frame);
    }

    pub fn push_positions(&self, frame: Vec<Position>) {
        let _ = self.positions_feed.sender.send(frame);
    }

    pub fn push_tickers(&self, frame: HashMap<String, Symbol>) {
        let _ = self.tickers_feed.sender.send(frame);
    }

    pub fn push_orders(&self, frame: Vec<Trade>) {
        let _ = self.orders_feed.sender.send(frame);
    }

    pub fn push_my_trades(&self, frame: Vec<Trade>) {
        let _ = self.my_trades_feed.sender.send(frame);
    }

    /// The success echo: the submission reflected back the way the
    /// exchange would acknowledge it.
    fn default_echo(&self, submission: &OrderSubmission) -> Trade {
        let sequence = self.echo_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Trade {
            order_id: format!("stub-order-{sequence}"),
            symbol: Some(submission.symbol.clone()),
            side: Some(submission.side.as_exchange().to_string()),
            order_type: Some(submission.order_type.as_exchange().to_string()),
            status: Some("New".to_string()),
            order_quantity: submission.quantity,
            filled_quantity: Some(Decimal::ZERO),
            leaves_quantity: submission.quantity,
            avg_price: None,
            price: submission.price,
            client_order_id: submission.params.client_order_id.clone(),
            client_order_link_id: None,
            peg_price_type: submission.params.peg_price_type.clone(),
            peg_offset_value: submission.params.peg_offset_value,
            text: Some("Submitted via testkit.".to_string()),
            stop_price: submission.params.stop_price,
            timestamp: Some("2021-01-01T00:00:00.000Z".to_string()),
        }
    }
}

#[async_trait]
impl ExchangeClient for StubExchange {
    async fn fetch_margins(&self) -> Result<Vec<MarginUpdate>> {
        self.record(RecordedCall::FetchMargins);
        if let Some(error) = self.fetch_margin_failure.lock().clone() {
            return Err(error.into());
        }
        Ok(self.margin_snapshot.lock().clone())
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        self.record(RecordedCall::FetchPositions);
        Ok(self.position_snapshot.lock().clone())
    }

    async fn fetch_orders(&self, limit: u32, reverse: bool) -> Result<Vec<Trade>> {
        self.record(RecordedCall::FetchOrders { limit, reverse });
        Ok(self.order_snapshot.lock().clone())
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        self.record(RecordedCall::FetchTickers);
        Ok(self.ticker_snapshot.lock().clone())
    }

    async fn watch_margins(&self) -> Result<Vec<MarginUpdate>> {
        self.margins_feed.next().await
    }

    async fn watch_positions(&self) -> Result<Vec<Position>> {
        self.positions_feed.next().await
    }

    async fn watch_tickers(&self) -> Result<HashMap<String, Symbol>> {
        self.tickers_feed.next().await
    }

    async fn watch_orders(&self) -> Result<Vec<Trade>> {
        self.orders_feed.next().await
    }

    async fn watch_my_trades(&self) -> Result<Vec<Trade>> {
        self.my_trades_feed.next().await
    }

    async fn create_order(&self, submission: &OrderSubmission) -> Result<Trade> {
        self.record(RecordedCall::CreateOrder(submission.clone()));
        match self.create_order_script.lock().pop_front() {
            Some(ScriptedOutcome::Reply(trade)) => Ok(trade),
            Some(ScriptedOutcome::Fail(error)) => Err(error.into()),
            Some(ScriptedOutcome::Default) | None => Ok(self.default_echo(submission)),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Trade> {
        self.record(RecordedCall::CancelOrder(order_id.to_string()));
        match self.cancel_order_script.lock().pop_front() {
            Some(ScriptedOutcome::Reply(trade)) => Ok(trade),
            Some(ScriptedOutcome::Fail(error)) => Err(error.into()),
            Some(ScriptedOutcome::Default) | None => Ok(Trade {
                order_id: order_id.to_string(),
                symbol: None,
                side: None,
                order_type: None,
                status: Some("Canceled".to_string()),
                order_quantity: None,
                filled_quantity: None,
                leaves_quantity: None,
                avg_price: None,
                price: None,
                client_order_id: None,
                client_order_link_id: None,
                peg_price_type: None,
                peg_offset_value: None,
                text: Some("Canceled via testkit.".to_string()),
                stop_price: None,
                timestamp: Some("2021-01-01T00:00:00.000Z".to_string()),
            }),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<LeverageAck> {
        self.record(RecordedCall::SetLeverage {
            symbol: symbol.to_string(),
            leverage,
        });
        match self.set_leverage_script.lock().pop_front() {
            Some(ScriptedOutcome::Reply(ack)) => Ok(ack),
            Some(ScriptedOutcome::Fail(error)) => Err(error.into()),
            Some(ScriptedOutcome::Default) | None => Ok(LeverageAck {
                symbol: symbol.to_string(),
                leverage: Some(leverage),
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        self.record(RecordedCall::Close);
        Ok(())
    }
}

/// Connector handing out one shared [`StubExchange`], optionally
/// behind the retry adapter.
pub struct StubConnector {
    exchange: Arc<StubExchange>,
    retry: Mutex<Option<RetryPolicy>>,
}

impl Default for StubConnector {
    fn default() -> Self {
        Self {
            exchange: StubExchange::new(),
            retry: Mutex::new(None),
        }
    }
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand sessions out behind [`RetryingClient`] with this policy.
    pub fn set_retry(&self, policy: RetryPolicy) {
        *self.retry.lock() = Some(policy);
    }

    pub fn exchange(&self) -> Arc<StubExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn seed_order_snapshot(&self, rows: Vec<Trade>) {
        self.exchange.seed_order_snapshot(rows);
    }

    pub fn fail_margins_with(&self, error: ExchangeError) {
        self.exchange.fail_margins_with(error);
    }
}

#[async_trait]
impl ConnectExchange for StubConnector {
    async fn connect(
        &self,
        _credentials: &Credentials,
        _sandbox: bool,
    ) -> Result<Arc<dyn ExchangeClient>> {
        let stub: Arc<dyn ExchangeClient> = Arc::clone(&self.exchange) as Arc<dyn ExchangeClient>;
        match self.retry.lock().clone() {
            Some(policy) => Ok(Arc::new(RetryingClient::new(stub, policy))),
            None => Ok(stub),
        }
    }
}

/// Capture every event published on `key` for later assertions.
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl CapturedEvents {
    pub fn subscribe(bus: &EventBus, key: EventKey) -> Self {
        let events: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.register(
            key,
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(event);
                    Ok(())
                }
            }),
        );
        Self { events }
    }

    pub fn take(&self) -> Vec<BusEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn snapshot(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// A ticker fixture with the fields the orchestrator reads.
pub fn ticker_fixture(symbol: &str, underlying: &str, tick_size: &str, price: &str) -> Symbol {
    serde_json::from_str(&format!(
        r#"{{
            "symbol": "{symbol}",
            "state": "Open",
            "settlCurrency": "XBt",
            "underlying": "{underlying}",
            "quoteCurrency": "USD",
            "markPrice": {price},
            "tickSize": {tick_size},
            "lastPriceProtected": {price}
        }}"#
    ))
    .expect("valid ticker fixture")
}

/// A margin row fixture in raw XBt units.
pub fn margin_fixture(currency: &str, available_xbt_units: i64, maint_xbt_units: i64) -> MarginUpdate {
    MarginUpdate {
        currency: currency.to_string(),
        available_margin: Some(Decimal::from(available_xbt_units)),
        margin_balance: None,
        maint_margin: Some(Decimal::from(maint_xbt_units)),
    }
}

/// Build a transient (retryable) exchange failure in the library's
/// wire format.
pub fn transient_failure(message: &str) -> ExchangeError {
    ExchangeError::Network(format!(
        r#"bitmex {{"error":{{"message":"{message}","name":"HTTPError"}}}}"#
    ))
}

/// Build a fatal exchange failure in the library's wire format.
pub fn fatal_failure(message: &str) -> ExchangeError {
    ExchangeError::InvalidOrder(format!(
        r#"bitmex {{"error":{{"message":"{message}","name":"ValidationError"}}}}"#
    ))
}

/// Convenience: an `Error` from a stubbed exchange failure.
pub fn exchange_error(error: ExchangeError) -> Error {
    error.into()
}
