//! The compound-order orchestrator.
//!
//! Executes create-order commands (main plus optional stop and
//! trailing-stop legs) with sequenced partial-failure semantics, and
//! the close-position / attach-stop / attach-trailing-stop / cancel
//! sub-flows. Every placement carries a nonce-augmented clOrdID so a
//! retried attempt never collides with a half-accepted one.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::account::AccountManager;
use crate::bus::{handler, BusEvent, CompoundEchoes, EventBus, EventKey, LegErrors};
use crate::error::{Error, Result};
use crate::exchange::{parse_error_message, ExchangeClient, OrderSubmission, SubmitParams};
use crate::models::{
    calculate_order_quantity, nonce_client_order_id, round_down_to_tick, AttachStopRequest,
    AttachTslRequest, CompoundOrderRequest, Margin, Order, OrderSide, OrderType,
    StopTriggerType, Symbol, Trade,
};
use crate::store::DataStore;

pub struct OrderExecutor {
    bus: Arc<EventBus>,
    store: Arc<dyn DataStore>,
    accounts: Arc<AccountManager>,
}

/// Offset factor for a trailing stop: the stop trails below the
/// reference for a closing sell, above it for a closing buy.
fn trailing_factor(side: OrderSide, percent: Decimal) -> Decimal {
    match side {
        OrderSide::Sell => Decimal::ONE - percent / dec!(100),
        OrderSide::Buy => Decimal::ONE + percent / dec!(100),
    }
}

/// The per-leg error string for a failed exchange call.
fn leg_error(error: &Error) -> String {
    match error {
        Error::Exchange(exchange_error) => parse_error_message(exchange_error.message()),
        other => parse_error_message(&other.to_string()),
    }
}

fn nonce_for(order: &Order) -> String {
    let base = order.client_order_id.as_deref().unwrap_or(&order.id);
    nonce_client_order_id(base)
}

impl OrderExecutor {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn DataStore>,
        accounts: Arc<AccountManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            accounts,
        })
    }

    /// Execute a compound order and publish the per-leg outcome.
    pub async fn create_order(&self, correlation_id: String, request: CompoundOrderRequest) {
        let stop_requested = request.orders.stop.is_some();
        let tsl_requested = request.orders.tsl.is_some();

        // A failure before or at the main leg fails every leg with the
        // same message.
        let fail_correlation = correlation_id.clone();
        let fail_all = move |message: String| {
            let mut errors = LegErrors {
                main: Some(message.clone()),
                ..LegErrors::default()
            };
            if stop_requested {
                errors.stop = Some(message.clone());
            }
            if tsl_requested {
                errors.tsl = Some(message);
            }
            BusEvent::OrderCreated {
                correlation_id: fail_correlation.clone(),
                orders: None,
                errors,
            }
        };

        let Some(main) = request.orders.main.clone() else {
            self.bus.publish(BusEvent::OrderCreated {
                correlation_id,
                orders: None,
                errors: LegErrors {
                    main: Some("Missing main order".to_string()),
                    ..LegErrors::default()
                },
            });
            return;
        };

        let Some(session) = self.accounts.session().await else {
            self.bus.publish(fail_all("No connected account".to_string()));
            return;
        };
        if let Err(error) = main.validate() {
            self.bus.publish(fail_all(leg_error(&error)));
            return;
        }

        let client = Arc::clone(&session.client);
        let symbol = client.safe_symbol(&main.symbol);
        let leverage = main.leverage.unwrap_or(Decimal::ONE);

        // Leverage first; its failure shorts the whole compound.
        if let Err(error) = client.set_leverage(&symbol, leverage).await {
            warn!(%symbol, error = %error, "leverage call failed");
            self.bus.publish(fail_all(leg_error(&error)));
            return;
        }

        // Collateral context from the materialized state.
        let (ticker, margin) = match self.collateral_context(&session.account_id, &symbol).await
        {
            Ok(context) => context,
            Err(message) => {
                self.bus.publish(fail_all(message));
                return;
            }
        };

        let main_echo = match self
            .place_main(&client, &main, &symbol, leverage, &ticker, &margin)
            .await
        {
            Ok(echo) => echo,
            Err(error) => {
                self.bus.publish(fail_all(leg_error(&error)));
                return;
            }
        };
        info!(
            symbol = %symbol,
            order_id = %main_echo.order_id,
            "main order accepted"
        );
        self.bus.publish(BusEvent::OrderPlaced {
            account_id: session.account_id.clone(),
            order: main.clone(),
        });

        let accepted_quantity = main_echo.order_quantity;
        let mut echoes = CompoundEchoes {
            main: Some(main_echo),
            ..CompoundEchoes::default()
        };
        let mut errors = LegErrors::default();

        // Subordinate legs fail independently of the accepted main.
        if let Some(stop) = &request.orders.stop {
            match self
                .place_stop_leg(&client, stop, &symbol, accepted_quantity, &ticker)
                .await
            {
                Ok(echo) => echoes.stop = Some(echo),
                Err(error) => {
                    warn!(symbol = %symbol, error = %error, "stop leg failed");
                    errors.stop = Some(leg_error(&error));
                }
            }
        }
        if let Some(tsl) = &request.orders.tsl {
            match self
                .place_tsl_leg(&client, tsl, &symbol, accepted_quantity, &ticker)
                .await
            {
                Ok(echo) => echoes.tsl = Some(echo),
                Err(error) => {
                    warn!(symbol = %symbol, error = %error, "trailing stop leg failed");
                    errors.tsl = Some(leg_error(&error));
                }
            }
        }

        self.bus.publish(BusEvent::OrderCreated {
            correlation_id,
            orders: Some(echoes),
            errors,
        });
    }

    async fn collateral_context(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> std::result::Result<(Symbol, Margin), String> {
        let ticker = self
            .store
            .get_ticker(account_id, symbol)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| format!("No ticker data for {symbol}"))?;
        let currency = ticker.currency.clone().unwrap_or_else(|| "XBt".to_string());
        let margin = self
            .store
            .get_margin(account_id, &currency)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| format!("No margin data for {currency}"))?;
        Ok((ticker, margin))
    }

    async fn place_main(
        &self,
        client: &Arc<dyn ExchangeClient>,
        main: &Order,
        symbol: &str,
        leverage: Decimal,
        ticker: &Symbol,
        margin: &Margin,
    ) -> Result<Trade> {
        let price = main.price.or(ticker.last_price_protected).ok_or_else(|| {
            Error::InvalidMessage(format!("no price available for {symbol}"))
        })?;
        let quantity = calculate_order_quantity(
            margin.available,
            main.percent.unwrap_or_default(),
            price,
            leverage,
            ticker,
        );

        let params = SubmitParams {
            client_order_id: Some(nonce_for(main)),
            ..SubmitParams::default()
        };

        match main.order_type {
            OrderType::Limit | OrderType::Stop => {
                client
                    .create_limit_order(symbol, main.side, quantity, Some(price), params)
                    .await
            }
            OrderType::Market => {
                client
                    .create_market_order(symbol, main.side, quantity, params)
                    .await
            }
        }
    }

    /// A ReduceOnly stop sized to the accepted main amount.
    async fn place_stop_leg(
        &self,
        client: &Arc<dyn ExchangeClient>,
        stop: &Order,
        symbol: &str,
        accepted_quantity: Option<Decimal>,
        ticker: &Symbol,
    ) -> Result<Trade> {
        let stop_price = stop.stop_price.ok_or_else(|| {
            Error::InvalidMessage(format!("stop order {} is missing stopPrice", stop.id))
        })?;
        let trigger = stop.stop_trigger_type.unwrap_or(StopTriggerType::LastPrice);
        let tick_size = ticker.tick_size.unwrap_or(Decimal::ONE);
        let stop_px = round_down_to_tick(stop_price, tick_size, ticker.fractional_digits());

        client
            .create_order(&OrderSubmission {
                symbol: symbol.to_string(),
                order_type: OrderType::Stop,
                side: stop.side,
                quantity: accepted_quantity,
                price: None,
                params: SubmitParams {
                    exec_inst: Some(format!("ReduceOnly,{}", trigger.as_exec_inst())),
                    stop_price: Some(stop_px),
                    client_order_id: Some(nonce_for(stop)),
                    ..SubmitParams::default()
                },
            })
            .await
    }

    /// A trailing stop pegged to the trigger's reference price.
    async fn place_tsl_leg(
        &self,
        client: &Arc<dyn ExchangeClient>,
        tsl: &Order,
        symbol: &str,
        accepted_quantity: Option<Decimal>,
        ticker: &Symbol,
    ) -> Result<Trade> {
        let percent = tsl.trailing_stop_percent.ok_or_else(|| {
            Error::InvalidMessage(format!(
                "trailing order {} is missing trailingStopPercent",
                tsl.id
            ))
        })?;
        let trigger = tsl.stop_trigger_type.unwrap_or(StopTriggerType::LastPrice);
        let reference = trigger.reference_price(ticker).ok_or_else(|| {
            Error::InvalidMessage(format!("no reference price for {symbol}"))
        })?;

        let digits = ticker.fractional_digits();
        let tick_size = ticker.tick_size.unwrap_or(Decimal::ONE);
        let stop_px =
            round_down_to_tick(reference * trailing_factor(tsl.side, percent), tick_size, digits);
        let peg_offset = (stop_px - reference).round_dp(digits);

        client
            .create_order(&OrderSubmission {
                symbol: symbol.to_string(),
                order_type: OrderType::Stop,
                side: tsl.side,
                quantity: accepted_quantity,
                price: None,
                params: SubmitParams {
                    exec_inst: Some(format!("ReduceOnly,{}", trigger.as_exec_inst())),
                    stop_price: Some(stop_px),
                    client_order_id: Some(nonce_for(tsl)),
                    peg_price_type: Some("TrailingStopPeg".to_string()),
                    peg_offset_value: Some(peg_offset),
                },
            })
            .await
    }

    /// Close (part of) the stored position for the main leg's symbol.
    pub async fn close_position(&self, correlation_id: String, request: CompoundOrderRequest) {
        let publish = |order: Option<Trade>, error: Option<String>| BusEvent::PositionClosed {
            correlation_id: correlation_id.clone(),
            order,
            error,
        };

        let Some(main) = request.orders.main else {
            self.bus
                .publish(publish(None, Some("Missing main order".to_string())));
            return;
        };
        let Some(session) = self.accounts.session().await else {
            self.bus
                .publish(publish(None, Some("No connected account".to_string())));
            return;
        };

        let client = Arc::clone(&session.client);
        let symbol = client.safe_symbol(&main.symbol);
        let position = match self.store.get_position(&session.account_id, &symbol).await {
            Ok(Some(position)) => position,
            _ => {
                self.bus
                    .publish(publish(None, Some(format!("No position for {symbol}"))));
                return;
            }
        };

        let current = position.current_quantity.unwrap_or_default();
        // Portion of the position to flatten, signed against it.
        let quantity = main.percent.map(|percent| {
            let fraction = percent / dec!(100);
            let rounded = (fraction * current).round_dp(0);
            let clamped = if current > Decimal::ZERO {
                rounded.max(Decimal::ONE)
            } else {
                rounded.min(Decimal::ONE)
            };
            -clamped
        });

        let side = if current > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let order_type = if main.price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let submission = OrderSubmission {
            symbol: symbol.clone(),
            order_type,
            side,
            quantity,
            price: main.price,
            params: SubmitParams {
                exec_inst: Some("Close".to_string()),
                client_order_id: Some(nonce_for(&main)),
                ..SubmitParams::default()
            },
        };
        match client.create_order(&submission).await {
            Ok(echo) => {
                info!(symbol = %symbol, order_id = %echo.order_id, "position close accepted");
                self.bus.publish(publish(Some(echo), None));
            }
            Err(error) => {
                warn!(symbol = %symbol, %error, "position close failed");
                self.bus.publish(publish(None, Some(leg_error(&error))));
            }
        }
    }

    /// Attach a fixed stop that closes the open position when hit.
    pub async fn add_stop(&self, correlation_id: String, request: AttachStopRequest) {
        let publish = |order: Option<Trade>, error: Option<String>| BusEvent::PositionAddedStop {
            correlation_id: correlation_id.clone(),
            order,
            error,
        };

        let context = self.position_context(&request.symbol).await;
        let (client, symbol, position, ticker) = match context {
            Ok(parts) => parts,
            Err(message) => {
                self.bus.publish(publish(None, Some(message)));
                return;
            }
        };

        let stop_px = round_down_to_tick(
            request.stop_price,
            ticker.tick_size.unwrap_or(Decimal::ONE),
            ticker.fractional_digits(),
        );
        let submission = OrderSubmission {
            symbol,
            order_type: OrderType::Stop,
            side: position.side().opposite(),
            quantity: None,
            price: None,
            params: SubmitParams {
                exec_inst: Some(format!(
                    "Close,{}",
                    request.stop_trigger_price_type.as_exec_inst()
                )),
                stop_price: Some(stop_px),
                ..SubmitParams::default()
            },
        };
        match client.create_order(&submission).await {
            Ok(echo) => self.bus.publish(publish(Some(echo), None)),
            Err(error) => self.bus.publish(publish(None, Some(leg_error(&error)))),
        }
    }

    /// Attach a trailing stop that closes the open position.
    pub async fn add_trailing_stop(&self, correlation_id: String, request: AttachTslRequest) {
        let publish = |order: Option<Trade>, error: Option<String>| BusEvent::PositionAddedTsl {
            correlation_id: correlation_id.clone(),
            order,
            error,
        };

        let context = self.position_context(&request.symbol).await;
        let (client, symbol, position, ticker) = match context {
            Ok(parts) => parts,
            Err(message) => {
                self.bus.publish(publish(None, Some(message)));
                return;
            }
        };

        let trigger = request.stop_trigger_price_type;
        let Some(reference) = trigger.reference_price(&ticker) else {
            self.bus
                .publish(publish(None, Some(format!("No reference price for {symbol}"))));
            return;
        };

        let side = position.side().opposite();
        let digits = ticker.fractional_digits();
        let stop_px = round_down_to_tick(
            reference * trailing_factor(side, request.tsl_percent),
            ticker.tick_size.unwrap_or(Decimal::ONE),
            digits,
        );
        let peg_offset = (stop_px - reference).round_dp(digits);

        let submission = OrderSubmission {
            symbol,
            order_type: OrderType::Stop,
            side,
            quantity: None,
            price: None,
            params: SubmitParams {
                exec_inst: Some(format!("Close,{}", trigger.as_exec_inst())),
                stop_price: Some(stop_px),
                peg_price_type: Some("TrailingStopPeg".to_string()),
                peg_offset_value: Some(peg_offset),
                ..SubmitParams::default()
            },
        };
        match client.create_order(&submission).await {
            Ok(echo) => self.bus.publish(publish(Some(echo), None)),
            Err(error) => self.bus.publish(publish(None, Some(leg_error(&error)))),
        }
    }

    /// Cancel an order for the bound account.
    pub async fn cancel_order(
        &self,
        correlation_id: String,
        account_id: String,
        order_id: String,
    ) {
        let publish = |order: Option<Trade>, error: Option<String>| BusEvent::OrderCanceled {
            correlation_id: correlation_id.clone(),
            order,
            error,
        };

        let Some(session) = self.accounts.session().await else {
            self.bus
                .publish(publish(None, Some("No matching account".to_string())));
            return;
        };
        if session.account_id != account_id {
            self.bus
                .publish(publish(None, Some("No matching account".to_string())));
            return;
        }

        match session.client.cancel_order(&order_id).await {
            Ok(echo) => {
                info!(order_id = %order_id, "order canceled");
                self.bus.publish(publish(Some(echo), None));
            }
            Err(error) => {
                warn!(order_id = %order_id, %error, "cancel failed");
                self.bus.publish(publish(None, Some(leg_error(&error))));
            }
        }
    }

    /// Resolve session + ticker + position for the attach sub-flows.
    async fn position_context(
        &self,
        raw_symbol: &str,
    ) -> std::result::Result<
        (
            Arc<dyn ExchangeClient>,
            String,
            crate::models::Position,
            Symbol,
        ),
        String,
    > {
        let session = self
            .accounts
            .session()
            .await
            .ok_or_else(|| "No connected account".to_string())?;
        let symbol = session.client.safe_symbol(raw_symbol);
        let ticker = self
            .store
            .get_ticker(&session.account_id, &symbol)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| format!("No ticker data for {symbol}"))?;
        let position = self
            .store
            .get_position(&session.account_id, &symbol)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| format!("No position for {symbol}"))?;
        Ok((session.client, symbol, position, ticker))
    }

    /// Wire the order/position command keys to the executor.
    pub fn register_listeners(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        self.bus.register(
            EventKey::CreateOrderCmd,
            handler(move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let BusEvent::CreateOrderCmd {
                        correlation_id,
                        request,
                    } = event
                    {
                        executor.create_order(correlation_id, request).await;
                    }
                    Ok(())
                }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.register(
            EventKey::CancelOrderCmd,
            handler(move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let BusEvent::CancelOrderCmd {
                        correlation_id,
                        account_id,
                        order_id,
                    } = event
                    {
                        executor
                            .cancel_order(correlation_id, account_id, order_id)
                            .await;
                    }
                    Ok(())
                }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.register(
            EventKey::PositionCloseCmd,
            handler(move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let BusEvent::PositionCloseCmd {
                        correlation_id,
                        request,
                    } = event
                    {
                        executor.close_position(correlation_id, request).await;
                    }
                    Ok(())
                }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.register(
            EventKey::PositionAddStopCmd,
            handler(move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let BusEvent::PositionAddStopCmd {
                        correlation_id,
                        request,
                    } = event
                    {
                        executor.add_stop(correlation_id, request).await;
                    }
                    Ok(())
                }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.register(
            EventKey::PositionAddTslCmd,
            handler(move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let BusEvent::PositionAddTslCmd {
                        correlation_id,
                        request,
                    } = event
                    {
                        executor.add_trailing_stop(correlation_id, request).await;
                    }
                    Ok(())
                }
            }),
        );
    }
}
