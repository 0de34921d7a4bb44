//! Compound-order scenarios against the scripted exchange.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal_macros::dec;

use bitmex_relay::account::AccountManager;
use bitmex_relay::bus::{BusEvent, EventBus, EventKey};
use bitmex_relay::error::ExchangeError;
use bitmex_relay::exchange::{ConnectExchange, RetryPolicy};
use bitmex_relay::models::{
    demangle_client_order_id, CompoundOrderRequest, OrderSide, OrderType,
};
use bitmex_relay::orchestrator::OrderExecutor;
use bitmex_relay::store::{self, DataStore, MemoryStore};
use bitmex_relay::stream::StreamRouter;
use bitmex_relay::testkit::{
    margin_fixture, ticker_fixture, transient_failure, CapturedEvents, RecordedCall,
    ScriptedOutcome, StubConnector, StubExchange,
};

struct Harness {
    bus: Arc<EventBus>,
    store: Arc<MemoryStore>,
    accounts: Arc<AccountManager>,
    executor: Arc<OrderExecutor>,
    exchange: Arc<StubExchange>,
}

async fn connected_harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(MemoryStore::new());
    store::register_listeners(&bus, Arc::clone(&store) as Arc<dyn DataStore>);

    let router = StreamRouter::new(Arc::clone(&bus));
    let connector = StubConnector::new();
    connector.set_retry(RetryPolicy::immediate(3));
    let exchange = connector.exchange();

    let accounts = AccountManager::new(
        Arc::clone(&bus),
        Arc::clone(&connector) as Arc<dyn ConnectExchange>,
        router,
        true,
    );
    accounts
        .connect("A", "key", "secret", None)
        .await
        .expect("stub account binds");

    // Collateral context: 1.0 XBT available on XBTUSD at 50k, plus an
    // ETH quanto ticker.
    store
        .save_margins("A", &[margin_fixture("XBt", 150_000_000, 50_000_000)])
        .await
        .unwrap();
    let mut tickers = HashMap::new();
    tickers.insert(
        "XBTUSD".to_string(),
        ticker_fixture("XBTUSD", "XBT", "0.5", "50000"),
    );
    tickers.insert(
        "ETHUSD".to_string(),
        ticker_fixture("ETHUSD", "ETH", "0.05", "2000"),
    );
    store.save_tickers("A", &tickers).await.unwrap();

    let executor = OrderExecutor::new(
        Arc::clone(&bus),
        Arc::clone(&store) as Arc<dyn DataStore>,
        Arc::clone(&accounts),
    );
    executor.register_listeners();

    // The bind's snapshot fetches are not interesting to assertions.
    exchange.clear_calls();

    Harness {
        bus,
        store,
        accounts,
        executor,
        exchange,
    }
}

async fn drain() {
    for _ in 0..12 {
        tokio::task::yield_now().await;
    }
}

fn compound_request(json: &str) -> CompoundOrderRequest {
    serde_json::from_str(json).expect("valid request")
}

fn market_buy_with_stop() -> CompoundOrderRequest {
    compound_request(
        r#"{
            "orders": {
                "main": {
                    "id": "101",
                    "clOrderId": "abc_def",
                    "symbol": "XBTUSD",
                    "side": "BUY",
                    "orderType": "MARKET",
                    "percent": 50,
                    "leverage": 10
                },
                "stop": {
                    "id": "102",
                    "clOrderId": "abc_stp",
                    "symbol": "XBTUSD",
                    "side": "SELL",
                    "orderType": "STOP",
                    "percent": 50,
                    "leverage": 10,
                    "stopPrice": 40000,
                    "stopTriggerType": "MARK_PRICE"
                }
            }
        }"#,
    )
}

fn created_orders(harness_events: Vec<BusEvent>) -> Vec<BusEvent> {
    harness_events
        .into_iter()
        .filter(|event| matches!(event, BusEvent::OrderCreated { .. }))
        .collect()
}

#[tokio::test]
async fn compound_market_order_places_leverage_main_and_stop() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCreatedEvent);

    harness
        .executor
        .create_order("corr-1".into(), market_buy_with_stop())
        .await;
    drain().await;

    let calls = harness.exchange.calls();
    assert_eq!(
        calls[0],
        RecordedCall::SetLeverage {
            symbol: "XBTUSD".to_string(),
            leverage: dec!(10),
        }
    );

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    assert_eq!(submissions.len(), 2);

    // Main leg: market, quantity = floor(0.5 * 10 / (1/50000)).
    let main = &submissions[0];
    assert_eq!(main.order_type, OrderType::Market);
    assert_eq!(main.side, OrderSide::Buy);
    assert_eq!(main.quantity, Some(dec!(250000)));
    assert!(main.price.is_none());
    let nonced = main.params.client_order_id.as_deref().unwrap();
    assert!(nonced.starts_with("abc_def_"));
    assert_eq!(demangle_client_order_id(nonced), "abc_def");

    // Stop leg: ReduceOnly at the mark price trigger, sized to the
    // accepted main amount.
    let stop = &submissions[1];
    assert_eq!(stop.order_type, OrderType::Stop);
    assert_eq!(stop.side, OrderSide::Sell);
    assert_eq!(stop.quantity, Some(dec!(250000)));
    assert_eq!(
        stop.params.exec_inst.as_deref(),
        Some("ReduceOnly,MarkPrice")
    );
    assert_eq!(stop.params.stop_price, Some(dec!(40000.0)));

    let events = created_orders(captured.take());
    assert_eq!(events.len(), 1);
    let BusEvent::OrderCreated {
        correlation_id,
        orders,
        errors,
    } = &events[0]
    else {
        unreachable!()
    };
    assert_eq!(correlation_id, "corr-1");
    assert!(errors.is_empty());
    let orders = orders.as_ref().unwrap();
    assert!(orders.main.is_some());
    assert!(orders.stop.is_some());
    assert!(orders.tsl.is_none());
}

#[tokio::test]
async fn stop_leg_failure_keeps_the_main_and_reports_partial() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCreatedEvent);

    // Main succeeds; the stop leg fails transiently on all three
    // retry attempts.
    let failure = transient_failure("The system is currently overloaded.");
    harness.exchange.script_create_order(vec![
        ScriptedOutcome::Default,
        ScriptedOutcome::Fail(failure.clone()),
        ScriptedOutcome::Fail(failure.clone()),
        ScriptedOutcome::Fail(failure),
    ]);

    harness
        .executor
        .create_order("corr-2".into(), market_buy_with_stop())
        .await;
    drain().await;

    // One main placement plus three stop attempts.
    let create_calls = harness
        .exchange
        .calls_of(|call| matches!(call, RecordedCall::CreateOrder(_)));
    assert_eq!(create_calls.len(), 4);

    let events = created_orders(captured.take());
    let BusEvent::OrderCreated { orders, errors, .. } = &events[0] else {
        unreachable!()
    };
    let orders = orders.as_ref().unwrap();
    assert!(orders.main.is_some());
    assert!(orders.stop.is_none());
    assert!(errors.main.is_none());
    assert_eq!(
        errors.stop.as_deref(),
        Some("The system is currently overloaded.")
    );
    assert!(!errors.is_empty());
}

#[tokio::test]
async fn leverage_failure_shorts_the_whole_compound() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCreatedEvent);

    harness
        .exchange
        .script_set_leverage(vec![ScriptedOutcome::Fail(ExchangeError::InvalidArguments(
            r#"bitmex {"error":{"message":"Leverage must be between 0.01 and 100","name":"ValidationError"}}"#
                .to_string(),
        ))]);

    harness
        .executor
        .create_order("corr-3".into(), market_buy_with_stop())
        .await;
    drain().await;

    // No order call was issued.
    assert!(harness
        .exchange
        .calls_of(|call| matches!(call, RecordedCall::CreateOrder(_)))
        .is_empty());

    let events = created_orders(captured.take());
    let BusEvent::OrderCreated { orders, errors, .. } = &events[0] else {
        unreachable!()
    };
    assert!(orders.is_none());
    let expected = Some("Leverage must be between 0.01 and 100");
    assert_eq!(errors.main.as_deref(), expected);
    assert_eq!(errors.stop.as_deref(), expected);
    assert!(errors.tsl.is_none());
}

#[tokio::test]
async fn missing_main_order_makes_no_exchange_calls() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCreatedEvent);

    harness
        .executor
        .create_order("corr-4".into(), compound_request(r#"{"orders":{}}"#))
        .await;
    drain().await;

    assert!(harness.exchange.calls().is_empty());
    let events = created_orders(captured.take());
    let BusEvent::OrderCreated { orders, errors, .. } = &events[0] else {
        unreachable!()
    };
    assert!(orders.is_none());
    assert_eq!(errors.main.as_deref(), Some("Missing main order"));
}

#[tokio::test]
async fn quanto_quantity_uses_the_contract_multiplier() {
    let harness = connected_harness().await;

    harness
        .executor
        .create_order(
            "corr-5".into(),
            compound_request(
                r#"{
                    "orders": {
                        "main": {
                            "id": "201",
                            "clOrderId": "eth_one",
                            "symbol": "ETHUSD",
                            "side": "BUY",
                            "orderType": "MARKET",
                            "percent": 50,
                            "leverage": 10
                        }
                    }
                }"#,
            ),
        )
        .await;
    drain().await;

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    // floor(0.5 * 10 / (2000 * 1e-6)) = 2500 contracts.
    assert_eq!(submissions[0].quantity, Some(dec!(2500)));
}

#[tokio::test]
async fn trailing_stop_leg_pegs_to_the_reference_price() {
    let harness = connected_harness().await;

    harness
        .executor
        .create_order(
            "corr-6".into(),
            compound_request(
                r#"{
                    "orders": {
                        "main": {
                            "id": "301",
                            "clOrderId": "tsl_main",
                            "symbol": "XBTUSD",
                            "side": "BUY",
                            "orderType": "MARKET",
                            "percent": 50,
                            "leverage": 10
                        },
                        "tsl": {
                            "id": "302",
                            "clOrderId": "tsl_leg",
                            "symbol": "XBTUSD",
                            "side": "SELL",
                            "orderType": "STOP",
                            "trailingStopPercent": 5,
                            "stopTriggerType": "LAST_PRICE"
                        }
                    }
                }"#,
            ),
        )
        .await;
    drain().await;

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    let tsl = &submissions[1];
    // Reference 50000, sell side factor 0.95 -> 47500, offset -2500.
    assert_eq!(tsl.params.stop_price, Some(dec!(47500.0)));
    assert_eq!(tsl.params.peg_offset_value, Some(dec!(-2500.0)));
    assert_eq!(
        tsl.params.peg_price_type.as_deref(),
        Some("TrailingStopPeg")
    );
    assert_eq!(tsl.params.exec_inst.as_deref(), Some("ReduceOnly,LastPrice"));
}

#[tokio::test]
async fn close_position_flattens_half_a_long() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::PositionClosedEvent);

    let position = serde_json::from_str(
        r#"{"symbol":"XBTUSD","currentQty":2500,"currency":"XBt","leverage":10}"#,
    )
    .unwrap();
    harness.store.save_positions("A", &[position]).await.unwrap();

    harness
        .executor
        .close_position(
            "corr-7".into(),
            compound_request(
                r#"{
                    "orders": {
                        "main": {
                            "id": "401",
                            "clOrderId": "close_it",
                            "symbol": "XBTUSD",
                            "side": "SELL",
                            "orderType": "MARKET",
                            "percent": 50,
                            "leverage": 10
                        }
                    }
                }"#,
            ),
        )
        .await;
    drain().await;

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    let close = &submissions[0];
    assert_eq!(close.quantity, Some(dec!(-1250)));
    assert_eq!(close.side, OrderSide::Sell);
    assert_eq!(close.order_type, OrderType::Market);
    assert_eq!(close.params.exec_inst.as_deref(), Some("Close"));

    let events = captured.take();
    assert!(matches!(
        &events[0],
        BusEvent::PositionClosed { order: Some(_), error: None, .. }
    ));
}

#[tokio::test]
async fn close_position_buys_back_a_short() {
    let harness = connected_harness().await;

    let position =
        serde_json::from_str(r#"{"symbol":"XBTUSD","currentQty":-2500,"currency":"XBt"}"#)
            .unwrap();
    harness.store.save_positions("A", &[position]).await.unwrap();

    harness
        .executor
        .close_position(
            "corr-8".into(),
            compound_request(
                r#"{
                    "orders": {
                        "main": {
                            "id": "402",
                            "clOrderId": "close_short",
                            "symbol": "XBTUSD",
                            "side": "BUY",
                            "orderType": "MARKET",
                            "percent": 50
                        }
                    }
                }"#,
            ),
        )
        .await;
    drain().await;

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    assert_eq!(submissions[0].quantity, Some(dec!(1250)));
    assert_eq!(submissions[0].side, OrderSide::Buy);
}

#[tokio::test]
async fn attach_stop_rounds_the_price_down_to_tick() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::PositionAddedStopEvent);

    let position =
        serde_json::from_str(r#"{"symbol":"XBTUSD","currentQty":100,"currency":"XBt"}"#)
            .unwrap();
    harness.store.save_positions("A", &[position]).await.unwrap();

    harness
        .executor
        .add_stop(
            "corr-9".into(),
            serde_json::from_str(
                r#"{"symbol":"XBTUSD","stopPrice":12345.678,"stopTriggerPriceType":"LAST_PRICE"}"#,
            )
            .unwrap(),
        )
        .await;
    drain().await;

    let submissions: Vec<_> = harness
        .exchange
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::CreateOrder(submission) => Some(submission),
            _ => None,
        })
        .collect();
    let stop = &submissions[0];
    assert_eq!(stop.params.stop_price, Some(dec!(12345.5)));
    assert_eq!(stop.params.exec_inst.as_deref(), Some("Close,LastPrice"));
    assert_eq!(stop.side, OrderSide::Sell);
    assert!(stop.quantity.is_none());

    assert!(matches!(
        &captured.take()[0],
        BusEvent::PositionAddedStop { order: Some(_), error: None, .. }
    ));
}

#[tokio::test]
async fn attach_stop_without_a_position_reports_the_miss() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::PositionAddedStopEvent);

    harness
        .executor
        .add_stop(
            "corr-10".into(),
            serde_json::from_str(
                r#"{"symbol":"XBTUSD","stopPrice":40000,"stopTriggerPriceType":"MARK_PRICE"}"#,
            )
            .unwrap(),
        )
        .await;
    drain().await;

    assert!(harness
        .exchange
        .calls_of(|call| matches!(call, RecordedCall::CreateOrder(_)))
        .is_empty());
    let events = captured.take();
    let BusEvent::PositionAddedStop { error, .. } = &events[0] else {
        unreachable!()
    };
    assert_eq!(error.as_deref(), Some("No position for XBTUSD"));
}

#[tokio::test]
async fn cancel_for_a_different_account_is_refused() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCanceledEvent);

    harness
        .executor
        .cancel_order("corr-11".into(), "B".into(), "ord-1".into())
        .await;
    drain().await;

    assert!(harness
        .exchange
        .calls_of(|call| matches!(call, RecordedCall::CancelOrder(_)))
        .is_empty());
    let events = captured.take();
    let BusEvent::OrderCanceled { error, .. } = &events[0] else {
        unreachable!()
    };
    assert_eq!(error.as_deref(), Some("No matching account"));
}

#[tokio::test]
async fn cancel_round_trips_through_the_exchange() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCanceledEvent);

    harness
        .executor
        .cancel_order("corr-12".into(), "A".into(), "ord-77".into())
        .await;
    drain().await;

    assert_eq!(
        harness
            .exchange
            .calls_of(|call| matches!(call, RecordedCall::CancelOrder(_))),
        vec![RecordedCall::CancelOrder("ord-77".to_string())]
    );
    let events = captured.take();
    let BusEvent::OrderCanceled { order, error, .. } = &events[0] else {
        unreachable!()
    };
    assert!(error.is_none());
    assert_eq!(order.as_ref().unwrap().order_id, "ord-77");
}

#[tokio::test]
async fn create_order_commands_flow_through_the_bus() {
    let harness = connected_harness().await;
    let captured = CapturedEvents::subscribe(&harness.bus, EventKey::OrderCreatedEvent);

    harness.bus.publish(BusEvent::CreateOrderCmd {
        correlation_id: "bus-corr".into(),
        request: market_buy_with_stop(),
    });

    // Bus delivery and the placement itself are async; give the
    // executor a moment.
    for _ in 0..50 {
        drain().await;
        if captured.len() > 0 {
            break;
        }
    }

    let events = created_orders(captured.take());
    assert_eq!(events.len(), 1);
    let BusEvent::OrderCreated { correlation_id, .. } = &events[0] else {
        unreachable!()
    };
    assert_eq!(correlation_id, "bus-corr");
    assert!(harness.accounts.connected().await);
}
