//! Order command queues and replies.
//!
//! Dynamic: the three per-account queues exist only while an account
//! is bound. Inbound commands become bus events tagged with the AMQP
//! correlation id; when the matching result event fires, the reply is
//! published with the same correlation id.

use std::sync::Arc;

use lapin::message::Delivery;
use lapin::options::BasicCancelOptions;
use lapin::{Channel, Connection};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{handler, BusEvent, CompoundEchoes, EventBus, EventKey, LegErrors};
use crate::error::{Error, Result};
use crate::models::{demangle_client_order_id, CompoundOrderRequest, Trade};

use super::{
    ack, bind_queue, cleanup_queue, correlation_id_of, create_channel, declare_durable_queue,
    declare_topic_exchange, decimal_json, publish_json, spawn_consumer, start_consumer,
    QUEUE_EXPIRATION_TIME_MS,
};

const CREATE_ORDER_QUEUE_PREFIX: &str = "CreateBitmexOrder:";
const UPDATE_ORDER_QUEUE_PREFIX: &str = "UpdateBitmexOrder:";
const CANCEL_ORDER_QUEUE_PREFIX: &str = "DeleteBitmexOrder:";

const CREATE_ORDER_CMD_KEY_PREFIX: &str = "bitmex.cmd.order.create.";
const UPDATE_ORDER_CMD_KEY_PREFIX: &str = "bitmex.cmd.order.update.";
const CANCEL_ORDER_CMD_KEY_PREFIX: &str = "bitmex.cmd.order.cancel.";

const ORDER_CREATED_EVENT_KEY: &str = "bitmex.event.order.created";
const ORDER_UPDATED_EVENT_KEY: &str = "bitmex.event.order.updated";
const ORDER_CANCELED_EVENT_KEY: &str = "bitmex.event.order.canceled";

struct BoundQueues {
    account_id: String,
    tasks: Vec<JoinHandle<()>>,
}

pub struct OrderQueueManager {
    bus: Arc<EventBus>,
    exchange_name: String,
    recv_channel: Channel,
    send_channel: Channel,
    create_consumer_tag: String,
    update_consumer_tag: String,
    cancel_consumer_tag: String,
    bound: Mutex<Option<BoundQueues>>,
}

impl OrderQueueManager {
    pub async fn start(
        bus: Arc<EventBus>,
        recv_connection: &Connection,
        send_connection: &Connection,
        exchange_name: &str,
    ) -> Result<Arc<Self>> {
        let recv_channel = create_channel(recv_connection, true).await?;
        let send_channel = create_channel(send_connection, false).await?;
        declare_topic_exchange(&recv_channel, exchange_name).await?;
        declare_topic_exchange(&send_channel, exchange_name).await?;
        // No queues yet: they follow the account lifecycle.

        let manager = Arc::new(Self {
            bus,
            exchange_name: exchange_name.to_string(),
            recv_channel,
            send_channel,
            create_consumer_tag: Uuid::new_v4().to_string(),
            update_consumer_tag: Uuid::new_v4().to_string(),
            cancel_consumer_tag: Uuid::new_v4().to_string(),
            bound: Mutex::new(None),
        });
        manager.register_listeners();
        Ok(manager)
    }

    pub async fn stop(&self) -> Result<()> {
        self.stop_listening().await;
        if self.recv_channel.status().connected() {
            self.recv_channel.close(200, "shutdown").await?;
        }
        if self.send_channel.status().connected() {
            self.send_channel.close(200, "shutdown").await?;
        }
        Ok(())
    }

    async fn listen_to_order_queues(self: &Arc<Self>, account_id: &str) -> Result<()> {
        self.stop_listening().await;

        let queues = [
            (
                format!("{CREATE_ORDER_QUEUE_PREFIX}{account_id}"),
                format!("{CREATE_ORDER_CMD_KEY_PREFIX}{account_id}"),
            ),
            (
                format!("{UPDATE_ORDER_QUEUE_PREFIX}{account_id}"),
                format!("{UPDATE_ORDER_CMD_KEY_PREFIX}{account_id}"),
            ),
            (
                format!("{CANCEL_ORDER_QUEUE_PREFIX}{account_id}"),
                format!("{CANCEL_ORDER_CMD_KEY_PREFIX}{account_id}"),
            ),
        ];
        for (queue, routing_key) in &queues {
            declare_durable_queue(&self.recv_channel, queue, Some(QUEUE_EXPIRATION_TIME_MS))
                .await?;
            bind_queue(&self.recv_channel, queue, &self.exchange_name, routing_key).await?;
        }

        let create_consumer =
            start_consumer(&self.recv_channel, &queues[0].0, &self.create_consumer_tag).await?;
        let manager = Arc::clone(self);
        let create_task = spawn_consumer(create_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_create_order_message(delivery).await }
        });

        let update_consumer =
            start_consumer(&self.recv_channel, &queues[1].0, &self.update_consumer_tag).await?;
        let manager = Arc::clone(self);
        let update_task = spawn_consumer(update_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_update_order_message(delivery).await }
        });

        let cancel_consumer =
            start_consumer(&self.recv_channel, &queues[2].0, &self.cancel_consumer_tag).await?;
        let manager = Arc::clone(self);
        let cancel_task = spawn_consumer(cancel_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_cancel_order_message(delivery).await }
        });

        *self.bound.lock() = Some(BoundQueues {
            account_id: account_id.to_string(),
            tasks: vec![create_task, update_task, cancel_task],
        });
        info!(account_id, "order queues bound");
        Ok(())
    }

    async fn stop_listening(&self) {
        let Some(bound) = self.bound.lock().take() else {
            return;
        };
        let account_id = bound.account_id;

        for tag in [
            &self.create_consumer_tag,
            &self.update_consumer_tag,
            &self.cancel_consumer_tag,
        ] {
            if let Err(error) = self
                .recv_channel
                .basic_cancel(tag, BasicCancelOptions::default())
                .await
            {
                warn!(%error, "consumer cancel failed");
            }
        }
        for task in bound.tasks {
            task.abort();
        }

        cleanup_queue(
            &self.recv_channel,
            &format!("{CREATE_ORDER_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{CREATE_ORDER_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        cleanup_queue(
            &self.recv_channel,
            &format!("{UPDATE_ORDER_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{UPDATE_ORDER_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        cleanup_queue(
            &self.recv_channel,
            &format!("{CANCEL_ORDER_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{CANCEL_ORDER_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        info!(account_id = %account_id, "order queues unbound");
    }

    async fn on_create_order_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match decode_create_order(&delivery.data) {
            Ok(request) => {
                self.bus.publish(BusEvent::CreateOrderCmd {
                    correlation_id,
                    request,
                });
            }
            Err(error) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": refusal_text(&error),
                });
                self.send_reply(ORDER_CREATED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_update_order_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match serde_json::from_slice::<serde_json::Value>(&delivery.data) {
            Ok(payload) => {
                self.bus.publish(BusEvent::UpdateOrderCmd {
                    correlation_id,
                    payload,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(ORDER_UPDATED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_cancel_order_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match decode_cancel_order(&delivery.data) {
            Ok((account_id, order_id)) => {
                self.bus.publish(BusEvent::CancelOrderCmd {
                    correlation_id,
                    account_id,
                    order_id,
                });
            }
            Err(error) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": refusal_text(&error),
                });
                self.send_reply(ORDER_CANCELED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn send_reply(
        &self,
        routing_key: &str,
        payload: &serde_json::Value,
        correlation_id: &str,
    ) {
        let correlation = (!correlation_id.is_empty()).then_some(correlation_id);
        if let Err(error) = publish_json(
            &self.send_channel,
            &self.exchange_name,
            routing_key,
            payload,
            correlation,
            None,
        )
        .await
        {
            warn!(routing_key, %error, "reply publish failed");
        }
    }

    fn register_listeners(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::AccountCreatedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    if let BusEvent::AccountCreated {
                        account_id: Some(account_id),
                        error: None,
                        ..
                    } = event
                    {
                        manager.listen_to_order_queues(&account_id).await?;
                    }
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::AccountDeletedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    if let BusEvent::AccountDeleted {
                        account_id: Some(_),
                        error: None,
                        ..
                    } = event
                    {
                        manager.stop_listening().await;
                    }
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::OrderCreatedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::OrderCreated {
                        correlation_id,
                        orders,
                        errors,
                    } = event
                    else {
                        return Ok(());
                    };
                    let reply = compound_order_reply(&orders, &errors);
                    manager
                        .send_reply(ORDER_CREATED_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::OrderUpdatedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::OrderUpdated { trade, .. } = event else {
                        return Ok(());
                    };
                    // Echoes without a client order id are not ours.
                    if trade
                        .client_order_id
                        .as_deref()
                        .map_or(true, str::is_empty)
                    {
                        return Ok(());
                    }
                    let reply = serde_json::json!({ "order": order_reply(&trade) });
                    manager
                        .send_reply(ORDER_UPDATED_EVENT_KEY, &reply, "")
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::OrderCanceledEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::OrderCanceled {
                        correlation_id,
                        order,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    let mut reply = serde_json::json!({ "success": error.is_none() });
                    if let Some(error) = error {
                        reply["error"] = serde_json::Value::from(error);
                    }
                    if let Some(order) = order {
                        reply["orderId"] = serde_json::Value::from(order.order_id.clone());
                        reply["order"] = order_reply(&order);
                    }
                    manager
                        .send_reply(ORDER_CANCELED_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );
    }
}

fn refusal_text(error: &Error) -> &'static str {
    match error {
        Error::WrongOrder { .. } => "Bad Order ID",
        _ => "Invalid Message",
    }
}

fn decode_create_order(body: &[u8]) -> Result<CompoundOrderRequest> {
    let request: CompoundOrderRequest = serde_json::from_slice(body)
        .map_err(|error| Error::InvalidMessage(format!("create order: {error}")))?;
    match &request.orders.main {
        Some(main) if !main.id.is_empty() => Ok(request),
        _ => Err(Error::WrongOrder { order_id: None }),
    }
}

fn decode_cancel_order(body: &[u8]) -> Result<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|error| Error::InvalidMessage(format!("cancel order: {error}")))?;
    let account_id = value
        .get("accountId")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let order_id = value
        .get("orderId")
        .or_else(|| value.get("clOrderId"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if account_id.is_empty() || order_id.is_empty() {
        return Err(Error::WrongOrder { order_id: None });
    }
    Ok((account_id.to_string(), order_id.to_string()))
}

/// Project an exchange echo to the reply shape callers expect. An
/// echo without a clOrdID projects to an empty object.
pub(crate) fn order_reply(trade: &Trade) -> serde_json::Value {
    let Some(client_order_id) = trade.client_order_id.as_deref().filter(|id| !id.is_empty())
    else {
        return serde_json::json!({});
    };
    serde_json::json!({
        "orderId": trade.order_id,
        "status": trade.status,
        "clOrderId": demangle_client_order_id(client_order_id),
        "clOrderLinkId": trade.client_order_link_id,
        "orderQty": decimal_json(trade.order_quantity),
        "filledQty": decimal_json(trade.filled()),
        "price": decimal_json(trade.price),
        "avgPrice": decimal_json(trade.avg_price),
        "stopPrice": decimal_json(trade.stop_price),
        "pegOffsetValue": decimal_json(trade.peg_offset_value),
        "timestamp": trade.timestamp,
    })
}

fn compound_order_reply(
    orders: &Option<CompoundEchoes>,
    errors: &LegErrors,
) -> serde_json::Value {
    let orders_json = orders.as_ref().map(|echoes| {
        let mut orders = serde_json::Map::new();
        if let Some(main) = &echoes.main {
            orders.insert("main".to_string(), order_reply(main));
        }
        if let Some(stop) = &echoes.stop {
            orders.insert("stop".to_string(), order_reply(stop));
        }
        if let Some(tsl) = &echoes.tsl {
            orders.insert("tsl".to_string(), order_reply(tsl));
        }
        serde_json::Value::Object(orders)
    });

    serde_json::json!({
        "orders": orders_json,
        "success": errors.is_empty(),
        "errors": if errors.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::to_value(errors).unwrap_or(serde_json::Value::Null)
        },
    })
}
