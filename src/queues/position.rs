//! Position command queues and replies.
//!
//! Same dynamic pattern as the order submanager, plus the periodic
//! positions publisher: stream position updates are forwarded to the
//! broker at most once per `POSITION_UPDATE_INTERVAL`.

use std::sync::Arc;
use std::time::Duration;

use lapin::message::Delivery;
use lapin::options::BasicCancelOptions;
use lapin::{Channel, Connection};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{handler, BusEvent, EventBus, EventKey};
use crate::error::{Error, Result};
use crate::models::{AttachStopRequest, AttachTslRequest, CompoundOrderRequest, Position};

use super::order::order_reply;
use super::{
    ack, bind_queue, cleanup_queue, correlation_id_of, create_channel, declare_durable_queue,
    declare_topic_exchange, publish_json, spawn_consumer, start_consumer,
    QUEUE_EXPIRATION_TIME_MS,
};

/// Coalescing window for outbound position updates.
pub const POSITION_UPDATE_INTERVAL: Duration = Duration::from_millis(10_000);

const CLOSE_POSITION_QUEUE_PREFIX: &str = "CloseBitmexPosition:";
const ADD_STOP_QUEUE_PREFIX: &str = "AddStopBitmexPosition:";
const ADD_TSL_QUEUE_PREFIX: &str = "AddTslBitmexPosition:";

const CLOSE_POSITION_CMD_KEY_PREFIX: &str = "bitmex.cmd.position.close.";
const ADD_STOP_CMD_KEY_PREFIX: &str = "bitmex.cmd.position.add_stop.";
const ADD_TSL_CMD_KEY_PREFIX: &str = "bitmex.cmd.position.add_tsl.";

const POSITION_CLOSED_EVENT_KEY: &str = "bitmex.event.position.closed";
const POSITION_ADDED_STOP_EVENT_KEY: &str = "bitmex.event.position.added_stop";
const POSITION_ADDED_TSL_EVENT_KEY: &str = "bitmex.event.position.added_tsl";
const POSITION_UPDATED_EVENT_KEY: &str = "bitmex.event.position.updated";

struct BoundQueues {
    account_id: String,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PositionQueueManager {
    bus: Arc<EventBus>,
    exchange_name: String,
    recv_channel: Channel,
    send_channel: Channel,
    close_consumer_tag: String,
    add_stop_consumer_tag: String,
    add_tsl_consumer_tag: String,
    bound: Mutex<Option<BoundQueues>>,
}

impl PositionQueueManager {
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
            close_consumer_tag: Uuid::new_v4().to_string(),
            add_stop_consumer_tag: Uuid::new_v4().to_string(),
            add_tsl_consumer_tag: Uuid::new_v4().to_string(),
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

    async fn listen_to_position_queues(self: &Arc<Self>, account_id: &str) -> Result<()> {
        self.stop_listening().await;

        let queues = [
            (
                format!("{CLOSE_POSITION_QUEUE_PREFIX}{account_id}"),
                format!("{CLOSE_POSITION_CMD_KEY_PREFIX}{account_id}"),
            ),
            (
                format!("{ADD_STOP_QUEUE_PREFIX}{account_id}"),
                format!("{ADD_STOP_CMD_KEY_PREFIX}{account_id}"),
            ),
            (
                format!("{ADD_TSL_QUEUE_PREFIX}{account_id}"),
                format!("{ADD_TSL_CMD_KEY_PREFIX}{account_id}"),
            ),
        ];
        for (queue, routing_key) in &queues {
            declare_durable_queue(&self.recv_channel, queue, Some(QUEUE_EXPIRATION_TIME_MS))
                .await?;
            bind_queue(&self.recv_channel, queue, &self.exchange_name, routing_key).await?;
        }

        let close_consumer =
            start_consumer(&self.recv_channel, &queues[0].0, &self.close_consumer_tag).await?;
        let manager = Arc::clone(self);
        let close_task = spawn_consumer(close_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_close_position_message(delivery).await }
        });

        let add_stop_consumer = start_consumer(
            &self.recv_channel,
            &queues[1].0,
            &self.add_stop_consumer_tag,
        )
        .await?;
        let manager = Arc::clone(self);
        let add_stop_task = spawn_consumer(add_stop_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_add_stop_message(delivery).await }
        });

        let add_tsl_consumer = start_consumer(
            &self.recv_channel,
            &queues[2].0,
            &self.add_tsl_consumer_tag,
        )
        .await?;
        let manager = Arc::clone(self);
        let add_tsl_task = spawn_consumer(add_tsl_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_add_tsl_message(delivery).await }
        });

        *self.bound.lock() = Some(BoundQueues {
            account_id: account_id.to_string(),
            tasks: vec![close_task, add_stop_task, add_tsl_task],
        });
        info!(account_id, "position queues bound");
        Ok(())
    }

    async fn stop_listening(&self) {
        let Some(bound) = self.bound.lock().take() else {
            return;
        };
        let account_id = bound.account_id;

        for tag in [
            &self.close_consumer_tag,
            &self.add_stop_consumer_tag,
            &self.add_tsl_consumer_tag,
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
            &format!("{CLOSE_POSITION_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{CLOSE_POSITION_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        cleanup_queue(
            &self.recv_channel,
            &format!("{ADD_STOP_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{ADD_STOP_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        cleanup_queue(
            &self.recv_channel,
            &format!("{ADD_TSL_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{ADD_TSL_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        info!(account_id = %account_id, "position queues unbound");
    }

    async fn on_close_position_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match decode_close_position(&delivery.data) {
            Ok(request) => {
                self.bus.publish(BusEvent::PositionCloseCmd {
                    correlation_id,
                    request,
                });
            }
            Err(error) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": refusal_text(&error),
                });
                self.send_reply(POSITION_CLOSED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_add_stop_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match serde_json::from_slice::<AttachStopRequest>(&delivery.data) {
            Ok(request) => {
                self.bus.publish(BusEvent::PositionAddStopCmd {
                    correlation_id,
                    request,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(POSITION_ADDED_STOP_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_add_tsl_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        match serde_json::from_slice::<AttachTslRequest>(&delivery.data) {
            Ok(request) => {
                self.bus.publish(BusEvent::PositionAddTslCmd {
                    correlation_id,
                    request,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(POSITION_ADDED_TSL_EVENT_KEY, &reply, &correlation_id)
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
                        manager.listen_to_position_queues(&account_id).await?;
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

        // Outbound position snapshots, coalesced.
        let manager = Arc::clone(self);
        self.bus.register_rate_limited(
            EventKey::PositionsUpdatedEvent,
            POSITION_UPDATE_INTERVAL,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::PositionsUpdated {
                        account_id,
                        positions,
                    } = event
                    else {
                        return Ok(());
                    };
                    let payload = positions_payload(&account_id, &positions);
                    if let Err(error) = publish_json(
                        &manager.send_channel,
                        &manager.exchange_name,
                        POSITION_UPDATED_EVENT_KEY,
                        &payload,
                        None,
                        None,
                    )
                    .await
                    {
                        warn!(%error, "position update publish failed");
                    }
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::PositionClosedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::PositionClosed {
                        correlation_id,
                        order,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    let reply = action_reply(&order, &error);
                    manager
                        .send_reply(POSITION_CLOSED_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::PositionAddedStopEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::PositionAddedStop {
                        correlation_id,
                        order,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    let reply = action_reply(&order, &error);
                    manager
                        .send_reply(POSITION_ADDED_STOP_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::PositionAddedTslEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::PositionAddedTsl {
                        correlation_id,
                        order,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    let reply = action_reply(&order, &error);
                    manager
                        .send_reply(POSITION_ADDED_TSL_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );
    }
}

fn refusal_text(error: &Error) -> &'static str {
    match error {
        Error::InvalidMessage(_) => "Invalid Message",
        _ => "Unknown Error",
    }
}

fn decode_close_position(body: &[u8]) -> Result<CompoundOrderRequest> {
    let request: CompoundOrderRequest = serde_json::from_slice(body)
        .map_err(|error| Error::InvalidMessage(format!("close position: {error}")))?;
    match &request.orders.main {
        Some(main) if !main.id.is_empty() => Ok(request),
        _ => Err(Error::WrongOrder { order_id: None }),
    }
}

fn positions_payload(account_id: &str, positions: &[Position]) -> serde_json::Value {
    serde_json::json!({
        "positions": positions,
        "accountId": account_id,
        "exchange": "BITMEX",
        "success": true,
        "error": serde_json::Value::Null,
    })
}

fn action_reply(
    order: &Option<crate::models::Trade>,
    error: &Option<String>,
) -> serde_json::Value {
    let mut reply = serde_json::json!({ "success": error.is_none() });
    if let Some(error) = error {
        reply["error"] = serde_json::Value::from(error.clone());
    }
    if let Some(order) = order {
        reply["order"] = order_reply(order);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_follow_the_account_id() {
        assert_eq!(
            format!("{CLOSE_POSITION_CMD_KEY_PREFIX}A1"),
            "bitmex.cmd.position.close.A1"
        );
        assert_eq!(
            format!("{ADD_STOP_CMD_KEY_PREFIX}A1"),
            "bitmex.cmd.position.add_stop.A1"
        );
        assert_eq!(
            format!("{ADD_TSL_CMD_KEY_PREFIX}A1"),
            "bitmex.cmd.position.add_tsl.A1"
        );
    }

    #[test]
    fn positions_payload_names_the_exchange() {
        let position: Position =
            serde_json::from_str(r#"{"symbol":"XBTUSD","currentQty":100}"#).unwrap();
        let payload = positions_payload("A", &[position]);
        assert_eq!(payload["exchange"], "BITMEX");
        assert_eq!(payload["accountId"], "A");
        assert_eq!(payload["success"], true);
        assert_eq!(payload["positions"][0]["symbol"], "XBTUSD");
    }

    #[test]
    fn close_position_requires_a_main_order() {
        assert!(decode_close_position(br#"{"orders":{}}"#).is_err());
        assert!(decode_close_position(
            br#"{"orders":{"main":{"id":"1","symbol":"XBTUSD","side":"SELL","orderType":"MARKET","percent":100}}}"#
        )
        .is_ok());
    }
}
