//! Account command queues and replies.
//!
//! One static durable queue receives create commands. Once an account
//! binds, the create consumer is cancelled and per-account update and
//! delete queues (with broker-side idle expiry) take its place; a
//! delete reverses the swap.

use std::sync::Arc;

use lapin::message::Delivery;
use lapin::options::{BasicCancelOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::account::AccountManager;
use crate::bus::{handler, AccountCommand, BusEvent, EventBus, EventKey};
use crate::error::{Error, Result};

use super::{
    ack, bind_queue, cleanup_queue, correlation_id_of, create_channel, declare_durable_queue,
    declare_topic_exchange, publish_json, spawn_consumer, start_consumer, timestamp_of,
    MESSAGE_EXPIRATION_SECONDS, QUEUE_EXPIRATION_TIME_MS,
};

const CREATE_ACCOUNT_QUEUE: &str = "CreateBitmexAccount";
const UPDATE_ACCOUNT_QUEUE_PREFIX: &str = "UpdateBitmexAccount:";
const DELETE_ACCOUNT_QUEUE_PREFIX: &str = "DeleteBitmexAccount:";

const CREATE_ACCOUNT_CMD_KEY: &str = "bitmex.cmd.account.create";
const UPDATE_ACCOUNT_CMD_KEY_PREFIX: &str = "bitmex.cmd.account.update.";
const DELETE_ACCOUNT_CMD_KEY_PREFIX: &str = "bitmex.cmd.account.delete.";

const ACCOUNT_CREATED_EVENT_KEY: &str = "bitmex.event.account.created";
const ACCOUNT_UPDATED_EVENT_KEY: &str = "bitmex.event.account.updated";
const ACCOUNT_DELETED_EVENT_KEY: &str = "bitmex.event.account.deleted";
const ACCOUNT_HEARTBEAT_EVENT_KEY: &str = "bitmex.event.account.heartbeat";

struct BoundQueues {
    account_id: String,
    tasks: Vec<JoinHandle<()>>,
}

pub struct AccountQueueManager {
    bus: Arc<EventBus>,
    accounts: Arc<AccountManager>,
    exchange_name: String,
    recv_channel: Channel,
    send_channel: Channel,
    create_consumer_tag: String,
    update_consumer_tag: String,
    delete_consumer_tag: String,
    create_task: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<Option<BoundQueues>>,
}

impl AccountQueueManager {
    pub async fn start(
        bus: Arc<EventBus>,
        accounts: Arc<AccountManager>,
        recv_connection: &Connection,
        send_connection: &Connection,
        exchange_name: &str,
    ) -> Result<Arc<Self>> {
        let recv_channel = create_channel(recv_connection, true).await?;
        let send_channel = create_channel(send_connection, false).await?;
        declare_topic_exchange(&recv_channel, exchange_name).await?;
        declare_topic_exchange(&send_channel, exchange_name).await?;
        declare_durable_queue(&recv_channel, CREATE_ACCOUNT_QUEUE, None).await?;

        let manager = Arc::new(Self {
            bus,
            accounts,
            exchange_name: exchange_name.to_string(),
            recv_channel,
            send_channel,
            create_consumer_tag: Uuid::new_v4().to_string(),
            update_consumer_tag: Uuid::new_v4().to_string(),
            delete_consumer_tag: Uuid::new_v4().to_string(),
            create_task: Mutex::new(None),
            bound: Mutex::new(None),
        });
        manager.listen_to_create_queue().await?;
        manager.register_listeners();
        Ok(manager)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(task) = self.create_task.lock().take() {
            task.abort();
        }
        if let Some(bound) = self.bound.lock().take() {
            for task in bound.tasks {
                task.abort();
            }
        }
        if self.recv_channel.status().connected() {
            self.recv_channel.close(200, "shutdown").await?;
        }
        if self.send_channel.status().connected() {
            self.send_channel.close(200, "shutdown").await?;
        }
        Ok(())
    }

    async fn listen_to_create_queue(self: &Arc<Self>) -> Result<()> {
        bind_queue(
            &self.recv_channel,
            CREATE_ACCOUNT_QUEUE,
            &self.exchange_name,
            CREATE_ACCOUNT_CMD_KEY,
        )
        .await?;

        let consumer = start_consumer(
            &self.recv_channel,
            CREATE_ACCOUNT_QUEUE,
            &self.create_consumer_tag,
        )
        .await?;
        let manager = Arc::clone(self);
        let task = spawn_consumer(consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_create_message(delivery).await }
        });
        *self.create_task.lock() = Some(task);
        Ok(())
    }

    /// The create consumer steps aside while an account is bound.
    async fn on_account_bound(self: &Arc<Self>, account_id: &str) -> Result<()> {
        if let Err(error) = self
            .recv_channel
            .queue_unbind(
                CREATE_ACCOUNT_QUEUE,
                &self.exchange_name,
                CREATE_ACCOUNT_CMD_KEY,
                FieldTable::default(),
            )
            .await
        {
            warn!(%error, "create queue unbind failed");
        }
        self.recv_channel
            .basic_cancel(&self.create_consumer_tag, BasicCancelOptions::default())
            .await?;
        if let Some(task) = self.create_task.lock().take() {
            task.abort();
        }

        let update_queue = format!("{UPDATE_ACCOUNT_QUEUE_PREFIX}{account_id}");
        let delete_queue = format!("{DELETE_ACCOUNT_QUEUE_PREFIX}{account_id}");
        declare_durable_queue(
            &self.recv_channel,
            &update_queue,
            Some(QUEUE_EXPIRATION_TIME_MS),
        )
        .await?;
        declare_durable_queue(
            &self.recv_channel,
            &delete_queue,
            Some(QUEUE_EXPIRATION_TIME_MS),
        )
        .await?;
        bind_queue(
            &self.recv_channel,
            &update_queue,
            &self.exchange_name,
            &format!("{UPDATE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
        )
        .await?;
        bind_queue(
            &self.recv_channel,
            &delete_queue,
            &self.exchange_name,
            &format!("{DELETE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
        )
        .await?;

        let update_consumer =
            start_consumer(&self.recv_channel, &update_queue, &self.update_consumer_tag).await?;
        let manager = Arc::clone(self);
        let update_task = spawn_consumer(update_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_update_message(delivery).await }
        });

        let delete_consumer =
            start_consumer(&self.recv_channel, &delete_queue, &self.delete_consumer_tag).await?;
        let manager = Arc::clone(self);
        let delete_task = spawn_consumer(delete_consumer, move |delivery| {
            let manager = Arc::clone(&manager);
            async move { manager.on_delete_message(delivery).await }
        });

        *self.bound.lock() = Some(BoundQueues {
            account_id: account_id.to_string(),
            tasks: vec![update_task, delete_task],
        });
        info!(account_id, "account queues bound");
        Ok(())
    }

    /// Reverse of [`Self::on_account_bound`].
    async fn on_account_unbound(self: &Arc<Self>) -> Result<()> {
        let Some(bound) = self.bound.lock().take() else {
            return Ok(());
        };
        let account_id = bound.account_id;

        for tag in [&self.update_consumer_tag, &self.delete_consumer_tag] {
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
            &format!("{UPDATE_ACCOUNT_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{UPDATE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;
        cleanup_queue(
            &self.recv_channel,
            &format!("{DELETE_ACCOUNT_QUEUE_PREFIX}{account_id}"),
            &self.exchange_name,
            &format!("{DELETE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
        )
        .await;

        self.listen_to_create_queue().await?;
        info!(account_id = %account_id, "account queues unbound");
        Ok(())
    }

    async fn on_create_message(self: &Arc<Self>, delivery: Delivery) {
        // Another account is already bound here; leave the command for
        // a free node.
        if self.accounts.connected().await {
            let _ = delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await;
            return;
        }

        let correlation_id = correlation_id_of(&delivery);
        let timestamp = timestamp_of(&delivery);
        match decode_account_command(&delivery.data) {
            Ok(command) => {
                self.bus.publish(BusEvent::CreateAccountCmd {
                    correlation_id,
                    command,
                    timestamp,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(ACCOUNT_CREATED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_update_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        let timestamp = timestamp_of(&delivery);
        match decode_account_command(&delivery.data) {
            Ok(command) => {
                self.bus.publish(BusEvent::UpdateAccountCmd {
                    correlation_id,
                    command,
                    timestamp,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(ACCOUNT_UPDATED_EVENT_KEY, &reply, &correlation_id)
                    .await;
            }
        }
        ack(&delivery).await;
    }

    async fn on_delete_message(self: &Arc<Self>, delivery: Delivery) {
        let correlation_id = correlation_id_of(&delivery);
        let timestamp = timestamp_of(&delivery);
        match decode_delete_command(&delivery.data) {
            Ok(account_id) => {
                self.bus.publish(BusEvent::DeleteAccountCmd {
                    correlation_id,
                    account_id,
                    timestamp,
                });
            }
            Err(_) => {
                let reply = serde_json::json!({
                    "success": false,
                    "error": "Invalid Message",
                });
                self.send_reply(ACCOUNT_DELETED_EVENT_KEY, &reply, &correlation_id)
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

    /// Bus listeners: translate lifecycle results into broker replies
    /// and drive the queue rebinding.
    fn register_listeners(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::AccountCreatedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::AccountCreated {
                        correlation_id,
                        account_id,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    if error.is_none() {
                        if let Some(account_id) = account_id.as_deref() {
                            manager.on_account_bound(account_id).await?;
                        }
                    }
                    let reply = account_reply(&account_id, &error);
                    manager
                        .send_reply(ACCOUNT_CREATED_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::AccountUpdatedEvent,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::AccountUpdated {
                        correlation_id,
                        account_id,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    let reply = account_reply(&account_id, &error);
                    manager
                        .send_reply(ACCOUNT_UPDATED_EVENT_KEY, &reply, &correlation_id)
                        .await;
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
                    let BusEvent::AccountDeleted {
                        correlation_id,
                        account_id,
                        error,
                    } = event
                    else {
                        return Ok(());
                    };
                    if error.is_none() && account_id.is_some() {
                        manager.on_account_unbound().await?;
                    }
                    let reply = account_reply(&account_id, &error);
                    manager
                        .send_reply(ACCOUNT_DELETED_EVENT_KEY, &reply, &correlation_id)
                        .await;
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::AccountHeartbeat,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::AccountHeartbeat { account_id } = event else {
                        return Ok(());
                    };
                    let payload = serde_json::json!({ "accountId": account_id });
                    if let Err(error) = publish_json(
                        &manager.send_channel,
                        &manager.exchange_name,
                        ACCOUNT_HEARTBEAT_EVENT_KEY,
                        &payload,
                        None,
                        Some(MESSAGE_EXPIRATION_SECONDS * 1000),
                    )
                    .await
                    {
                        warn!(%error, "heartbeat publish failed");
                    }
                    Ok(())
                }
            }),
        );
    }
}

fn decode_account_command(body: &[u8]) -> Result<AccountCommand> {
    serde_json::from_slice(body)
        .map_err(|error| Error::InvalidMessage(format!("account command: {error}")))
}

fn decode_delete_command(body: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|error| Error::InvalidMessage(format!("delete command: {error}")))?;
    value
        .get("accountId")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidMessage("delete command: missing accountId".into()))
}

/// `{success, error?, accountId?}`.
fn account_reply(
    account_id: &Option<String>,
    error: &Option<String>,
) -> serde_json::Value {
    let mut reply = serde_json::json!({ "success": error.is_none() });
    if let Some(error) = error {
        reply["error"] = serde_json::Value::from(error.clone());
    }
    if let Some(account_id) = account_id {
        reply["accountId"] = serde_json::Value::from(account_id.clone());
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_follow_the_account_id() {
        let account_id = "A1";
        assert_eq!(
            format!("{UPDATE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
            "bitmex.cmd.account.update.A1"
        );
        assert_eq!(
            format!("{DELETE_ACCOUNT_CMD_KEY_PREFIX}{account_id}"),
            "bitmex.cmd.account.delete.A1"
        );
        assert_eq!(
            format!("{UPDATE_ACCOUNT_QUEUE_PREFIX}{account_id}"),
            "UpdateBitmexAccount:A1"
        );
    }

    #[test]
    fn account_replies_carry_success_error_and_id() {
        let ok = account_reply(&Some("A".into()), &None);
        assert_eq!(ok["success"], true);
        assert_eq!(ok["accountId"], "A");
        assert!(ok.get("error").is_none());

        let failed = account_reply(&Some("A".into()), &Some("Invalid API Keys".into()));
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "Invalid API Keys");

        let stale = account_reply(&None, &None);
        assert_eq!(stale["success"], true);
        assert!(stale.get("accountId").is_none());
    }

    #[test]
    fn decoders_reject_malformed_bodies() {
        assert!(decode_account_command(b"not json").is_err());
        assert!(decode_account_command(br#"{"accountId":"A"}"#).is_err());
        assert!(decode_account_command(
            br#"{"accountId":"A","apiKey":"k","apiSecret":"s"}"#
        )
        .is_ok());

        assert!(decode_delete_command(br#"{"accountId":"A"}"#).is_ok());
        assert!(decode_delete_command(br#"{}"#).is_err());
    }
}
