//! The account lifecycle: DISCONNECTED <-> CONNECTED.
//!
//! At most one exchange account is bound per process. Binding
//! replaces any prior session: the client is built, the REST
//! snapshots are replayed onto the bus, the five stream loops and the
//! heartbeat are spawned. Unbinding flips the watching flag, cancels
//! the heartbeat, and closes the client; loops drain themselves at
//! their next iteration boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{handler, BusEvent, EventBus, EventKey};
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{ConnectExchange, Credentials, ExchangeClient};
use crate::stream::StreamRouter;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Orders snapshot depth at bind time.
const ORDER_SNAPSHOT_LIMIT: u32 = 500;

/// The single account this node serves while CONNECTED.
#[derive(Debug, Clone)]
pub struct AccountBinding {
    pub account_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub start_time: DateTime<Utc>,
}

struct ConnectedAccount {
    binding: AccountBinding,
    client: Arc<dyn ExchangeClient>,
    stream_tasks: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
}

/// A cheap handle onto the live session for the orchestrator.
#[derive(Clone)]
pub struct Session {
    pub account_id: String,
    pub client: Arc<dyn ExchangeClient>,
}

pub struct AccountManager {
    bus: Arc<EventBus>,
    connector: Arc<dyn ConnectExchange>,
    router: Arc<StreamRouter>,
    sandbox: bool,
    state: Mutex<Option<ConnectedAccount>>,
}

impl AccountManager {
    pub fn new(
        bus: Arc<EventBus>,
        connector: Arc<dyn ConnectExchange>,
        router: Arc<StreamRouter>,
        sandbox: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            connector,
            router,
            sandbox,
            state: Mutex::new(None),
        })
    }

    pub async fn connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn account_id(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|account| account.binding.account_id.clone())
    }

    pub async fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|account| account.binding.start_time)
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.as_ref().map(|account| Session {
            account_id: account.binding.account_id.clone(),
            client: Arc::clone(&account.client),
        })
    }

    /// Bind an account, replacing any existing binding.
    pub async fn connect(
        &self,
        account_id: &str,
        api_key: &str,
        api_secret: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.disconnect().await;

        if api_key.is_empty() || api_secret.is_empty() {
            return Err(Error::InvalidApiKeys {
                account_id: account_id.to_string(),
            });
        }

        let credentials = Credentials {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        };
        let client = self
            .connector
            .connect(&credentials, self.sandbox)
            .await
            .map_err(|error| auth_failure(error, account_id))?;

        if let Err(error) = self.replay_snapshots(account_id, &client).await {
            let _ = client.close().await;
            return Err(auth_failure(error, account_id));
        }

        let stream_tasks = self
            .router
            .start(account_id.to_string(), Arc::clone(&client));
        let heartbeat = spawn_heartbeat(Arc::clone(&self.bus), account_id.to_string());

        let binding = AccountBinding {
            account_id: account_id.to_string(),
            api_key: credentials.api_key,
            api_secret: credentials.api_secret,
            start_time: timestamp.unwrap_or_else(Utc::now),
        };
        info!(account_id, sandbox = self.sandbox, "account connected");

        *self.state.lock().await = Some(ConnectedAccount {
            binding,
            client,
            stream_tasks,
            heartbeat,
        });
        Ok(())
    }

    /// Service an update: same account, fresh credentials.
    pub async fn update(
        &self,
        account_id: &str,
        api_key: &str,
        api_secret: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let bound = self.account_id().await;
        if bound.as_deref() != Some(account_id) {
            return Err(Error::WrongAccount {
                account_id: account_id.to_string(),
            });
        }
        self.connect(account_id, api_key, api_secret, timestamp).await
    }

    /// Service a delete. Returns `Ok(true)` when the account was
    /// unbound and `Ok(false)` for a stale delete (older than the
    /// binding), which is ignored.
    pub async fn delete(
        &self,
        account_id: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let bound = self.account_id().await;
        if bound.as_deref() != Some(account_id) {
            return Err(Error::WrongAccount {
                account_id: account_id.to_string(),
            });
        }

        match (self.start_time().await, timestamp) {
            (Some(started_at), Some(requested_at)) if started_at > requested_at => {
                // The binding is newer than this delete; drop it.
                info!(account_id, "ignoring stale delete");
                return Ok(false);
            }
            (Some(_), None) => return Ok(false),
            _ => {}
        }

        self.disconnect().await;
        info!(account_id, "account deleted");
        Ok(true)
    }

    /// Tear down the current session, if any. Idempotent.
    pub async fn disconnect(&self) {
        let Some(account) = self.state.lock().await.take() else {
            return;
        };

        self.router.stop();
        account.heartbeat.abort();
        if let Err(error) = account.client.close().await {
            warn!(%error, "exchange client close failed");
        }
        // Stream loops observe the cleared flag at their next
        // iteration; closing the client unblocks any in-flight await.
        for task in account.stream_tasks {
            task.abort();
        }
        info!(account_id = %account.binding.account_id, "account disconnected");
    }

    /// The three REST snapshots at bind time: margins, positions, and
    /// recent orders (newest first), each replayed as a stream event,
    /// plus one order-updated event per historical order.
    async fn replay_snapshots(
        &self,
        account_id: &str,
        client: &Arc<dyn ExchangeClient>,
    ) -> Result<()> {
        let margins = client.fetch_margins().await?;
        let positions = client.fetch_positions().await?;
        let orders = client.fetch_orders(ORDER_SNAPSHOT_LIMIT, true).await?;

        self.bus.publish(BusEvent::MarginsUpdated {
            account_id: account_id.to_string(),
            margins,
        });
        self.bus.publish(BusEvent::PositionsUpdated {
            account_id: account_id.to_string(),
            positions,
        });
        if !orders.is_empty() {
            self.bus.publish(BusEvent::MyTradesUpdated {
                account_id: account_id.to_string(),
                trades: orders.clone(),
            });
        }
        for trade in orders {
            self.bus.publish(BusEvent::OrderUpdated {
                account_id: account_id.to_string(),
                trade,
            });
        }
        Ok(())
    }

    /// Wire the account command keys to the lifecycle.
    pub fn register_listeners(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::CreateAccountCmd,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::CreateAccountCmd {
                        correlation_id,
                        command,
                        timestamp,
                    } = event
                    else {
                        return Ok(());
                    };
                    let result = manager
                        .connect(
                            &command.account_id,
                            &command.api_key,
                            &command.api_secret,
                            timestamp,
                        )
                        .await;
                    manager.bus.publish(BusEvent::AccountCreated {
                        correlation_id,
                        account_id: Some(command.account_id),
                        error: result.err().map(|error| reply_error(&error)),
                    });
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::UpdateAccountCmd,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::UpdateAccountCmd {
                        correlation_id,
                        command,
                        timestamp,
                    } = event
                    else {
                        return Ok(());
                    };
                    let result = manager
                        .update(
                            &command.account_id,
                            &command.api_key,
                            &command.api_secret,
                            timestamp,
                        )
                        .await;
                    manager.bus.publish(BusEvent::AccountUpdated {
                        correlation_id,
                        account_id: Some(command.account_id),
                        error: result.err().map(|error| reply_error(&error)),
                    });
                    Ok(())
                }
            }),
        );

        let manager = Arc::clone(self);
        self.bus.register(
            EventKey::DeleteAccountCmd,
            handler(move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    let BusEvent::DeleteAccountCmd {
                        correlation_id,
                        account_id,
                        timestamp,
                    } = event
                    else {
                        return Ok(());
                    };
                    let event = match manager.delete(&account_id, timestamp).await {
                        Ok(true) => BusEvent::AccountDeleted {
                            correlation_id,
                            account_id: Some(account_id),
                            error: None,
                        },
                        // Stale deletes acknowledge without naming the
                        // account, so nothing downstream unbinds.
                        Ok(false) => BusEvent::AccountDeleted {
                            correlation_id,
                            account_id: None,
                            error: None,
                        },
                        Err(error) => BusEvent::AccountDeleted {
                            correlation_id,
                            account_id: Some(account_id),
                            error: Some(reply_error(&error)),
                        },
                    };
                    manager.bus.publish(event);
                    Ok(())
                }
            }),
        );
    }
}

/// Map connection-phase failures: authentication problems become
/// InvalidApiKeys carrying the account id, everything else passes
/// through.
fn auth_failure(error: Error, account_id: &str) -> Error {
    match error {
        Error::Exchange(ExchangeError::Authentication(_))
        | Error::Exchange(ExchangeError::Permission(_)) => Error::InvalidApiKeys {
            account_id: account_id.to_string(),
        },
        Error::InvalidApiKeys { .. } => Error::InvalidApiKeys {
            account_id: account_id.to_string(),
        },
        other => other,
    }
}

/// The error string broadcast in account replies.
fn reply_error(error: &Error) -> String {
    match error {
        Error::InvalidApiKeys { .. } => "Invalid API Keys".to_string(),
        Error::WrongAccount { .. } => "No matching account".to_string(),
        Error::InvalidMessage(_) => "Invalid Message".to_string(),
        other => crate::exchange::parse_error_message(&other.to_string()),
    }
}

fn spawn_heartbeat(bus: Arc<EventBus>, account_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            bus.publish(BusEvent::AccountHeartbeat {
                account_id: account_id.clone(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use crate::testkit::StubConnector;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn wiring() -> (Arc<EventBus>, Arc<AccountManager>, Arc<StubConnector>) {
        let bus = Arc::new(EventBus::new());
        let router = StreamRouter::new(Arc::clone(&bus));
        let connector = Arc::new(StubConnector::default());
        let manager = AccountManager::new(
            Arc::clone(&bus),
            Arc::clone(&connector) as Arc<dyn ConnectExchange>,
            router,
            true,
        );
        (bus, manager, connector)
    }

    #[tokio::test]
    async fn create_delete_create_round_trips() {
        let (_bus, manager, _connector) = wiring();

        manager.connect("A", "key", "secret", None).await.unwrap();
        assert!(manager.connected().await);

        let deleted = manager.delete("A", Some(Utc::now())).await.unwrap();
        assert!(deleted);
        assert!(!manager.connected().await);

        manager.connect("A", "key", "secret", None).await.unwrap();
        assert!(manager.connected().await);
        assert_eq!(manager.account_id().await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn stale_delete_is_ignored() {
        let (_bus, manager, _connector) = wiring();
        manager
            .connect("A", "key", "secret", Some(Utc::now()))
            .await
            .unwrap();

        let stale = Utc::now() - chrono::Duration::hours(1);
        let deleted = manager.delete("A", Some(stale)).await.unwrap();
        assert!(!deleted);
        assert!(manager.connected().await);
    }

    #[tokio::test]
    async fn delete_for_unbound_account_is_rejected() {
        let (_bus, manager, _connector) = wiring();
        manager.connect("A", "key", "secret", None).await.unwrap();

        let result = manager.delete("B", Some(Utc::now())).await;
        assert!(matches!(result, Err(Error::WrongAccount { .. })));
        assert!(manager.connected().await);
    }

    #[tokio::test]
    async fn empty_keys_are_invalid() {
        let (_bus, manager, _connector) = wiring();
        let result = manager.connect("A", "", "secret", None).await;
        assert!(matches!(result, Err(Error::InvalidApiKeys { .. })));
        assert!(!manager.connected().await);
    }

    #[tokio::test]
    async fn auth_rejection_returns_to_disconnected() {
        let (_bus, manager, connector) = wiring();
        connector.fail_margins_with(ExchangeError::Authentication("denied".into()));

        let result = manager.connect("A", "key", "secret", None).await;
        match result {
            Err(Error::InvalidApiKeys { account_id }) => assert_eq!(account_id, "A"),
            other => panic!("expected InvalidApiKeys, got {other:?}"),
        }
        assert!(!manager.connected().await);
    }

    #[tokio::test]
    async fn snapshots_replay_on_connect() {
        let (bus, manager, connector) = wiring();
        connector.seed_order_snapshot(vec![
            serde_json::from_str(r#"{"orderID":"hist-1","ordStatus":"Filled"}"#).unwrap(),
            serde_json::from_str(r#"{"orderID":"hist-2","ordStatus":"New"}"#).unwrap(),
        ]);

        let order_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&order_events);
        bus.register(
            EventKey::OrderUpdatedEvent,
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        manager.connect("A", "key", "secret", None).await.unwrap();
        drain().await;

        assert_eq!(order_events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_beats_every_five_seconds_while_connected() {
        let (bus, manager, _connector) = wiring();

        let beats: Arc<SyncMutex<Vec<String>>> = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&beats);
        bus.register(
            EventKey::AccountHeartbeat,
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    if let BusEvent::AccountHeartbeat { account_id } = event {
                        sink.lock().push(account_id);
                    }
                    Ok(())
                }
            }),
        );

        manager.connect("A", "key", "secret", None).await.unwrap();
        drain().await;
        assert!(beats.lock().is_empty());

        tokio::time::advance(Duration::from_millis(5_100)).await;
        drain().await;
        assert_eq!(beats.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        drain().await;
        assert_eq!(beats.lock().len(), 2);

        // No heartbeats after disconnect.
        manager.disconnect().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        drain().await;
        assert_eq!(beats.lock().len(), 2);
    }
}
