//! Exchange-stream fan-out.
//!
//! Five loops, one per subscription, each reading the adapter's
//! streaming buffer and republishing onto the bus. Orders and
//! positions are deduplicated by a content hash of their canonical
//! JSON so resent snapshots do not echo downstream; tickers are
//! filtered to open instruments; margins and trades pass through
//! verbatim.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fnv::FnvHasher;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::error::Error;
use crate::exchange::ExchangeClient;
use crate::models::{MarginUpdate, Position, Symbol, Trade};

/// Pause before re-entering a wait after a failed read, so a dead
/// buffer cannot spin the loop hot.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Stable content hash: FNV-1a over the canonical (sorted-key) JSON
/// serialization.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.as_bytes());
    hasher.finish()
}

pub struct StreamRouter {
    bus: Arc<EventBus>,
    watching: AtomicBool,
    order_hashes: DashMap<String, u64>,
    position_hashes: DashMap<String, u64>,
}

impl StreamRouter {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            watching: AtomicBool::new(false),
            order_hashes: DashMap::new(),
            position_hashes: DashMap::new(),
        })
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Loops observe the flag at their next iteration boundary.
    pub fn stop(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }

    /// Reset the dedup caches and spawn the five loops for a freshly
    /// connected account.
    pub fn start(
        self: &Arc<Self>,
        account_id: String,
        client: Arc<dyn ExchangeClient>,
    ) -> Vec<JoinHandle<()>> {
        self.watching.store(true, Ordering::SeqCst);
        self.order_hashes.clear();
        self.position_hashes.clear();

        vec![
            tokio::spawn(Self::run_margins(
                Arc::clone(self),
                account_id.clone(),
                Arc::clone(&client),
            )),
            tokio::spawn(Self::run_positions(
                Arc::clone(self),
                account_id.clone(),
                Arc::clone(&client),
            )),
            tokio::spawn(Self::run_tickers(
                Arc::clone(self),
                account_id.clone(),
                Arc::clone(&client),
            )),
            tokio::spawn(Self::run_orders(
                Arc::clone(self),
                account_id.clone(),
                Arc::clone(&client),
            )),
            tokio::spawn(Self::run_my_trades(
                Arc::clone(self),
                account_id,
                client,
            )),
        ]
    }

    async fn run_margins(self: Arc<Self>, account_id: String, client: Arc<dyn ExchangeClient>) {
        while self.is_watching() {
            match client.watch_margins().await {
                Ok(frame) => self.publish_margins(&account_id, frame),
                Err(error) => {
                    log_stream_error("margins", &error);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn run_positions(
        self: Arc<Self>,
        account_id: String,
        client: Arc<dyn ExchangeClient>,
    ) {
        while self.is_watching() {
            match client.watch_positions().await {
                Ok(frame) => self.publish_positions(&account_id, frame),
                Err(error) => {
                    log_stream_error("positions", &error);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn run_tickers(self: Arc<Self>, account_id: String, client: Arc<dyn ExchangeClient>) {
        while self.is_watching() {
            match client.watch_tickers().await {
                Ok(frame) => self.publish_tickers(&account_id, frame),
                Err(error) => {
                    log_stream_error("tickers", &error);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn run_orders(self: Arc<Self>, account_id: String, client: Arc<dyn ExchangeClient>) {
        while self.is_watching() {
            match client.watch_orders().await {
                Ok(frame) => self.publish_orders(&account_id, frame),
                Err(error) => {
                    log_stream_error("orders", &error);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn run_my_trades(
        self: Arc<Self>,
        account_id: String,
        client: Arc<dyn ExchangeClient>,
    ) {
        while self.is_watching() {
            match client.watch_my_trades().await {
                Ok(frame) => self.publish_my_trades(&account_id, frame),
                Err(error) => {
                    log_stream_error("my_trades", &error);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    /// Margins pass through verbatim.
    pub fn publish_margins(&self, account_id: &str, frame: Vec<MarginUpdate>) {
        self.bus.publish(BusEvent::MarginsUpdated {
            account_id: account_id.to_string(),
            margins: frame,
        });
    }

    /// Trades pass through verbatim; empty frames are dropped.
    pub fn publish_my_trades(&self, account_id: &str, frame: Vec<Trade>) {
        if frame.is_empty() {
            return;
        }
        self.bus.publish(BusEvent::MyTradesUpdated {
            account_id: account_id.to_string(),
            trades: frame,
        });
    }

    /// One `order_updated_event` per order whose content changed.
    pub fn publish_orders(&self, account_id: &str, frame: Vec<Trade>) {
        for trade in frame {
            let digest = canonical_hash(&trade);
            let changed =
                self.order_hashes.insert(trade.order_id.clone(), digest) != Some(digest);
            if changed {
                self.bus.publish(BusEvent::OrderUpdated {
                    account_id: account_id.to_string(),
                    trade,
                });
            }
        }
    }

    /// The positions event carries only the changed subset.
    pub fn publish_positions(&self, account_id: &str, frame: Vec<Position>) {
        let mut changed = Vec::new();
        for position in frame {
            let digest = canonical_hash(&position);
            if self.position_hashes.insert(position.symbol.clone(), digest) != Some(digest) {
                changed.push(position);
            }
        }
        if changed.is_empty() {
            return;
        }
        self.bus.publish(BusEvent::PositionsUpdated {
            account_id: account_id.to_string(),
            positions: changed,
        });
    }

    /// Whole-snapshot map, restricted to instruments still trading.
    pub fn publish_tickers(&self, account_id: &str, frame: HashMap<String, Symbol>) {
        let open: HashMap<String, Symbol> = frame
            .into_iter()
            .filter(|(_, symbol)| symbol.is_open())
            .collect();
        self.bus.publish(BusEvent::TickerUpdated {
            account_id: account_id.to_string(),
            tickers: open,
        });
    }
}

fn log_stream_error(stream: &str, error: &Error) {
    match error {
        Error::Exchange(exchange_error) if exchange_error.is_network() => {
            debug!(stream, %exchange_error, "stream read failed, re-entering wait");
        }
        other => warn!(stream, error = %other, "stream loop error ignored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler, EventKey};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn capture_count(bus: &EventBus, key: EventKey) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        bus.register(
            key,
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        count
    }

    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn order(id: &str, status: &str) -> Trade {
        serde_json::from_str(&format!(
            r#"{{"orderID":"{id}","ordStatus":"{status}","orderQty":100}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn resent_order_snapshots_are_deduplicated() {
        let bus = Arc::new(EventBus::new());
        let count = capture_count(&bus, EventKey::OrderUpdatedEvent);
        let router = StreamRouter::new(Arc::clone(&bus));

        router.publish_orders("acct", vec![order("ord-1", "New")]);
        router.publish_orders("acct", vec![order("ord-1", "New")]);
        drain().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A content change emits again.
        router.publish_orders("acct", vec![order("ord-1", "Filled")]);
        drain().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn position_events_carry_only_the_changed_subset() {
        let bus = Arc::new(EventBus::new());
        let captured: Arc<Mutex<Vec<Vec<Position>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        bus.register(
            EventKey::PositionsUpdatedEvent,
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    if let BusEvent::PositionsUpdated { positions, .. } = event {
                        sink.lock().push(positions);
                    }
                    Ok(())
                }
            }),
        );
        let router = StreamRouter::new(Arc::clone(&bus));

        let xbt: Position =
            serde_json::from_str(r#"{"symbol":"XBTUSD","currentQty":100}"#).unwrap();
        let eth: Position =
            serde_json::from_str(r#"{"symbol":"ETHUSD","currentQty":-5}"#).unwrap();
        router.publish_positions("acct", vec![xbt.clone(), eth.clone()]);
        drain().await;

        // Resend one unchanged, one changed: only the change flows.
        let eth_changed: Position =
            serde_json::from_str(r#"{"symbol":"ETHUSD","currentQty":-10}"#).unwrap();
        router.publish_positions("acct", vec![xbt, eth_changed]);
        drain().await;

        let frames = captured.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 2);
        assert_eq!(frames[1].len(), 1);
        assert_eq!(frames[1][0].symbol, "ETHUSD");
    }

    #[tokio::test]
    async fn ticker_snapshots_keep_only_open_instruments() {
        let bus = Arc::new(EventBus::new());
        let captured: Arc<Mutex<Vec<HashMap<String, Symbol>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        bus.register(
            EventKey::TickerUpdatedEvent,
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    if let BusEvent::TickerUpdated { tickers, .. } = event {
                        sink.lock().push(tickers);
                    }
                    Ok(())
                }
            }),
        );
        let router = StreamRouter::new(Arc::clone(&bus));

        let mut frame = HashMap::new();
        frame.insert(
            "XBTUSD".to_string(),
            serde_json::from_str::<Symbol>(r#"{"symbol":"XBTUSD","state":"Open"}"#).unwrap(),
        );
        frame.insert(
            "XBTM20".to_string(),
            serde_json::from_str::<Symbol>(r#"{"symbol":"XBTM20","state":"Settled"}"#)
                .unwrap(),
        );
        router.publish_tickers("acct", frame);
        drain().await;

        let frames = captured.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains_key("XBTUSD"));
        assert!(!frames[0].contains_key("XBTM20"));
    }

    #[tokio::test]
    async fn empty_trade_frames_are_dropped() {
        let bus = Arc::new(EventBus::new());
        let count = capture_count(&bus, EventKey::MyTradesUpdatedEvent);
        let router = StreamRouter::new(Arc::clone(&bus));

        router.publish_my_trades("acct", Vec::new());
        drain().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn canonical_hash_is_field_order_independent() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));

        let c: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":{"y":2,"x":3}}"#).unwrap();
        assert_ne!(canonical_hash(&a), canonical_hash(&c));
    }
}
