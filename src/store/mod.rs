//! The materialized state store.
//!
//! A keyed cache of everything the streams have told us, addressed by
//! `(account, kind, natural key)` and merged last-write-wins on every
//! save. Two backends satisfy one contract: Redis (hash per kind) and
//! an in-memory twin with identical JSON round-trip behavior.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{handler, BusEvent, EventBus, EventKey};
use crate::error::Result;
use crate::models::{Margin, MarginUpdate, Order, Position, Symbol, Trade};

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn save_margins(&self, account_id: &str, updates: &[MarginUpdate]) -> Result<()>;
    async fn save_tickers(
        &self,
        account_id: &str,
        tickers: &HashMap<String, Symbol>,
    ) -> Result<()>;
    async fn save_trades(&self, account_id: &str, trades: &[Trade]) -> Result<()>;
    async fn save_positions(&self, account_id: &str, positions: &[Position]) -> Result<()>;
    async fn save_order(&self, account_id: &str, order: &Order) -> Result<()>;

    async fn get_margins(&self, account_id: &str) -> Result<HashMap<String, Margin>>;
    async fn get_margin(&self, account_id: &str, currency: &str) -> Result<Option<Margin>>;
    async fn get_tickers(&self, account_id: &str) -> Result<HashMap<String, Symbol>>;
    async fn get_ticker(&self, account_id: &str, symbol: &str) -> Result<Option<Symbol>>;
    async fn get_positions(&self, account_id: &str) -> Result<HashMap<String, Position>>;
    async fn get_position(&self, account_id: &str, symbol: &str) -> Result<Option<Position>>;
    async fn get_trades(&self, account_id: &str) -> Result<HashMap<String, Trade>>;
    async fn get_trade(&self, account_id: &str, order_id: &str) -> Result<Option<Trade>>;
    async fn get_orders(&self, account_id: &str) -> Result<HashMap<String, Order>>;
    async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Option<Order>>;
}

pub(crate) fn hash_key(account_id: &str, kind: &str) -> String {
    format!("bitmex:{account_id}:{kind}")
}

/// Fold margin rows into the stored set; returns the rows to write
/// back, serialized. Rows that resolve neither balance nor usage are
/// skipped.
pub(crate) fn fold_margins(
    existing: &HashMap<String, Margin>,
    updates: &[MarginUpdate],
) -> Result<HashMap<String, String>> {
    let mut changed = HashMap::new();
    for update in updates {
        let Some(merged) = Margin::apply(existing.get(&update.currency), update) else {
            continue;
        };
        changed.insert(update.currency.clone(), serde_json::to_string(&merged)?);
    }
    Ok(changed)
}

pub(crate) fn fold_tickers(
    existing: &HashMap<String, Symbol>,
    incoming: &HashMap<String, Symbol>,
) -> Result<HashMap<String, String>> {
    let mut changed = HashMap::new();
    for (symbol, update) in incoming {
        let merged = match existing.get(symbol) {
            Some(stored) => {
                let mut merged = stored.clone();
                merged.merge(update);
                merged
            }
            None => update.clone(),
        };
        changed.insert(symbol.clone(), serde_json::to_string(&merged)?);
    }
    Ok(changed)
}

pub(crate) fn fold_positions(
    existing: &HashMap<String, Position>,
    incoming: &[Position],
) -> Result<HashMap<String, String>> {
    let mut changed = HashMap::new();
    for update in incoming {
        let merged = match existing.get(&update.symbol) {
            Some(stored) => {
                let mut merged = stored.clone();
                merged.merge(update);
                merged
            }
            None => update.clone(),
        };
        changed.insert(update.symbol.clone(), serde_json::to_string(&merged)?);
    }
    Ok(changed)
}

pub(crate) fn fold_trades(
    existing: &HashMap<String, Trade>,
    incoming: &[Trade],
) -> Result<HashMap<String, String>> {
    let mut changed = HashMap::new();
    for update in incoming {
        let merged = match existing.get(&update.order_id) {
            Some(stored) => {
                let mut merged = stored.clone();
                merged.merge(update);
                merged
            }
            None => update.clone(),
        };
        changed.insert(update.order_id.clone(), serde_json::to_string(&merged)?);
    }
    Ok(changed)
}

pub(crate) fn decode_hash<T: serde::de::DeserializeOwned>(
    raw: HashMap<String, String>,
) -> HashMap<String, T> {
    raw.into_iter()
        .filter_map(|(field, json)| {
            serde_json::from_str(&json)
                .map(|decoded| (field, decoded))
                .ok()
        })
        .collect()
}

/// Subscribe the store to the stream events it materializes.
pub fn register_listeners(bus: &EventBus, store: Arc<dyn DataStore>) {
    let st = Arc::clone(&store);
    bus.register(
        EventKey::MarginsUpdatedEvent,
        handler(move |event| {
            let st = Arc::clone(&st);
            async move {
                if let BusEvent::MarginsUpdated {
                    account_id,
                    margins,
                } = event
                {
                    st.save_margins(&account_id, &margins).await?;
                }
                Ok(())
            }
        }),
    );

    let st = Arc::clone(&store);
    bus.register(
        EventKey::TickerUpdatedEvent,
        handler(move |event| {
            let st = Arc::clone(&st);
            async move {
                if let BusEvent::TickerUpdated {
                    account_id,
                    tickers,
                } = event
                {
                    st.save_tickers(&account_id, &tickers).await?;
                }
                Ok(())
            }
        }),
    );

    let st = Arc::clone(&store);
    bus.register(
        EventKey::MyTradesUpdatedEvent,
        handler(move |event| {
            let st = Arc::clone(&st);
            async move {
                if let BusEvent::MyTradesUpdated { account_id, trades } = event {
                    st.save_trades(&account_id, &trades).await?;
                }
                Ok(())
            }
        }),
    );

    let st = Arc::clone(&store);
    bus.register(
        EventKey::PositionsUpdatedEvent,
        handler(move |event| {
            let st = Arc::clone(&st);
            async move {
                if let BusEvent::PositionsUpdated {
                    account_id,
                    positions,
                } = event
                {
                    st.save_positions(&account_id, &positions).await?;
                }
                Ok(())
            }
        }),
    );

    let st = Arc::clone(&store);
    bus.register(
        EventKey::OrderPlacedEvent,
        handler(move |event| {
            let st = Arc::clone(&st);
            async move {
                if let BusEvent::OrderPlaced { account_id, order } = event {
                    st.save_order(&account_id, &order).await?;
                }
                Ok(())
            }
        }),
    );
}
