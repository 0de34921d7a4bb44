//! In-memory store: the Redis layout without the Redis.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::models::{Margin, MarginUpdate, Order, Position, Symbol, Trade};

use super::{
    decode_hash, fold_margins, fold_positions, fold_tickers, fold_trades, hash_key, DataStore,
};

/// Hash-per-kind cache, keyed exactly like the Redis backend so both
/// round-trip identical JSON records.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_all(&self, key: &str) -> HashMap<String, String> {
        self.hashes.read().get(key).cloned().unwrap_or_default()
    }

    fn read_field(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.read().get(key)?.get(field).cloned()
    }

    fn write_fields(&self, key: &str, fields: HashMap<String, String>) {
        if fields.is_empty() {
            return;
        }
        self.hashes
            .write()
            .entry(key.to_string())
            .or_default()
            .extend(fields);
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        field: &str,
    ) -> Option<T> {
        self.read_field(key, field)
            .and_then(|json| serde_json::from_str(&json).ok())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn save_margins(&self, account_id: &str, updates: &[MarginUpdate]) -> Result<()> {
        let key = hash_key(account_id, "margins");
        let existing = decode_hash::<Margin>(self.read_all(&key));
        self.write_fields(&key, fold_margins(&existing, updates)?);
        Ok(())
    }

    async fn save_tickers(
        &self,
        account_id: &str,
        tickers: &HashMap<String, Symbol>,
    ) -> Result<()> {
        let key = hash_key(account_id, "tickers");
        let existing = decode_hash::<Symbol>(self.read_all(&key));
        self.write_fields(&key, fold_tickers(&existing, tickers)?);
        Ok(())
    }

    async fn save_trades(&self, account_id: &str, trades: &[Trade]) -> Result<()> {
        let key = hash_key(account_id, "trades");
        let existing = decode_hash::<Trade>(self.read_all(&key));
        self.write_fields(&key, fold_trades(&existing, trades)?);
        Ok(())
    }

    async fn save_positions(&self, account_id: &str, positions: &[Position]) -> Result<()> {
        let key = hash_key(account_id, "positions");
        let existing = decode_hash::<Position>(self.read_all(&key));
        self.write_fields(&key, fold_positions(&existing, positions)?);
        Ok(())
    }

    async fn save_order(&self, account_id: &str, order: &Order) -> Result<()> {
        let key = hash_key(account_id, "orders");
        let mut fields = HashMap::new();
        fields.insert(order.id.clone(), serde_json::to_string(order)?);
        self.write_fields(&key, fields);
        Ok(())
    }

    async fn get_margins(&self, account_id: &str) -> Result<HashMap<String, Margin>> {
        Ok(decode_hash(self.read_all(&hash_key(account_id, "margins"))))
    }

    async fn get_margin(&self, account_id: &str, currency: &str) -> Result<Option<Margin>> {
        Ok(self.get_decoded(&hash_key(account_id, "margins"), currency))
    }

    async fn get_tickers(&self, account_id: &str) -> Result<HashMap<String, Symbol>> {
        Ok(decode_hash(self.read_all(&hash_key(account_id, "tickers"))))
    }

    async fn get_ticker(&self, account_id: &str, symbol: &str) -> Result<Option<Symbol>> {
        Ok(self.get_decoded(&hash_key(account_id, "tickers"), symbol))
    }

    async fn get_positions(&self, account_id: &str) -> Result<HashMap<String, Position>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "positions")),
        ))
    }

    async fn get_position(&self, account_id: &str, symbol: &str) -> Result<Option<Position>> {
        Ok(self.get_decoded(&hash_key(account_id, "positions"), symbol))
    }

    async fn get_trades(&self, account_id: &str) -> Result<HashMap<String, Trade>> {
        Ok(decode_hash(self.read_all(&hash_key(account_id, "trades"))))
    }

    async fn get_trade(&self, account_id: &str, order_id: &str) -> Result<Option<Trade>> {
        Ok(self.get_decoded(&hash_key(account_id, "trades"), order_id))
    }

    async fn get_orders(&self, account_id: &str) -> Result<HashMap<String, Order>> {
        Ok(decode_hash(self.read_all(&hash_key(account_id, "orders"))))
    }

    async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Option<Order>> {
        Ok(self.get_decoded(&hash_key(account_id, "orders"), order_id))
    }
}
