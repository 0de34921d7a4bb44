//! Redis-backed store: one hash per `(account, kind)`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;
use crate::models::{Margin, MarginUpdate, Order, Position, Symbol, Trade};

use super::{
    decode_hash, fold_margins, fold_positions, fold_tickers, fold_trades, hash_key, DataStore,
};

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Open the connection pool; call once in bootstrap.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }

    async fn read_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut connection = self.connection.clone();
        Ok(connection.hgetall(key).await?)
    }

    async fn read_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        Ok(connection.hget(key, field).await?)
    }

    async fn write_fields(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let mut connection = self.connection.clone();
        connection.hset_multiple::<_, _, _, ()>(key, &pairs).await?;
        Ok(())
    }

    async fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<T>> {
        Ok(self
            .read_field(key, field)
            .await?
            .and_then(|json| serde_json::from_str(&json).ok()))
    }
}

#[async_trait]
impl DataStore for RedisStore {
    async fn save_margins(&self, account_id: &str, updates: &[MarginUpdate]) -> Result<()> {
        let key = hash_key(account_id, "margins");
        let existing = decode_hash::<Margin>(self.read_all(&key).await?);
        self.write_fields(&key, fold_margins(&existing, updates)?)
            .await
    }

    async fn save_tickers(
        &self,
        account_id: &str,
        tickers: &HashMap<String, Symbol>,
    ) -> Result<()> {
        let key = hash_key(account_id, "tickers");
        let existing = decode_hash::<Symbol>(self.read_all(&key).await?);
        self.write_fields(&key, fold_tickers(&existing, tickers)?)
            .await
    }

    async fn save_trades(&self, account_id: &str, trades: &[Trade]) -> Result<()> {
        let key = hash_key(account_id, "trades");
        let existing = decode_hash::<Trade>(self.read_all(&key).await?);
        self.write_fields(&key, fold_trades(&existing, trades)?)
            .await
    }

    async fn save_positions(&self, account_id: &str, positions: &[Position]) -> Result<()> {
        let key = hash_key(account_id, "positions");
        let existing = decode_hash::<Position>(self.read_all(&key).await?);
        self.write_fields(&key, fold_positions(&existing, positions)?)
            .await
    }

    async fn save_order(&self, account_id: &str, order: &Order) -> Result<()> {
        let key = hash_key(account_id, "orders");
        let mut fields = HashMap::new();
        fields.insert(order.id.clone(), serde_json::to_string(order)?);
        self.write_fields(&key, fields).await
    }

    async fn get_margins(&self, account_id: &str) -> Result<HashMap<String, Margin>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "margins")).await?,
        ))
    }

    async fn get_margin(&self, account_id: &str, currency: &str) -> Result<Option<Margin>> {
        self.get_decoded(&hash_key(account_id, "margins"), currency)
            .await
    }

    async fn get_tickers(&self, account_id: &str) -> Result<HashMap<String, Symbol>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "tickers")).await?,
        ))
    }

    async fn get_ticker(&self, account_id: &str, symbol: &str) -> Result<Option<Symbol>> {
        self.get_decoded(&hash_key(account_id, "tickers"), symbol)
            .await
    }

    async fn get_positions(&self, account_id: &str) -> Result<HashMap<String, Position>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "positions")).await?,
        ))
    }

    async fn get_position(&self, account_id: &str, symbol: &str) -> Result<Option<Position>> {
        self.get_decoded(&hash_key(account_id, "positions"), symbol)
            .await
    }

    async fn get_trades(&self, account_id: &str) -> Result<HashMap<String, Trade>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "trades")).await?,
        ))
    }

    async fn get_trade(&self, account_id: &str, order_id: &str) -> Result<Option<Trade>> {
        self.get_decoded(&hash_key(account_id, "trades"), order_id)
            .await
    }

    async fn get_orders(&self, account_id: &str) -> Result<HashMap<String, Order>> {
        Ok(decode_hash(
            self.read_all(&hash_key(account_id, "orders")).await?,
        ))
    }

    async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Option<Order>> {
        self.get_decoded(&hash_key(account_id, "orders"), order_id)
            .await
    }
}
