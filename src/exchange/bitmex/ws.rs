//! The single authenticated realtime socket.
//!
//! One connection multiplexes the five subscriptions; table messages
//! are decoded into domain frames and fanned into per-topic broadcast
//! buffers that `watch_*` calls await. The socket task reconnects
//! with a fixed pause until the client is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::exchange::Credentials;
use crate::models::{MarginUpdate, Position, Symbol, Trade};

use super::signing::sign;

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const BUFFER_CAPACITY: usize = 64;

/// Per-topic frame buffers. Senders live in the socket task, receivers
/// in the client's `watch_*` methods.
#[derive(Clone)]
pub(super) struct StreamBuffers {
    pub margins: broadcast::Sender<Vec<MarginUpdate>>,
    pub positions: broadcast::Sender<Vec<Position>>,
    pub tickers: broadcast::Sender<HashMap<String, Symbol>>,
    pub orders: broadcast::Sender<Vec<Trade>>,
    pub my_trades: broadcast::Sender<Vec<Trade>>,
}

impl StreamBuffers {
    pub fn new() -> Self {
        Self {
            margins: broadcast::channel(BUFFER_CAPACITY).0,
            positions: broadcast::channel(BUFFER_CAPACITY).0,
            tickers: broadcast::channel(BUFFER_CAPACITY).0,
            orders: broadcast::channel(BUFFER_CAPACITY).0,
            my_trades: broadcast::channel(BUFFER_CAPACITY).0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TableMessage {
    table: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

pub(super) async fn run_socket(
    url: String,
    credentials: Credentials,
    buffers: StreamBuffers,
    closed: Arc<AtomicBool>,
) {
    while !closed.load(Ordering::SeqCst) {
        match stream_session(&url, &credentials, &buffers, &closed).await {
            Ok(()) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                info!(url = %url, "realtime socket closed, reconnecting");
            }
            Err(error) => warn!(url = %url, %error, "realtime socket failed"),
        }
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(RECONNECT_PAUSE).await;
    }
}

async fn stream_session(
    url: &str,
    credentials: &Credentials,
    buffers: &StreamBuffers,
    closed: &AtomicBool,
) -> Result<()> {
    let (mut socket, response) = connect_async(url).await?;
    info!(status = %response.status(), "realtime socket connected");

    // Authenticated subscriptions need authKeyExpires before subscribe.
    let expires = Utc::now().timestamp() + 10;
    let signature = sign(&credentials.api_secret, "GET", "/realtime", expires, "");
    let auth = serde_json::json!({
        "op": "authKeyExpires",
        "args": [credentials.api_key, expires, signature],
    });
    socket.send(Message::Text(auth.to_string())).await?;

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": ["margin", "position", "instrument", "order", "execution"],
    });
    socket.send(Message::Text(subscribe.to_string())).await?;

    while let Some(message) = socket.next().await {
        if closed.load(Ordering::SeqCst) {
            let _ = socket.close(None).await;
            break;
        }
        match message? {
            Message::Text(text) => route_message(&text, buffers),
            Message::Ping(payload) => socket.send(Message::Pong(payload)).await?,
            Message::Close(frame) => {
                info!(frame = ?frame, "realtime socket closed by server");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

fn route_message(text: &str, buffers: &StreamBuffers) {
    let Ok(message) = serde_json::from_str::<TableMessage>(text) else {
        // Non-table frames (welcome, subscribe acks, auth results).
        debug!(raw = %text, "ignoring non-table frame");
        return;
    };
    if message.data.is_empty() {
        return;
    }

    match message.table.as_str() {
        "margin" => {
            let rows = decode_rows::<MarginUpdate>(&message.data, "margin");
            if !rows.is_empty() {
                let _ = buffers.margins.send(rows);
            }
        }
        "position" => {
            let rows = decode_rows::<Position>(&message.data, "position");
            if !rows.is_empty() {
                let _ = buffers.positions.send(rows);
            }
        }
        "instrument" => {
            let rows = decode_rows::<Symbol>(&message.data, "instrument");
            if !rows.is_empty() {
                let frame = rows
                    .into_iter()
                    .map(|symbol| (symbol.symbol.clone(), symbol))
                    .collect();
                let _ = buffers.tickers.send(frame);
            }
        }
        "order" => {
            let rows = decode_rows::<Trade>(&message.data, "order");
            if !rows.is_empty() {
                let _ = buffers.orders.send(rows);
            }
        }
        "execution" => {
            let rows = decode_rows::<Trade>(&message.data, "execution");
            if !rows.is_empty() {
                let _ = buffers.my_trades.send(rows);
            }
        }
        other => debug!(table = other, "ignoring unsubscribed table"),
    }
}

fn decode_rows<T: serde::de::DeserializeOwned>(
    rows: &[serde_json::Value],
    table: &str,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match serde_json::from_value(row.clone()) {
            Ok(decoded) => Some(decoded),
            Err(error) => {
                warn!(table, %error, "dropping undecodable stream row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_margin_table_into_the_margin_buffer() {
        let buffers = StreamBuffers::new();
        let mut rx = buffers.margins.subscribe();

        route_message(
            r#"{"table":"margin","action":"update","data":[{"currency":"XBt","availableMargin":100000000}]}"#,
            &buffers,
        );

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0].currency, "XBt");
    }

    #[test]
    fn instrument_rows_become_a_symbol_map() {
        let buffers = StreamBuffers::new();
        let mut rx = buffers.tickers.subscribe();

        route_message(
            r#"{"table":"instrument","action":"partial","data":[
                {"symbol":"XBTUSD","state":"Open","tickSize":0.5},
                {"symbol":"XBTM20","state":"Settled","tickSize":0.5}
            ]}"#,
            &buffers,
        );

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 2);
        assert!(frame.contains_key("XBTUSD"));
    }

    #[test]
    fn non_table_frames_are_ignored() {
        let buffers = StreamBuffers::new();
        let mut rx = buffers.orders.subscribe();

        route_message(r#"{"success":true,"subscribe":"order"}"#, &buffers);
        route_message(r#"{"info":"Welcome to the BitMEX Realtime API."}"#, &buffers);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn undecodable_rows_are_dropped_not_fatal() {
        let buffers = StreamBuffers::new();
        let mut rx = buffers.orders.subscribe();

        route_message(
            r#"{"table":"order","action":"update","data":[{"noOrderId":true},{"orderID":"ok-1"}]}"#,
            &buffers,
        );

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0].order_id, "ok-1");
    }
}
