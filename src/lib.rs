//! bitmex-relay - single-tenant AMQP to BitMEX bridge node.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── bus/           # In-process typed pub/sub with coalescing rate limits
//! ├── models/        # Domain records + tolerant dual-shape codecs
//! ├── store/         # Merge-on-write state cache (Redis / in-memory)
//! ├── exchange/      # Exchange client contract, retry adapter, BitMEX client
//! ├── stream/        # WebSocket fan-out with content-hash dedup
//! ├── orchestrator/  # Compound orders, close/attach flows, cancel
//! ├── account/       # The single-account lifecycle state machine
//! ├── queues/        # AMQP topic exchange + three submanagers
//! └── server/        # GET /status liveness endpoint
//! ```
//!
//! Commands arrive over AMQP, are decoded into typed bus events, and
//! are executed against the exchange; results flow back to the broker
//! under the request's correlation id while account-state streams fan
//! out continuously.

pub mod account;
pub mod bus;
pub mod config;
pub mod error;
pub mod exchange;
pub mod models;
pub mod orchestrator;
pub mod queues;
pub mod server;
pub mod store;
pub mod stream;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{Error, Result};
