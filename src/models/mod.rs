//! Typed records for everything that crosses the wire.
//!
//! Every record decodes tolerantly from both wire shapes (the
//! exchange-native camelCase tables and our internal snake_case JSON)
//! through a single `serde` derive with field aliases, and serializes
//! canonically in snake_case. Merging is field-wise last-write-wins:
//! a new value when present, the retained one otherwise.

pub mod margin;
pub mod order;
pub mod position;
pub mod symbol;
pub mod trade;

pub use margin::{Margin, MarginUpdate};
pub use order::{
    calculate_order_quantity, demangle_client_order_id, nonce_client_order_id,
    round_down_to_tick, symbol_value_in_xbt, AttachStopRequest, AttachTslRequest,
    CompoundOrderRequest, CompoundOrders, Order, OrderSide, OrderType, StopTriggerType,
};
pub use position::Position;
pub use symbol::Symbol;
pub use trade::Trade;
