use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    AttachStopRequest, AttachTslRequest, CompoundOrderRequest, MarginUpdate, Order, Position,
    Symbol, Trade,
};

/// The closed set of event keys the bus routes. Command keys are fed
/// by the queue managers, result/stream keys by the orchestrator, the
/// lifecycle, and the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    CreateAccountCmd,
    UpdateAccountCmd,
    DeleteAccountCmd,
    CreateOrderCmd,
    UpdateOrderCmd,
    CancelOrderCmd,
    PositionCloseCmd,
    PositionAddStopCmd,
    PositionAddTslCmd,
    AccountHeartbeat,
    AccountCreatedEvent,
    AccountUpdatedEvent,
    AccountDeletedEvent,
    OrderCreatedEvent,
    OrderUpdatedEvent,
    OrderCanceledEvent,
    PositionClosedEvent,
    PositionAddedStopEvent,
    PositionAddedTslEvent,
    MarginsUpdatedEvent,
    PositionsUpdatedEvent,
    TickerUpdatedEvent,
    MyTradesUpdatedEvent,
    OrderPlacedEvent,
}

impl EventKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAccountCmd => "create_account_cmd",
            Self::UpdateAccountCmd => "update_account_cmd",
            Self::DeleteAccountCmd => "delete_account_cmd",
            Self::CreateOrderCmd => "create_order_cmd",
            Self::UpdateOrderCmd => "update_order_cmd",
            Self::CancelOrderCmd => "cancel_order_cmd",
            Self::PositionCloseCmd => "position_close_cmd",
            Self::PositionAddStopCmd => "position_add_stop_cmd",
            Self::PositionAddTslCmd => "position_add_tsl_cmd",
            Self::AccountHeartbeat => "account_heartbeat",
            Self::AccountCreatedEvent => "account_created_event",
            Self::AccountUpdatedEvent => "account_updated_event",
            Self::AccountDeletedEvent => "account_deleted_event",
            Self::OrderCreatedEvent => "order_created_event",
            Self::OrderUpdatedEvent => "order_updated_event",
            Self::OrderCanceledEvent => "order_canceled_event",
            Self::PositionClosedEvent => "position_closed_event",
            Self::PositionAddedStopEvent => "position_added_stop_event",
            Self::PositionAddedTslEvent => "position_added_tsl_event",
            Self::MarginsUpdatedEvent => "margins_updated_event",
            Self::PositionsUpdatedEvent => "positions_updated_event",
            Self::TickerUpdatedEvent => "ticker_updated_event",
            Self::MyTradesUpdatedEvent => "my_trades_updated_event",
            Self::OrderPlacedEvent => "order_placed_event",
        }
    }
}

/// Credentials payload of a create/update account command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCommand {
    #[serde(alias = "accountId")]
    pub account_id: String,
    #[serde(alias = "apiKey")]
    pub api_key: String,
    #[serde(alias = "apiSecret")]
    pub api_secret: String,
}

/// The exchange echoes for each leg of a compound order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompoundEchoes {
    pub main: Option<Trade>,
    pub stop: Option<Trade>,
    pub tsl: Option<Trade>,
}

/// Per-leg error strings for a compound order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LegErrors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsl: Option<String>,
}

impl LegErrors {
    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.stop.is_none() && self.tsl.is_none()
    }
}

/// Every payload the bus carries. One variant per event key.
#[derive(Debug, Clone)]
pub enum BusEvent {
    CreateAccountCmd {
        correlation_id: String,
        command: AccountCommand,
        timestamp: Option<DateTime<Utc>>,
    },
    UpdateAccountCmd {
        correlation_id: String,
        command: AccountCommand,
        timestamp: Option<DateTime<Utc>>,
    },
    DeleteAccountCmd {
        correlation_id: String,
        account_id: String,
        timestamp: Option<DateTime<Utc>>,
    },
    CreateOrderCmd {
        correlation_id: String,
        request: CompoundOrderRequest,
    },
    UpdateOrderCmd {
        correlation_id: String,
        payload: serde_json::Value,
    },
    CancelOrderCmd {
        correlation_id: String,
        account_id: String,
        order_id: String,
    },
    PositionCloseCmd {
        correlation_id: String,
        request: CompoundOrderRequest,
    },
    PositionAddStopCmd {
        correlation_id: String,
        request: AttachStopRequest,
    },
    PositionAddTslCmd {
        correlation_id: String,
        request: AttachTslRequest,
    },
    AccountHeartbeat {
        account_id: String,
    },
    /// Result of a create command. `error` is `None` on success; a
    /// populated `account_id` is what drives queue rebinding.
    AccountCreated {
        correlation_id: String,
        account_id: Option<String>,
        error: Option<String>,
    },
    AccountUpdated {
        correlation_id: String,
        account_id: Option<String>,
        error: Option<String>,
    },
    /// Result of a delete command. A stale delete acknowledges with
    /// `account_id: None` so nothing downstream unbinds.
    AccountDeleted {
        correlation_id: String,
        account_id: Option<String>,
        error: Option<String>,
    },
    OrderCreated {
        correlation_id: String,
        orders: Option<CompoundEchoes>,
        errors: LegErrors,
    },
    OrderUpdated {
        account_id: String,
        trade: Trade,
    },
    OrderCanceled {
        correlation_id: String,
        order: Option<Trade>,
        error: Option<String>,
    },
    PositionClosed {
        correlation_id: String,
        order: Option<Trade>,
        error: Option<String>,
    },
    PositionAddedStop {
        correlation_id: String,
        order: Option<Trade>,
        error: Option<String>,
    },
    PositionAddedTsl {
        correlation_id: String,
        order: Option<Trade>,
        error: Option<String>,
    },
    MarginsUpdated {
        account_id: String,
        margins: Vec<MarginUpdate>,
    },
    PositionsUpdated {
        account_id: String,
        positions: Vec<Position>,
    },
    TickerUpdated {
        account_id: String,
        tickers: HashMap<String, Symbol>,
    },
    MyTradesUpdated {
        account_id: String,
        trades: Vec<Trade>,
    },
    OrderPlaced {
        account_id: String,
        order: Order,
    },
}

impl BusEvent {
    pub fn key(&self) -> EventKey {
        match self {
            Self::CreateAccountCmd { .. } => EventKey::CreateAccountCmd,
            Self::UpdateAccountCmd { .. } => EventKey::UpdateAccountCmd,
            Self::DeleteAccountCmd { .. } => EventKey::DeleteAccountCmd,
            Self::CreateOrderCmd { .. } => EventKey::CreateOrderCmd,
            Self::UpdateOrderCmd { .. } => EventKey::UpdateOrderCmd,
            Self::CancelOrderCmd { .. } => EventKey::CancelOrderCmd,
            Self::PositionCloseCmd { .. } => EventKey::PositionCloseCmd,
            Self::PositionAddStopCmd { .. } => EventKey::PositionAddStopCmd,
            Self::PositionAddTslCmd { .. } => EventKey::PositionAddTslCmd,
            Self::AccountHeartbeat { .. } => EventKey::AccountHeartbeat,
            Self::AccountCreated { .. } => EventKey::AccountCreatedEvent,
            Self::AccountUpdated { .. } => EventKey::AccountUpdatedEvent,
            Self::AccountDeleted { .. } => EventKey::AccountDeletedEvent,
            Self::OrderCreated { .. } => EventKey::OrderCreatedEvent,
            Self::OrderUpdated { .. } => EventKey::OrderUpdatedEvent,
            Self::OrderCanceled { .. } => EventKey::OrderCanceledEvent,
            Self::PositionClosed { .. } => EventKey::PositionClosedEvent,
            Self::PositionAddedStop { .. } => EventKey::PositionAddedStopEvent,
            Self::PositionAddedTsl { .. } => EventKey::PositionAddedTslEvent,
            Self::MarginsUpdated { .. } => EventKey::MarginsUpdatedEvent,
            Self::PositionsUpdated { .. } => EventKey::PositionsUpdatedEvent,
            Self::TickerUpdated { .. } => EventKey::TickerUpdatedEvent,
            Self::MyTradesUpdated { .. } => EventKey::MyTradesUpdatedEvent,
            Self::OrderPlaced { .. } => EventKey::OrderPlacedEvent,
        }
    }
}
