use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::merge_opt;

/// The state of an order as echoed by the exchange, created on the
/// first echo and merged field-wise on every subsequent one.
///
/// `side`, `order_type` and `status` stay plain strings: the
/// exchange's vocabulary for them is open-ended and we forward it
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(alias = "orderID")]
    pub order_id: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, alias = "ordType")]
    pub order_type: Option<String>,
    #[serde(default, alias = "ordStatus")]
    pub status: Option<String>,
    #[serde(default, alias = "orderQty", with = "rust_decimal::serde::float_option")]
    pub order_quantity: Option<Decimal>,
    #[serde(default, alias = "cumQty", with = "rust_decimal::serde::float_option")]
    pub filled_quantity: Option<Decimal>,
    #[serde(default, alias = "leavesQty", with = "rust_decimal::serde::float_option")]
    pub leaves_quantity: Option<Decimal>,
    #[serde(default, alias = "avgPx", with = "rust_decimal::serde::float_option")]
    pub avg_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    #[serde(default, alias = "clOrdID")]
    pub client_order_id: Option<String>,
    #[serde(default, alias = "clOrdLinkID")]
    pub client_order_link_id: Option<String>,
    #[serde(default, alias = "pegPriceType")]
    pub peg_price_type: Option<String>,
    #[serde(
        default,
        alias = "pegOffsetValue",
        with = "rust_decimal::serde::float_option"
    )]
    pub peg_offset_value: Option<Decimal>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "stopPx", with = "rust_decimal::serde::float_option")]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Trade {
    /// Filled amount: `orderQty - leavesQty` when the echo carries
    /// both, otherwise whatever cumulative figure it reported.
    pub fn filled(&self) -> Option<Decimal> {
        match (self.order_quantity, self.leaves_quantity) {
            (Some(qty), Some(leaves)) => Some(qty - leaves),
            _ => self.filled_quantity,
        }
    }

    /// True once the exchange attached a status to the echo; the
    /// adapter treats status-less responses as retryable anomalies.
    pub fn has_status(&self) -> bool {
        self.status.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn merge(&mut self, newer: &Trade) {
        if !newer.order_id.is_empty() {
            self.order_id = newer.order_id.clone();
        }
        merge_opt(&mut self.symbol, &newer.symbol);
        merge_opt(&mut self.side, &newer.side);
        merge_opt(&mut self.order_type, &newer.order_type);
        merge_opt(&mut self.status, &newer.status);
        merge_opt(&mut self.order_quantity, &newer.order_quantity);
        merge_opt(&mut self.filled_quantity, &newer.filled_quantity);
        merge_opt(&mut self.leaves_quantity, &newer.leaves_quantity);
        merge_opt(&mut self.avg_price, &newer.avg_price);
        merge_opt(&mut self.price, &newer.price);
        merge_opt(&mut self.client_order_id, &newer.client_order_id);
        merge_opt(&mut self.client_order_link_id, &newer.client_order_link_id);
        merge_opt(&mut self.peg_price_type, &newer.peg_price_type);
        merge_opt(&mut self.peg_offset_value, &newer.peg_offset_value);
        merge_opt(&mut self.text, &newer.text);
        merge_opt(&mut self.stop_price, &newer.stop_price);
        merge_opt(&mut self.timestamp, &newer.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn echo() -> Trade {
        serde_json::from_str(
            r#"{
                "orderID": "ord-1",
                "symbol": "XBTUSD",
                "side": "Buy",
                "ordType": "Limit",
                "ordStatus": "New",
                "orderQty": 1000,
                "leavesQty": 400,
                "price": 49000.5,
                "clOrdID": "abc_def_a1b2",
                "text": "Submitted via API."
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn decodes_exchange_casing() {
        let trade = echo();
        assert_eq!(trade.order_id, "ord-1");
        assert_eq!(trade.side.as_deref(), Some("Buy"));
        assert_eq!(trade.order_type.as_deref(), Some("Limit"));
        assert!(trade.has_status());
    }

    #[test]
    fn filled_prefers_order_minus_leaves() {
        let trade = echo();
        assert_eq!(trade.filled(), Some(dec!(600)));

        let partial: Trade =
            serde_json::from_str(r#"{"orderID":"ord-2","cumQty":70}"#).unwrap();
        assert_eq!(partial.filled(), Some(dec!(70)));
    }

    #[test]
    fn merge_is_last_write_wins_per_field() {
        let mut stored = echo();
        let newer: Trade = serde_json::from_str(
            r#"{"orderID":"ord-1","ordStatus":"Filled","leavesQty":0,"avgPx":49000.25}"#,
        )
        .unwrap();
        stored.merge(&newer);
        assert_eq!(stored.status.as_deref(), Some("Filled"));
        assert_eq!(stored.leaves_quantity, Some(dec!(0)));
        assert_eq!(stored.avg_price, Some(dec!(49000.25)));
        assert_eq!(stored.price, Some(dec!(49000.5)));
        assert_eq!(stored.client_order_id.as_deref(), Some("abc_def_a1b2"));
    }

    #[test]
    fn status_less_echo_fails_the_success_predicate() {
        let trade: Trade = serde_json::from_str(r#"{"orderID":"ord-3"}"#).unwrap();
        assert!(!trade.has_status());
    }

    #[test]
    fn round_trips_internal_shape() {
        let original = echo();
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }
}
