use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;
use super::symbol::merge_opt;

/// A position row, first seen via REST snapshot and merged from the
/// stream thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(default, alias = "isOpen")]
    pub is_open: Option<bool>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub underlying: Option<String>,
    #[serde(default, alias = "quoteCurrency")]
    pub quote_currency: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub leverage: Option<Decimal>,
    #[serde(
        default,
        alias = "simpleQty",
        with = "rust_decimal::serde::float_option"
    )]
    pub simple_quantity: Option<Decimal>,
    #[serde(
        default,
        alias = "currentQty",
        with = "rust_decimal::serde::float_option"
    )]
    pub current_quantity: Option<Decimal>,
    #[serde(
        default,
        alias = "markPrice",
        with = "rust_decimal::serde::float_option"
    )]
    pub mark_price: Option<Decimal>,
    #[serde(
        default,
        alias = "posMargin",
        with = "rust_decimal::serde::float_option"
    )]
    pub margin: Option<Decimal>,
    #[serde(
        default,
        alias = "maintMargin",
        with = "rust_decimal::serde::float_option"
    )]
    pub maintenance_margin: Option<Decimal>,
    #[serde(
        default,
        alias = "avgEntryPrice",
        with = "rust_decimal::serde::float_option"
    )]
    pub average_entry_price: Option<Decimal>,
}

impl Position {
    /// Long positions close by selling, shorts by buying.
    pub fn side(&self) -> OrderSide {
        if self.current_quantity.unwrap_or_default() > Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    pub fn merge(&mut self, newer: &Position) {
        if !newer.symbol.is_empty() {
            self.symbol = newer.symbol.clone();
        }
        merge_opt(&mut self.is_open, &newer.is_open);
        merge_opt(&mut self.currency, &newer.currency);
        merge_opt(&mut self.underlying, &newer.underlying);
        merge_opt(&mut self.quote_currency, &newer.quote_currency);
        merge_opt(&mut self.leverage, &newer.leverage);
        merge_opt(&mut self.simple_quantity, &newer.simple_quantity);
        merge_opt(&mut self.current_quantity, &newer.current_quantity);
        merge_opt(&mut self.mark_price, &newer.mark_price);
        merge_opt(&mut self.margin, &newer.margin);
        merge_opt(&mut self.maintenance_margin, &newer.maintenance_margin);
        merge_opt(&mut self.average_entry_price, &newer.average_entry_price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        serde_json::from_str(
            r#"{
                "symbol": "XBTUSD",
                "isOpen": true,
                "currency": "XBt",
                "underlying": "XBT",
                "quoteCurrency": "USD",
                "leverage": 10,
                "currentQty": 2500,
                "markPrice": 50100.5,
                "maintMargin": 125000
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn side_derives_from_quantity_sign() {
        let mut position = long_position();
        assert_eq!(position.side(), OrderSide::Buy);
        position.current_quantity = Some(dec!(-10));
        assert_eq!(position.side(), OrderSide::Sell);
    }

    #[test]
    fn merge_takes_present_fields_only() {
        let mut stored = long_position();
        let update = Position {
            symbol: "XBTUSD".into(),
            is_open: None,
            currency: None,
            underlying: None,
            quote_currency: None,
            leverage: None,
            simple_quantity: None,
            current_quantity: Some(dec!(1200)),
            mark_price: Some(dec!(50500)),
            margin: None,
            maintenance_margin: None,
            average_entry_price: None,
        };
        stored.merge(&update);
        assert_eq!(stored.current_quantity, Some(dec!(1200)));
        assert_eq!(stored.mark_price, Some(dec!(50500)));
        assert_eq!(stored.leverage, Some(dec!(10)));
        assert_eq!(stored.is_open, Some(true));
    }
}
