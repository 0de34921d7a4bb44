use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An exchange instrument row ("ticker"). Only instruments whose
/// `state` is `Open` are retained in the ticker set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol: String,
    #[serde(default)]
    pub state: String,
    /// Settlement currency; the margin row orders are sized against.
    #[serde(default, alias = "settlCurrency")]
    pub currency: Option<String>,
    #[serde(default)]
    pub underlying: Option<String>,
    #[serde(default, alias = "quoteCurrency")]
    pub quote_currency: Option<String>,
    #[serde(
        default,
        alias = "markPrice",
        with = "rust_decimal::serde::float_option"
    )]
    pub mark_price: Option<Decimal>,
    #[serde(default, alias = "lotSize", with = "rust_decimal::serde::float_option")]
    pub lot_size: Option<Decimal>,
    #[serde(default, alias = "maxPrice", with = "rust_decimal::serde::float_option")]
    pub max_price: Option<Decimal>,
    #[serde(
        default,
        alias = "maxOrderQty",
        with = "rust_decimal::serde::float_option"
    )]
    pub max_order_qty: Option<Decimal>,
    #[serde(default, alias = "tickSize", with = "rust_decimal::serde::float_option")]
    pub tick_size: Option<Decimal>,
    #[serde(
        default,
        alias = "lastPriceProtected",
        with = "rust_decimal::serde::float_option"
    )]
    pub last_price_protected: Option<Decimal>,
}

impl Symbol {
    pub fn is_open(&self) -> bool {
        self.state == "Open"
    }

    /// Number of decimal digits implied by the tick size
    /// (`0.5 -> 1`, `0.01 -> 2`, `5 -> 0`). Prices for this instrument
    /// are rounded at this precision.
    pub fn fractional_digits(&self) -> u32 {
        self.tick_size
            .map(|tick| tick.normalize().scale())
            .unwrap_or(0)
    }

    /// Take every field the newer row carries, keep the rest.
    pub fn merge(&mut self, newer: &Symbol) {
        if !newer.symbol.is_empty() {
            self.symbol = newer.symbol.clone();
        }
        if !newer.state.is_empty() {
            self.state = newer.state.clone();
        }
        merge_opt(&mut self.currency, &newer.currency);
        merge_opt(&mut self.underlying, &newer.underlying);
        merge_opt(&mut self.quote_currency, &newer.quote_currency);
        merge_opt(&mut self.mark_price, &newer.mark_price);
        merge_opt(&mut self.lot_size, &newer.lot_size);
        merge_opt(&mut self.max_price, &newer.max_price);
        merge_opt(&mut self.max_order_qty, &newer.max_order_qty);
        merge_opt(&mut self.tick_size, &newer.tick_size);
        merge_opt(&mut self.last_price_protected, &newer.last_price_protected);
    }
}

pub(crate) fn merge_opt<T: Clone>(current: &mut Option<T>, newer: &Option<T>) {
    if newer.is_some() {
        *current = newer.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(tick_size: Decimal) -> Symbol {
        Symbol {
            symbol: "XBTUSD".into(),
            state: "Open".into(),
            currency: Some("XBt".into()),
            underlying: Some("XBT".into()),
            quote_currency: Some("USD".into()),
            mark_price: Some(dec!(50000)),
            lot_size: Some(dec!(100)),
            max_price: None,
            max_order_qty: None,
            tick_size: Some(tick_size),
            last_price_protected: Some(dec!(50000.5)),
        }
    }

    #[test]
    fn fractional_digits_follow_tick_size() {
        assert_eq!(ticker(dec!(0.5)).fractional_digits(), 1);
        assert_eq!(ticker(dec!(0.01)).fractional_digits(), 2);
        assert_eq!(ticker(dec!(0.025)).fractional_digits(), 3);
        assert_eq!(ticker(dec!(5)).fractional_digits(), 0);
        assert_eq!(ticker(dec!(0.500)).fractional_digits(), 1);
    }

    #[test]
    fn decodes_exchange_shape() {
        let raw = r#"{
            "symbol": "ETHUSD",
            "state": "Open",
            "settlCurrency": "XBt",
            "underlying": "ETH",
            "quoteCurrency": "USD",
            "markPrice": 2000.55,
            "lotSize": 1,
            "tickSize": 0.05,
            "lastPriceProtected": 2000.6
        }"#;
        let symbol: Symbol = serde_json::from_str(raw).unwrap();
        assert!(symbol.is_open());
        assert_eq!(symbol.currency.as_deref(), Some("XBt"));
        assert_eq!(symbol.fractional_digits(), 2);
    }

    #[test]
    fn round_trips_internal_shape() {
        let original = ticker(dec!(0.5));
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn merge_keeps_old_fields_the_update_omits() {
        let mut stored = ticker(dec!(0.5));
        let update = Symbol {
            symbol: "XBTUSD".into(),
            state: String::new(),
            currency: None,
            underlying: None,
            quote_currency: None,
            mark_price: Some(dec!(51000)),
            lot_size: None,
            max_price: None,
            max_order_qty: None,
            tick_size: None,
            last_price_protected: None,
        };
        stored.merge(&update);
        assert_eq!(stored.mark_price, Some(dec!(51000)));
        assert_eq!(stored.state, "Open");
        assert_eq!(stored.tick_size, Some(dec!(0.5)));
    }
}
