use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY", alias = "Buy", alias = "buy")]
    Buy,
    #[serde(rename = "SELL", alias = "Sell", alias = "sell")]
    Sell,
}

impl OrderSide {
    /// The exchange wire spelling ("Buy"/"Sell").
    pub fn as_exchange(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT", alias = "Limit")]
    Limit,
    #[serde(rename = "MARKET", alias = "Market")]
    Market,
    #[serde(rename = "STOP", alias = "Stop")]
    Stop,
}

impl OrderType {
    pub fn as_exchange(&self) -> &'static str {
        match self {
            Self::Limit => "Limit",
            Self::Market => "Market",
            Self::Stop => "Stop",
        }
    }
}

/// Price source that triggers a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopTriggerType {
    #[serde(rename = "LAST_PRICE")]
    LastPrice,
    #[serde(rename = "MARK_PRICE")]
    MarkPrice,
}

impl StopTriggerType {
    /// The execInst spelling of the trigger source.
    pub fn as_exec_inst(&self) -> &'static str {
        match self {
            Self::LastPrice => "LastPrice",
            Self::MarkPrice => "MarkPrice",
        }
    }

    /// The reference price this trigger reads from a ticker.
    pub fn reference_price(&self, ticker: &Symbol) -> Option<Decimal> {
        match self {
            Self::LastPrice => ticker.last_price_protected,
            Self::MarkPrice => ticker.mark_price,
        }
    }
}

/// An inbound order command. Constructed once from a command message
/// and never mutated after placement; exchange echoes are stored as
/// [`super::Trade`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(alias = "orderId")]
    pub id: String,
    #[serde(default, alias = "clOrderId")]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(alias = "orderType")]
    pub order_type: OrderType,
    #[serde(default, alias = "closeOrder")]
    pub close_order: bool,
    /// Whole-number percent of available margin to spend.
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub percent: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub leverage: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    #[serde(default, alias = "stopPrice", with = "rust_decimal::serde::float_option")]
    pub stop_price: Option<Decimal>,
    #[serde(
        default,
        alias = "stopTriggerType",
        deserialize_with = "deserialize_stop_trigger"
    )]
    pub stop_trigger_type: Option<StopTriggerType>,
    #[serde(
        default,
        alias = "trailingStopPercent",
        with = "rust_decimal::serde::float_option"
    )]
    pub trailing_stop_percent: Option<Decimal>,
}

impl Order {
    /// Invariants that must hold before any exchange call is made:
    /// stop orders carry a stop price, trailing orders carry both a
    /// trail percent and a trigger source.
    pub fn validate(&self) -> Result<()> {
        if self.order_type == OrderType::Stop
            && self.stop_price.is_none()
            && self.trailing_stop_percent.is_none()
        {
            return Err(Error::InvalidMessage(format!(
                "stop order {} is missing stopPrice",
                self.id
            )));
        }
        if self.trailing_stop_percent.is_some() && self.stop_trigger_type.is_none() {
            return Err(Error::InvalidMessage(format!(
                "trailing order {} is missing stopTriggerType",
                self.id
            )));
        }
        Ok(())
    }
}

/// The wire also spells "no trigger" as the string `"NONE"`; both
/// that and a missing field decode to `None`.
fn deserialize_stop_trigger<'de, D>(deserializer: D) -> std::result::Result<Option<StopTriggerType>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("NONE") | Some("") => Ok(None),
        Some("LAST_PRICE") => Ok(Some(StopTriggerType::LastPrice)),
        Some("MARK_PRICE") => Ok(Some(StopTriggerType::MarkPrice)),
        Some(other) => Err(serde::de::Error::unknown_variant(
            other,
            &["LAST_PRICE", "MARK_PRICE", "NONE"],
        )),
    }
}

/// The compound payload of a create-order command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundOrders {
    #[serde(default)]
    pub main: Option<Order>,
    #[serde(default)]
    pub stop: Option<Order>,
    #[serde(default)]
    pub tsl: Option<Order>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundOrderRequest {
    #[serde(default)]
    pub orders: CompoundOrders,
}

/// Attach a fixed stop to the open position on `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachStopRequest {
    pub symbol: String,
    #[serde(alias = "stopPrice", with = "rust_decimal::serde::float")]
    pub stop_price: Decimal,
    #[serde(alias = "stopTriggerPriceType")]
    pub stop_trigger_price_type: StopTriggerType,
}

/// Attach a trailing stop to the open position on `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachTslRequest {
    pub symbol: String,
    #[serde(alias = "tslPercent", with = "rust_decimal::serde::float")]
    pub tsl_percent: Decimal,
    #[serde(alias = "stopTriggerPriceType")]
    pub stop_trigger_price_type: StopTriggerType,
}

const MILLI_XBT: Decimal = dec!(0.001);

/// Fixed table of contract value multipliers for quanto instruments.
fn contract_multiplier(symbol: &str) -> Decimal {
    match symbol {
        "ETHUSD" => dec!(0.001) * MILLI_XBT,
        _ => Decimal::ONE,
    }
}

/// Value of one contract in XBT: the inverse price for XBT-margined
/// instruments, `price x multiplier` for everything else.
pub fn symbol_value_in_xbt(ticker: &Symbol, price: Decimal) -> Option<Decimal> {
    if ticker.underlying.as_deref() == Some("XBT") {
        if price.is_zero() {
            return None;
        }
        return Some(Decimal::ONE / price);
    }
    Some(price * contract_multiplier(&ticker.symbol))
}

/// Contracts to buy: spend `percent` of the available margin at
/// `leverage`, divided by the per-contract value, floored.
pub fn calculate_order_quantity(
    available_margin: Decimal,
    percent: Decimal,
    price: Decimal,
    leverage: Decimal,
    ticker: &Symbol,
) -> Decimal {
    if percent <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let fraction = percent / dec!(100);
    let margin_to_spend = (fraction * available_margin).round_dp(8);

    let Some(symbol_value) = symbol_value_in_xbt(ticker, price) else {
        return Decimal::ZERO;
    };
    if symbol_value.is_zero() {
        return Decimal::ZERO;
    }

    (margin_to_spend * leverage / symbol_value).floor()
}

/// Round a price down to the instrument tick, expressed at
/// `fractional_digits` precision.
pub fn round_down_to_tick(price: Decimal, tick_size: Decimal, fractional_digits: u32) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price.round_dp(fractional_digits);
    }
    ((price / tick_size).floor() * tick_size).round_dp(fractional_digits)
}

/// Append an idempotency nonce: the caller's clOrdID plus the first
/// four characters of a fresh UUID, so a retried placement never
/// collides with a half-accepted one.
pub fn nonce_client_order_id(base: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}", base, &uuid[..4])
}

/// Strip the nonce back off an echoed clOrdID: callers see only the
/// first two underscore-separated segments they submitted.
pub fn demangle_client_order_id(cl_ord_id: &str) -> String {
    cl_ord_id
        .split('_')
        .take(2)
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xbt_ticker() -> Symbol {
        serde_json::from_str(
            r#"{"symbol":"XBTUSD","state":"Open","underlying":"XBT","settlCurrency":"XBt","tickSize":0.5,"lastPriceProtected":50000}"#,
        )
        .unwrap()
    }

    fn eth_ticker() -> Symbol {
        serde_json::from_str(
            r#"{"symbol":"ETHUSD","state":"Open","underlying":"ETH","settlCurrency":"XBt","tickSize":0.05,"lastPriceProtected":2000}"#,
        )
        .unwrap()
    }

    #[test]
    fn quantity_for_xbt_margined_instrument() {
        let qty = calculate_order_quantity(
            dec!(1.0),
            dec!(50),
            dec!(50000),
            dec!(10),
            &xbt_ticker(),
        );
        assert_eq!(qty, dec!(250000));
    }

    #[test]
    fn quantity_for_quanto_instrument_uses_multiplier() {
        // 0.5 XBT at 10x over a contract value of 2000 * 1e-6 XBT.
        let qty =
            calculate_order_quantity(dec!(1.0), dec!(50), dec!(2000), dec!(10), &eth_ticker());
        assert_eq!(qty, dec!(2500));
    }

    #[test]
    fn non_positive_percent_yields_zero() {
        let qty =
            calculate_order_quantity(dec!(1.0), dec!(0), dec!(50000), dec!(10), &xbt_ticker());
        assert_eq!(qty, Decimal::ZERO);
        let qty =
            calculate_order_quantity(dec!(1.0), dec!(-5), dec!(50000), dec!(10), &xbt_ticker());
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn tick_rounding_floors_at_tick_precision() {
        assert_eq!(
            round_down_to_tick(dec!(12345.678), dec!(0.5), 1),
            dec!(12345.5)
        );
        assert_eq!(
            round_down_to_tick(dec!(2000.07), dec!(0.05), 2),
            dec!(2000.05)
        );
        assert_eq!(round_down_to_tick(dec!(99.99), dec!(5), 0), dec!(95));
    }

    #[test]
    fn nonce_appends_four_characters() {
        let nonced = nonce_client_order_id("abc_def");
        assert_eq!(nonced.len(), "abc_def".len() + 5);
        assert!(nonced.starts_with("abc_def_"));
    }

    #[test]
    fn demangle_keeps_first_two_segments() {
        assert_eq!(demangle_client_order_id("abc_def_a1b2"), "abc_def");
        assert_eq!(demangle_client_order_id("abc"), "abc");
        assert_eq!(demangle_client_order_id("a_b_c_d"), "a_b");
    }

    #[test]
    fn stop_order_requires_stop_price() {
        let order: Order = serde_json::from_str(
            r#"{"id":"1","symbol":"XBTUSD","side":"SELL","orderType":"STOP","percent":0,"leverage":10}"#,
        )
        .unwrap();
        assert!(order.validate().is_err());
    }

    #[test]
    fn trailing_order_requires_trigger_type() {
        let order: Order = serde_json::from_str(
            r#"{"id":"1","symbol":"XBTUSD","side":"SELL","orderType":"STOP","trailingStopPercent":2.5}"#,
        )
        .unwrap();
        assert!(order.validate().is_err());
    }

    #[test]
    fn none_trigger_type_decodes_as_absent() {
        let order: Order = serde_json::from_str(
            r#"{"id":"1","symbol":"XBTUSD","side":"BUY","orderType":"MARKET","stopTriggerType":"NONE"}"#,
        )
        .unwrap();
        assert!(order.stop_trigger_type.is_none());

        let order: Order = serde_json::from_str(
            r#"{"id":"1","symbol":"XBTUSD","side":"BUY","orderType":"MARKET","stopTriggerType":"MARK_PRICE"}"#,
        )
        .unwrap();
        assert_eq!(order.stop_trigger_type, Some(StopTriggerType::MarkPrice));
    }

    #[test]
    fn decodes_both_id_spellings() {
        let a: Order = serde_json::from_str(
            r#"{"orderId":"42","symbol":"XBTUSD","side":"BUY","orderType":"MARKET"}"#,
        )
        .unwrap();
        let b: Order = serde_json::from_str(
            r#"{"id":"42","symbol":"XBTUSD","side":"BUY","orderType":"MARKET"}"#,
        )
        .unwrap();
        assert_eq!(a.id, b.id);
    }
}
