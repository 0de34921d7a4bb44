use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Conversion from the exchange's satoshi-like XBt units to XBT.
const XBT_PER_XBT_UNIT: Decimal = dec!(0.00000001);

/// A raw row of the exchange margin table. Values are in XBt units;
/// scaling happens once, when the row is folded into a [`Margin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginUpdate {
    pub currency: String,
    #[serde(
        default,
        alias = "availableMargin",
        with = "rust_decimal::serde::float_option"
    )]
    pub available_margin: Option<Decimal>,
    #[serde(
        default,
        alias = "marginBalance",
        with = "rust_decimal::serde::float_option"
    )]
    pub margin_balance: Option<Decimal>,
    #[serde(
        default,
        alias = "maintMargin",
        with = "rust_decimal::serde::float_option"
    )]
    pub maint_margin: Option<Decimal>,
}

/// Stored per-currency margin, in canonical XBT units.
///
/// Invariant: `available = balance - used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Margin {
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub used: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,
}

impl Margin {
    /// Fold a wire row into the stored record.
    ///
    /// `balance` takes the newer of `availableMargin` or
    /// `marginBalance`; `used` takes `maintMargin` when present, else
    /// the retained value. A row that resolves neither side is skipped
    /// (returns `None`).
    pub fn apply(existing: Option<&Margin>, update: &MarginUpdate) -> Option<Margin> {
        let balance = update
            .available_margin
            .or(update.margin_balance)
            .map(scale)?;
        let used = update
            .maint_margin
            .map(scale)
            .or_else(|| existing.map(|m| m.used))?;

        Some(Margin {
            currency: update.currency.clone(),
            balance,
            used,
            available: (balance - used).round_dp(8),
        })
    }
}

fn scale(raw: Decimal) -> Decimal {
    (raw * XBT_PER_XBT_UNIT).round_dp(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(avail: Option<i64>, bal: Option<i64>, maint: Option<i64>) -> MarginUpdate {
        MarginUpdate {
            currency: "XBt".into(),
            available_margin: avail.map(Decimal::from),
            margin_balance: bal.map(Decimal::from),
            maint_margin: maint.map(Decimal::from),
        }
    }

    #[test]
    fn scales_raw_units_once_at_ingest() {
        let merged = Margin::apply(None, &update(Some(150_000_000), None, Some(50_000_000)))
            .expect("row resolves");
        assert_eq!(merged.balance, dec!(1.5));
        assert_eq!(merged.used, dec!(0.5));
        assert_eq!(merged.available, dec!(1.0));
    }

    #[test]
    fn available_margin_wins_over_margin_balance() {
        let merged =
            Margin::apply(None, &update(Some(200_000_000), Some(100_000_000), Some(0)))
                .expect("row resolves");
        assert_eq!(merged.balance, dec!(2.0));
    }

    #[test]
    fn retains_used_when_maint_margin_absent() {
        let existing = Margin {
            currency: "XBt".into(),
            balance: dec!(1.0),
            used: dec!(0.25),
            available: dec!(0.75),
        };
        let merged = Margin::apply(Some(&existing), &update(Some(100_000_000), None, None))
            .expect("row resolves");
        assert_eq!(merged.used, dec!(0.25));
        assert_eq!(merged.available, dec!(0.75));
    }

    #[test]
    fn skips_rows_that_resolve_neither_side() {
        assert!(Margin::apply(None, &update(None, None, Some(1))).is_none());
        assert!(Margin::apply(None, &update(Some(1), None, None)).is_none());
    }

    #[test]
    fn decodes_exchange_and_internal_shapes() {
        let exchange: MarginUpdate = serde_json::from_str(
            r#"{"currency":"XBt","availableMargin":100000000,"maintMargin":0}"#,
        )
        .unwrap();
        let internal: MarginUpdate = serde_json::from_str(
            r#"{"currency":"XBt","available_margin":100000000,"maint_margin":0}"#,
        )
        .unwrap();
        assert_eq!(exchange, internal);
    }
}
