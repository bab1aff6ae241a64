use anyhow::{ensure, Result};
use rust_decimal::Decimal;

/// Fee breakdown for a single fill, in currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub commission: Decimal,
    pub stamp_tax: Decimal,
    pub slippage: Decimal,
}

impl Fees {
    pub fn total(&self) -> Decimal {
        self.commission + self.stamp_tax + self.slippage
    }
}

/// Pure mapping from gross notional and side to trading costs. Commission is
/// charged both ways with a floor, stamp tax on sells only, slippage both
/// ways.
#[derive(Debug, Clone)]
pub struct CostModel {
    pub commission_rate: Decimal,
    pub min_commission: Decimal,
    pub stamp_tax_rate: Decimal,
    pub slippage_rate: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(3, 4),  // 0.0003
            min_commission: Decimal::new(5, 0),   // 5.0
            stamp_tax_rate: Decimal::new(1, 3),   // 0.001
            slippage_rate: Decimal::new(1, 3),    // 0.001
        }
    }
}

impl CostModel {
    pub fn commission(&self, notional: Decimal) -> Decimal {
        (notional * self.commission_rate).max(self.min_commission)
    }

    pub fn buy_fees(&self, notional: Decimal) -> Result<Fees> {
        ensure!(
            notional >= Decimal::ZERO,
            "buy notional must be non-negative (value: {})",
            notional
        );
        Ok(Fees {
            commission: self.commission(notional),
            stamp_tax: Decimal::ZERO,
            slippage: notional * self.slippage_rate,
        })
    }

    pub fn sell_fees(&self, notional: Decimal) -> Result<Fees> {
        ensure!(
            notional >= Decimal::ZERO,
            "sell notional must be non-negative (value: {})",
            notional
        );
        Ok(Fees {
            commission: self.commission(notional),
            stamp_tax: notional * self.stamp_tax_rate,
            slippage: notional * self.slippage_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn commission_floor_applies_to_small_orders() {
        let model = CostModel::default();
        // 0.0003 * 1000 = 0.30, below the 5.00 floor
        assert_eq!(model.commission(dec!(1000)), dec!(5));
        assert_eq!(model.commission(dec!(100000)), dec!(30.0000));
    }

    #[test]
    fn sell_fees_include_stamp_tax() {
        let model = CostModel::default();
        let buy = model.buy_fees(dec!(100000)).unwrap();
        let sell = model.sell_fees(dec!(100000)).unwrap();
        assert_eq!(buy.stamp_tax, dec!(0));
        assert_eq!(sell.stamp_tax, dec!(100.000));
        assert_eq!(buy.slippage, dec!(100.000));
        assert_eq!(sell.total() - buy.total(), dec!(100.000));
    }

    #[test]
    fn negative_notional_is_rejected() {
        let model = CostModel::default();
        assert!(model.buy_fees(dec!(-1)).is_err());
        assert!(model.sell_fees(dec!(-1)).is_err());
    }
}
