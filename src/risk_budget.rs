use log::warn;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::calendar::TradeDate;
use crate::models::{TargetWeight, TRADING_DAYS_PER_YEAR};
use crate::price_index::PriceIndex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBudgetConfig {
    pub enabled: bool,
    pub vol_window: usize,
    pub vol_epsilon: f64,
}

impl Default for RiskBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            vol_window: 20,
            vol_epsilon: 1e-4,
        }
    }
}

/// Inverse-volatility reweighting of a target set. Volatility is the
/// annualized stdev of pnl-price log returns over `vol_window` trading days
/// strictly before the signal date; nothing dated on or after the signal
/// date is read.
pub struct RiskBudgetScaler {
    config: RiskBudgetConfig,
}

impl RiskBudgetScaler {
    pub fn new(config: RiskBudgetConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Annualized trailing volatility for one ticker, floored at
    /// `vol_epsilon`. Insufficient history degrades to the floor with a
    /// warning; such names should have been filtered upstream.
    pub fn trailing_volatility(&self, index: &PriceIndex, date: TradeDate, ticker: &str) -> f64 {
        let closes = index.pnl_closes_before(date, ticker, self.config.vol_window + 1);
        if closes.len() < self.config.vol_window + 1 {
            warn!(
                "{} has {} pnl closes before {}, below the {}-day vol window; using vol floor",
                ticker,
                closes.len(),
                date,
                self.config.vol_window
            );
            return self.config.vol_epsilon;
        }
        let returns: Vec<f64> = closes
            .windows(2)
            .filter(|pair| pair[0] > 0.0 && pair[1] > 0.0)
            .map(|pair| (pair[1] / pair[0]).ln())
            .collect();
        if returns.len() < 2 {
            return self.config.vol_epsilon;
        }
        let sigma = returns.std_dev() * TRADING_DAYS_PER_YEAR.sqrt();
        if sigma.is_finite() {
            sigma.max(self.config.vol_epsilon)
        } else {
            self.config.vol_epsilon
        }
    }

    /// Reweight in place, preserving the original weight sum. Identity when
    /// disabled.
    pub fn scale(&self, weights: &mut [TargetWeight], index: &PriceIndex, date: TradeDate) {
        if !self.config.enabled || weights.is_empty() {
            return;
        }

        let original_sum: f64 = weights.iter().map(|w| w.weight).sum();
        if original_sum <= 0.0 {
            return;
        }

        let mut scaled: Vec<f64> = Vec::with_capacity(weights.len());
        for target in weights.iter() {
            let sigma = self.trailing_volatility(index, date, &target.ticker);
            scaled.push(target.weight / sigma);
        }
        let scaled_sum: f64 = scaled.iter().sum();
        if scaled_sum <= 0.0 || !scaled_sum.is_finite() {
            return;
        }

        for (target, raw) in weights.iter_mut().zip(scaled) {
            target.weight = raw / scaled_sum * original_sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;

    fn bar(ticker: &str, date: TradeDate, close: f64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            date,
            open: None,
            high: None,
            low: None,
            close,
            open_adj: None,
            close_adj: Some(close),
            volume: 1000.0,
            amount: close * 1000.0,
            pct_change: None,
            is_st: None,
            is_suspended: None,
            is_limit_up: None,
            is_limit_down: None,
        }
    }

    fn dates(n: usize) -> Vec<TradeDate> {
        // Weekdays from 2023-01-02 onwards
        use chrono::Datelike;
        let mut out = Vec::new();
        let mut current = chrono::NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        while out.len() < n {
            if current.weekday().number_from_monday() <= 5 {
                out.push(TradeDate::parse(&current.format("%Y%m%d").to_string()).unwrap());
            }
            current = current.succ_opt().unwrap();
        }
        out
    }

    fn target(ticker: &str, weight: f64) -> TargetWeight {
        TargetWeight {
            ticker: ticker.to_string(),
            weight,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn calmer_ticker_gets_the_larger_weight() {
        let days = dates(25);
        let mut bars = Vec::new();
        for (i, day) in days.iter().enumerate() {
            // A oscillates mildly, B twice as hard
            let wiggle = if i % 2 == 0 { 1.0 } else { -1.0 };
            bars.push(bar("A", *day, 100.0 * (1.0 + 0.01 * wiggle)));
            bars.push(bar("B", *day, 100.0 * (1.0 + 0.02 * wiggle)));
        }
        let index = PriceIndex::build(&bars).unwrap();
        let config = RiskBudgetConfig {
            enabled: true,
            vol_window: 20,
            vol_epsilon: 1e-4,
        };
        let scaler = RiskBudgetScaler::new(config);

        let signal_date = days[24];
        let mut weights = vec![target("A", 0.5), target("B", 0.5)];
        scaler.scale(&mut weights, &index, signal_date);

        let sum: f64 = weights.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9, "weight sum must be preserved");
        assert!(
            weights[0].weight > weights[1].weight,
            "lower-vol ticker should be overweighted: {:?}",
            weights
        );
        // Vol ratio is roughly 2:1, so weights land near 2/3 and 1/3
        assert!((weights[0].weight - 2.0 / 3.0).abs() < 0.05);
    }

    #[test]
    fn short_history_falls_back_to_the_floor() {
        let days = dates(5);
        let bars: Vec<Bar> = days.iter().map(|d| bar("A", *d, 100.0)).collect();
        let index = PriceIndex::build(&bars).unwrap();
        let scaler = RiskBudgetScaler::new(RiskBudgetConfig {
            enabled: true,
            vol_window: 20,
            vol_epsilon: 1e-4,
        });
        let sigma = scaler.trailing_volatility(&index, days[4], "A");
        assert_eq!(sigma, 1e-4);
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let days = dates(3);
        let bars: Vec<Bar> = days.iter().map(|d| bar("A", *d, 100.0)).collect();
        let index = PriceIndex::build(&bars).unwrap();
        let scaler = RiskBudgetScaler::new(RiskBudgetConfig::default());
        let mut weights = vec![target("A", 0.7)];
        scaler.scale(&mut weights, &index, days[2]);
        assert_eq!(weights[0].weight, 0.7);
    }
}
