use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::{NavPoint, TradeRecord, TradeSide, TRADING_DAYS_PER_YEAR};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub trading_days: usize,
    pub final_nav: f64,
    pub total_return_pct: f64,
    pub cagr: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub calmar_ratio: f64,
    pub round_trips: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: f64,
    pub avg_profit_pct: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// End-of-period statistics over the NAV curve and the realized trade
    /// log. Round-trip stats come from sell legs only.
    pub fn calculate(nav_history: &[NavPoint], trades: &[TradeRecord]) -> PerformanceSummary {
        let final_nav = nav_history.last().map(|p| p.nav).unwrap_or(1.0);
        let total_return_pct = (final_nav - 1.0) * 100.0;

        let daily_returns: Vec<f64> = nav_history.iter().map(|p| p.daily_return).collect();
        let (annualized_volatility, sharpe_ratio) = Self::sharpe(&daily_returns);
        let cagr = Self::cagr(final_nav, nav_history.len());
        let max_drawdown_pct = Self::max_drawdown_pct(nav_history);
        let calmar_ratio = if max_drawdown_pct > 0.0 {
            cagr / (max_drawdown_pct / 100.0)
        } else {
            0.0
        };

        let sells: Vec<&TradeRecord> = trades
            .iter()
            .filter(|t| t.side == TradeSide::Sell)
            .collect();
        let profits: Vec<f64> = sells
            .iter()
            .filter_map(|t| t.pnl_profit_pct)
            .map(|pct| pct * 100.0)
            .collect();
        let winning = profits.iter().filter(|p| **p > 0.0).count() as i64;
        let losing = profits.iter().filter(|p| **p < 0.0).count() as i64;
        let round_trips = sells.len() as i64;
        let win_rate = if round_trips > 0 {
            winning as f64 / round_trips as f64
        } else {
            0.0
        };
        let avg_profit_pct = if profits.is_empty() {
            0.0
        } else {
            profits.iter().sum::<f64>() / profits.len() as f64
        };
        let best_trade_pct = profits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst_trade_pct = profits.iter().copied().fold(f64::INFINITY, f64::min);

        PerformanceSummary {
            trading_days: nav_history.len(),
            final_nav,
            total_return_pct,
            cagr,
            annualized_volatility,
            sharpe_ratio,
            max_drawdown_pct,
            calmar_ratio,
            round_trips,
            winning_trades: winning,
            losing_trades: losing,
            win_rate,
            avg_profit_pct,
            best_trade_pct: if best_trade_pct.is_finite() { best_trade_pct } else { 0.0 },
            worst_trade_pct: if worst_trade_pct.is_finite() { worst_trade_pct } else { 0.0 },
        }
    }

    fn cagr(final_nav: f64, trading_days: usize) -> f64 {
        if trading_days == 0 || final_nav <= 0.0 {
            return 0.0;
        }
        let years = trading_days as f64 / TRADING_DAYS_PER_YEAR;
        if years <= 0.0 {
            return 0.0;
        }
        final_nav.powf(1.0 / years) - 1.0
    }

    fn sharpe(daily_returns: &[f64]) -> (f64, f64) {
        if daily_returns.len() < 2 {
            return (0.0, 0.0);
        }
        let mean_return = daily_returns.mean();
        let std_dev = daily_returns.std_dev();
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();
        if std_dev == 0.0 || !std_dev.is_finite() {
            return (0.0, 0.0);
        }
        let sharpe = mean_return * TRADING_DAYS_PER_YEAR / annualized_volatility;
        (annualized_volatility, sharpe)
    }

    fn max_drawdown_pct(nav_history: &[NavPoint]) -> f64 {
        let mut peak = f64::MIN;
        let mut max_drawdown = 0.0f64;
        for point in nav_history {
            peak = peak.max(point.nav);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((1.0 - point.nav / peak) * 100.0);
            }
        }
        max_drawdown
    }
}

impl PerformanceSummary {
    /// Render the report block the backtest verb prints.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("trading days        {:>12}\n", self.trading_days));
        out.push_str(&format!("final NAV           {:>12.4}\n", self.final_nav));
        out.push_str(&format!("total return        {:>11.2}%\n", self.total_return_pct));
        out.push_str(&format!("CAGR                {:>11.2}%\n", self.cagr * 100.0));
        out.push_str(&format!(
            "annualized vol      {:>11.2}%\n",
            self.annualized_volatility * 100.0
        ));
        out.push_str(&format!("Sharpe              {:>12.3}\n", self.sharpe_ratio));
        out.push_str(&format!("max drawdown        {:>11.2}%\n", self.max_drawdown_pct));
        out.push_str(&format!("Calmar              {:>12.3}\n", self.calmar_ratio));
        out.push_str(&format!("round trips         {:>12}\n", self.round_trips));
        out.push_str(&format!("win rate            {:>11.1}%\n", self.win_rate * 100.0));
        out.push_str(&format!("avg trade return    {:>11.2}%\n", self.avg_profit_pct));
        out
    }
}
