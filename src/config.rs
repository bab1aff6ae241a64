use anyhow::{anyhow, ensure, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cost::CostModel;
use crate::equity_curve::{EquityCurveConfig, RecoveryMode};
use crate::models::{PriceSource, UniverseScope, WeightMethod};
use crate::risk_budget::RiskBudgetConfig;
use crate::stop_loss::StopLossConfig;

/// Durable paper-mode configuration, persisted as `paper/config.json`. The
/// backtest verb consumes the same schema. Every field has a default so a
/// partial file stays loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub buy_price: PriceSource,
    pub sell_price: PriceSource,
    pub top_n: usize,
    pub initial_capital: f64,
    pub rebalance_freq: u32,
    pub weight_method: WeightMethod,
    pub universe: UniverseScope,
    pub model_version: Option<i64>,
    pub holding_period: Option<u32>,
    pub batch_rebalance_tranches: Option<u32>,

    pub commission_rate: f64,
    pub min_commission: f64,
    pub stamp_tax_rate: f64,
    pub slippage_rate: f64,

    pub max_retries: u32,
    pub max_retry_days: u32,

    pub stop_loss_enabled: bool,
    pub stop_loss_drawdown_pct: f64,
    pub stop_loss_trailing_enabled: bool,
    pub stop_loss_trailing_pct: f64,
    pub stop_loss_consecutive_limit_down: u32,

    pub equity_curve_enabled: bool,
    pub equity_curve_drawdown_thresholds: Vec<f64>,
    pub equity_curve_exposure_levels: Vec<f64>,
    pub equity_curve_ma_short: usize,
    pub equity_curve_ma_long: usize,
    pub equity_curve_ma_exposure_on: f64,
    pub equity_curve_ma_exposure_off: f64,
    pub equity_curve_recovery_mode: RecoveryMode,
    pub equity_curve_recovery_step: f64,
    pub equity_curve_recovery_delay: u32,
    pub equity_curve_min_exposure: f64,
    pub equity_curve_max_exposure: f64,

    pub risk_budget_enabled: bool,
    pub vol_window: usize,
    pub vol_epsilon: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let equity = EquityCurveConfig::default();
        Self {
            buy_price: PriceSource::Close,
            sell_price: PriceSource::Close,
            top_n: 5,
            initial_capital: 500_000.0,
            rebalance_freq: 5,
            weight_method: WeightMethod::Equal,
            universe: UniverseScope::Mainboard,
            model_version: None,
            holding_period: Some(5),
            batch_rebalance_tranches: None,
            commission_rate: 0.0003,
            min_commission: 5.0,
            stamp_tax_rate: 0.001,
            slippage_rate: 0.001,
            max_retries: 5,
            max_retry_days: 10,
            stop_loss_enabled: false,
            stop_loss_drawdown_pct: 20.0,
            stop_loss_trailing_enabled: false,
            stop_loss_trailing_pct: 15.0,
            stop_loss_consecutive_limit_down: 2,
            equity_curve_enabled: false,
            equity_curve_drawdown_thresholds: equity.drawdown_thresholds,
            equity_curve_exposure_levels: equity.exposure_levels,
            equity_curve_ma_short: equity.ma_short_window,
            equity_curve_ma_long: equity.ma_long_window,
            equity_curve_ma_exposure_on: equity.ma_exposure_on,
            equity_curve_ma_exposure_off: equity.ma_exposure_off,
            equity_curve_recovery_mode: equity.recovery_mode,
            equity_curve_recovery_step: equity.recovery_step,
            equity_curve_recovery_delay: equity.recovery_delay_periods,
            equity_curve_min_exposure: equity.min_exposure,
            equity_curve_max_exposure: equity.max_exposure,
            risk_budget_enabled: false,
            vol_window: 20,
            vol_epsilon: 1e-4,
        }
    }
}

impl PaperConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.top_n > 0, "top_n must be positive (value: {})", self.top_n);
        require_positive(self.initial_capital, "initial_capital")?;
        ensure!(
            self.rebalance_freq > 0,
            "rebalance_freq must be positive (value: {})",
            self.rebalance_freq
        );
        require_rate(self.commission_rate, "commission_rate")?;
        require_non_negative(self.min_commission, "min_commission")?;
        require_rate(self.stamp_tax_rate, "stamp_tax_rate")?;
        require_rate(self.slippage_rate, "slippage_rate")?;
        if let Some(days) = self.holding_period {
            ensure!(days > 0, "holding_period must be positive when set");
        }
        if let Some(tranches) = self.batch_rebalance_tranches {
            ensure!(tranches > 1, "batch_rebalance_tranches must exceed 1 when set");
        }
        require_positive(self.stop_loss_drawdown_pct, "stop_loss_drawdown_pct")?;
        require_positive(self.stop_loss_trailing_pct, "stop_loss_trailing_pct")?;
        ensure!(
            self.stop_loss_consecutive_limit_down > 0,
            "stop_loss_consecutive_limit_down must be positive"
        );
        ensure!(self.vol_window > 1, "vol_window must exceed 1 (value: {})", self.vol_window);
        require_positive(self.vol_epsilon, "vol_epsilon")?;
        self.equity_curve_config().validate()?;
        Ok(())
    }

    pub fn cost_model(&self) -> Result<CostModel> {
        Ok(CostModel {
            commission_rate: decimal_setting(self.commission_rate, "commission_rate")?,
            min_commission: decimal_setting(self.min_commission, "min_commission")?,
            stamp_tax_rate: decimal_setting(self.stamp_tax_rate, "stamp_tax_rate")?,
            slippage_rate: decimal_setting(self.slippage_rate, "slippage_rate")?,
        })
    }

    pub fn stop_loss_config(&self) -> StopLossConfig {
        StopLossConfig {
            enabled: self.stop_loss_enabled,
            drawdown_pct: self.stop_loss_drawdown_pct,
            trailing_enabled: self.stop_loss_trailing_enabled,
            trailing_pct: self.stop_loss_trailing_pct,
            consecutive_limit_down: self.stop_loss_consecutive_limit_down,
        }
    }

    pub fn equity_curve_config(&self) -> EquityCurveConfig {
        EquityCurveConfig {
            enabled: self.equity_curve_enabled,
            drawdown_thresholds: self.equity_curve_drawdown_thresholds.clone(),
            exposure_levels: self.equity_curve_exposure_levels.clone(),
            ma_short_window: self.equity_curve_ma_short,
            ma_long_window: self.equity_curve_ma_long,
            ma_exposure_on: self.equity_curve_ma_exposure_on,
            ma_exposure_off: self.equity_curve_ma_exposure_off,
            recovery_mode: self.equity_curve_recovery_mode,
            recovery_step: self.equity_curve_recovery_step,
            recovery_delay_periods: self.equity_curve_recovery_delay,
            min_exposure: self.equity_curve_min_exposure,
            max_exposure: self.equity_curve_max_exposure,
        }
    }

    pub fn risk_budget_config(&self) -> RiskBudgetConfig {
        RiskBudgetConfig {
            enabled: self.risk_budget_enabled,
            vol_window: self.vol_window,
            vol_epsilon: self.vol_epsilon,
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            initial_capital: decimal_setting(self.initial_capital, "initial_capital")?,
            buy_price: self.buy_price,
            sell_price: self.sell_price,
            top_n: self.top_n,
            rebalance_freq: self.rebalance_freq,
            holding_period: self.holding_period,
            weight_method: self.weight_method,
            universe: self.universe,
            max_retries: self.max_retries,
            max_retry_days: self.max_retry_days,
            batch_tranches: self.batch_rebalance_tranches,
            cost: self.cost_model()?,
            stop_loss: self.stop_loss_config(),
            equity_curve: self.equity_curve_config(),
            risk_budget: self.risk_budget_config(),
        })
    }
}

/// Fully resolved engine configuration: the paper config with money lifted
/// into the decimal domain and sub-configs split per component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_capital: Decimal,
    pub buy_price: PriceSource,
    pub sell_price: PriceSource,
    pub top_n: usize,
    pub rebalance_freq: u32,
    pub holding_period: Option<u32>,
    pub weight_method: WeightMethod,
    pub universe: UniverseScope,
    pub max_retries: u32,
    pub max_retry_days: u32,
    pub batch_tranches: Option<u32>,
    pub cost: CostModel,
    pub stop_loss: StopLossConfig,
    pub equity_curve: EquityCurveConfig,
    pub risk_budget: RiskBudgetConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.initial_capital > Decimal::ZERO,
            "initial capital must be positive"
        );
        ensure!(self.top_n > 0, "top_n must be positive");
        ensure!(self.rebalance_freq > 0, "rebalance_freq must be positive");
        self.equity_curve.validate()?;
        Ok(())
    }
}

fn require_positive(value: f64, key: &str) -> Result<()> {
    ensure!(
        value.is_finite() && value > 0.0,
        "{} must be a positive number (value: {})",
        key,
        value
    );
    Ok(())
}

fn require_non_negative(value: f64, key: &str) -> Result<()> {
    ensure!(
        value.is_finite() && value >= 0.0,
        "{} must be a non-negative number (value: {})",
        key,
        value
    );
    Ok(())
}

fn require_rate(value: f64, key: &str) -> Result<()> {
    ensure!(
        value.is_finite() && (0.0..1.0).contains(&value),
        "{} must be a rate in [0, 1) (value: {})",
        key,
        value
    );
    Ok(())
}

fn decimal_setting(value: f64, key: &str) -> Result<Decimal> {
    ensure!(value.is_finite(), "{} must be finite (value: {})", key, value);
    Decimal::from_f64(value)
        .map(|d| d.round_dp(9))
        .ok_or_else(|| anyhow!("{} is not representable as decimal (value: {})", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PaperConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.engine_config().is_ok());
    }

    #[test]
    fn bad_rates_are_rejected() {
        let mut config = PaperConfig::default();
        config.commission_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = PaperConfig::default();
        config.initial_capital = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_enums() {
        let mut config = PaperConfig::default();
        config.buy_price = PriceSource::Open;
        config.weight_method = WeightMethod::Score;
        config.universe = UniverseScope::All;

        let raw = serde_json::to_string_pretty(&config).unwrap();
        let parsed: PaperConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.buy_price, PriceSource::Open);
        assert_eq!(parsed.weight_method, WeightMethod::Score);
        assert_eq!(parsed.universe, UniverseScope::All);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let parsed: PaperConfig = serde_json::from_str(r#"{"top_n": 3}"#).unwrap();
        assert_eq!(parsed.top_n, 3);
        assert_eq!(parsed.rebalance_freq, 5);
        assert_eq!(parsed.initial_capital, 500_000.0);
    }
}
