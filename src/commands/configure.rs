use std::path::Path;

use anyhow::{anyhow, Result};
use clap::Args;
use log::info;

use crate::config::PaperConfig;
use crate::equity_curve::RecoveryMode;
use crate::models::{PriceSource, UniverseScope, WeightMethod};
use crate::store::PaperStore;

/// Flags for the `config` verb. Unset flags keep the value already stored
/// in config.json (or the default on first use).
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Buy fill price: close or open
    #[arg(long)]
    pub buy_price: Option<String>,
    /// Sell fill price: close or open
    #[arg(long)]
    pub sell_price: Option<String>,
    /// Number of names to hold
    #[arg(long)]
    pub top_n: Option<usize>,
    /// Starting cash of the paper account
    #[arg(long)]
    pub initial_capital: Option<f64>,
    /// Rebalance cadence in trading days
    #[arg(long)]
    pub rebalance_freq: Option<u32>,
    /// Weighting: equal or score
    #[arg(long)]
    pub weight_method: Option<String>,
    /// Universe: mainboard or all
    #[arg(long)]
    pub universe: Option<String>,
    /// Model version forwarded to the ranker
    #[arg(long)]
    pub model_version: Option<i64>,
    /// Mandatory exit after this many trading days (0 disables)
    #[arg(long)]
    pub holding_period: Option<u32>,
    /// Split the target set across this many rebalance tranches
    #[arg(long)]
    pub batch_tranches: Option<u32>,
    #[arg(long)]
    pub commission_rate: Option<f64>,
    #[arg(long)]
    pub min_commission: Option<f64>,
    #[arg(long)]
    pub stamp_tax_rate: Option<f64>,
    #[arg(long)]
    pub slippage_rate: Option<f64>,
    #[arg(long)]
    pub max_retries: Option<u32>,
    #[arg(long)]
    pub max_retry_days: Option<u32>,
    #[arg(long)]
    pub stop_loss_enabled: Option<bool>,
    #[arg(long)]
    pub stop_loss_drawdown_pct: Option<f64>,
    #[arg(long)]
    pub stop_loss_trailing_enabled: Option<bool>,
    #[arg(long)]
    pub stop_loss_trailing_pct: Option<f64>,
    #[arg(long)]
    pub stop_loss_consecutive_limit_down: Option<u32>,
    #[arg(long)]
    pub equity_curve_enabled: Option<bool>,
    #[arg(long)]
    pub equity_curve_recovery_mode: Option<String>,
    #[arg(long)]
    pub risk_budget_enabled: Option<bool>,
    #[arg(long)]
    pub vol_window: Option<usize>,
    #[arg(long)]
    pub vol_epsilon: Option<f64>,
}

pub fn run(paper_root: &Path, args: ConfigArgs) -> Result<()> {
    let store = PaperStore::new(paper_root)?;
    let mut config = store.load_config()?.unwrap_or_default();
    apply(&mut config, args)?;
    config.validate()?;
    store.save_config(&config)?;
    info!("wrote {}", paper_root.join("config.json").display());
    Ok(())
}

fn apply(config: &mut PaperConfig, args: ConfigArgs) -> Result<()> {
    if let Some(raw) = args.buy_price {
        config.buy_price = parse_price_source(&raw)?;
    }
    if let Some(raw) = args.sell_price {
        config.sell_price = parse_price_source(&raw)?;
    }
    if let Some(value) = args.top_n {
        config.top_n = value;
    }
    if let Some(value) = args.initial_capital {
        config.initial_capital = value;
    }
    if let Some(value) = args.rebalance_freq {
        config.rebalance_freq = value;
    }
    if let Some(raw) = args.weight_method {
        config.weight_method = match raw.trim().to_ascii_lowercase().as_str() {
            "equal" => WeightMethod::Equal,
            "score" => WeightMethod::Score,
            other => return Err(anyhow!("weight_method must be equal or score (value: {})", other)),
        };
    }
    if let Some(raw) = args.universe {
        config.universe = match raw.trim().to_ascii_lowercase().as_str() {
            "mainboard" => UniverseScope::Mainboard,
            "all" => UniverseScope::All,
            other => return Err(anyhow!("universe must be mainboard or all (value: {})", other)),
        };
    }
    if args.model_version.is_some() {
        config.model_version = args.model_version;
    }
    if let Some(days) = args.holding_period {
        config.holding_period = if days == 0 { None } else { Some(days) };
    }
    if let Some(tranches) = args.batch_tranches {
        config.batch_rebalance_tranches = if tranches <= 1 { None } else { Some(tranches) };
    }
    if let Some(value) = args.commission_rate {
        config.commission_rate = value;
    }
    if let Some(value) = args.min_commission {
        config.min_commission = value;
    }
    if let Some(value) = args.stamp_tax_rate {
        config.stamp_tax_rate = value;
    }
    if let Some(value) = args.slippage_rate {
        config.slippage_rate = value;
    }
    if let Some(value) = args.max_retries {
        config.max_retries = value;
    }
    if let Some(value) = args.max_retry_days {
        config.max_retry_days = value;
    }
    if let Some(value) = args.stop_loss_enabled {
        config.stop_loss_enabled = value;
    }
    if let Some(value) = args.stop_loss_drawdown_pct {
        config.stop_loss_drawdown_pct = value;
    }
    if let Some(value) = args.stop_loss_trailing_enabled {
        config.stop_loss_trailing_enabled = value;
    }
    if let Some(value) = args.stop_loss_trailing_pct {
        config.stop_loss_trailing_pct = value;
    }
    if let Some(value) = args.stop_loss_consecutive_limit_down {
        config.stop_loss_consecutive_limit_down = value;
    }
    if let Some(value) = args.equity_curve_enabled {
        config.equity_curve_enabled = value;
    }
    if let Some(raw) = args.equity_curve_recovery_mode {
        config.equity_curve_recovery_mode = match raw.trim().to_ascii_lowercase().as_str() {
            "gradual" => RecoveryMode::Gradual,
            "immediate" => RecoveryMode::Immediate,
            other => {
                return Err(anyhow!(
                    "equity_curve_recovery_mode must be gradual or immediate (value: {})",
                    other
                ))
            }
        };
    }
    if let Some(value) = args.risk_budget_enabled {
        config.risk_budget_enabled = value;
    }
    if let Some(value) = args.vol_window {
        config.vol_window = value;
    }
    if let Some(value) = args.vol_epsilon {
        config.vol_epsilon = value;
    }
    Ok(())
}

fn parse_price_source(raw: &str) -> Result<PriceSource> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "close" => Ok(PriceSource::Close),
        "open" => Ok(PriceSource::Open),
        other => Err(anyhow!("price source must be close or open (value: {})", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> ConfigArgs {
        ConfigArgs {
            buy_price: None,
            sell_price: None,
            top_n: None,
            initial_capital: None,
            rebalance_freq: None,
            weight_method: None,
            universe: None,
            model_version: None,
            holding_period: None,
            batch_tranches: None,
            commission_rate: None,
            min_commission: None,
            stamp_tax_rate: None,
            slippage_rate: None,
            max_retries: None,
            max_retry_days: None,
            stop_loss_enabled: None,
            stop_loss_drawdown_pct: None,
            stop_loss_trailing_enabled: None,
            stop_loss_trailing_pct: None,
            stop_loss_consecutive_limit_down: None,
            equity_curve_enabled: None,
            equity_curve_recovery_mode: None,
            risk_budget_enabled: None,
            vol_window: None,
            vol_epsilon: None,
        }
    }

    #[test]
    fn overrides_apply_and_bad_enums_fail() {
        let mut config = PaperConfig::default();
        let mut args = empty_args();
        args.top_n = Some(10);
        args.buy_price = Some("open".to_string());
        args.holding_period = Some(0);
        apply(&mut config, args).unwrap();
        assert_eq!(config.top_n, 10);
        assert_eq!(config.buy_price, PriceSource::Open);
        assert_eq!(config.holding_period, None);

        let mut args = empty_args();
        args.universe = Some("star".to_string());
        assert!(apply(&mut config, args).is_err());
    }
}
