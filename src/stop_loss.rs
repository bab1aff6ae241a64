use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::calendar::TradeDate;
use crate::models::{Lot, PriceSource, StopLossTriggerKind};
use crate::price_index::PriceIndex;
use crate::tradability::TradabilityMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub enabled: bool,
    pub drawdown_pct: f64,
    pub trailing_enabled: bool,
    pub trailing_pct: f64,
    pub consecutive_limit_down: u32,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drawdown_pct: 20.0,
            trailing_enabled: false,
            trailing_pct: 15.0,
            consecutive_limit_down: 2,
        }
    }
}

/// Monitor state for one held lot. Survives serialization in paper mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub high_water_pnl_price: f64,
    pub consecutive_limit_down_days: u32,
}

#[derive(Debug, Clone)]
pub struct StopLossTrigger {
    pub ticker: String,
    pub kind: StopLossTriggerKind,
    pub detail: String,
}

/// Per-position stop-loss monitor. Trigger precedence on a single day is
/// drawdown, then trailing, then consecutive limit-down; the first satisfied
/// trigger wins. Triggered sells execute on the next trading day via the
/// pending queue.
pub struct StopLossMonitor {
    config: StopLossConfig,
    state: BTreeMap<String, PositionRisk>,
}

impl StopLossMonitor {
    pub fn new(config: StopLossConfig) -> Self {
        Self {
            config,
            state: BTreeMap::new(),
        }
    }

    pub fn from_state(config: StopLossConfig, state: BTreeMap<String, PositionRisk>) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &BTreeMap<String, PositionRisk> {
        &self.state
    }

    pub fn purge(&mut self, ticker: &str) {
        self.state.remove(ticker);
    }

    /// Keep monitor keys in lock-step with the portfolio's position keys.
    /// State for closed positions is dropped; a held ticker without state is
    /// re-initialized from its lot.
    pub fn reconcile(&mut self, positions: &BTreeMap<String, Lot>) {
        self.state.retain(|ticker, _| positions.contains_key(ticker));
        for (ticker, lot) in positions {
            self.state.entry(ticker.clone()).or_insert_with(|| PositionRisk {
                high_water_pnl_price: lot.buy_pnl_price,
                consecutive_limit_down_days: 0,
            });
        }
    }

    /// Advance per-position state for `date` and collect triggers. Held
    /// tickers without a bar today keep yesterday's state untouched.
    pub fn update_and_check(
        &mut self,
        date: TradeDate,
        positions: &BTreeMap<String, Lot>,
        index: &PriceIndex,
        tradability: &TradabilityMap,
    ) -> Vec<StopLossTrigger> {
        self.reconcile(positions);
        if !self.config.enabled {
            return Vec::new();
        }

        let mut triggers = Vec::new();
        for (ticker, lot) in positions {
            let Ok(current) = index.pnl_price(date, ticker, PriceSource::Close) else {
                debug!("no bar for {} on {}, stop-loss state carried over", ticker, date);
                continue;
            };
            let risk = self.state.get_mut(ticker).expect("reconciled above");
            risk.high_water_pnl_price = risk.high_water_pnl_price.max(current);
            if tradability.is_limit_down(date, ticker) {
                risk.consecutive_limit_down_days += 1;
            } else {
                risk.consecutive_limit_down_days = 0;
            }

            let drawdown_floor = lot.buy_pnl_price * (1.0 - self.config.drawdown_pct / 100.0);
            if current <= drawdown_floor {
                let detail = format!(
                    "price {:.2} fell {:.1}% below buy {:.2}",
                    current,
                    (1.0 - current / lot.buy_pnl_price) * 100.0,
                    lot.buy_pnl_price
                );
                warn!("{} stop-loss trigger on {}: {}", ticker, date, detail);
                triggers.push(StopLossTrigger {
                    ticker: ticker.clone(),
                    kind: StopLossTriggerKind::Drawdown,
                    detail,
                });
                continue;
            }

            if self.config.trailing_enabled {
                let trailing_floor =
                    risk.high_water_pnl_price * (1.0 - self.config.trailing_pct / 100.0);
                if current <= trailing_floor {
                    let detail = format!(
                        "price {:.2} fell {:.1}% below high water {:.2}",
                        current,
                        (1.0 - current / risk.high_water_pnl_price) * 100.0,
                        risk.high_water_pnl_price
                    );
                    warn!("{} stop-loss trigger on {}: {}", ticker, date, detail);
                    triggers.push(StopLossTrigger {
                        ticker: ticker.clone(),
                        kind: StopLossTriggerKind::Trailing,
                        detail,
                    });
                    continue;
                }
            }

            if risk.consecutive_limit_down_days >= self.config.consecutive_limit_down {
                let detail = format!(
                    "{} consecutive limit-down days",
                    risk.consecutive_limit_down_days
                );
                warn!("{} stop-loss trigger on {}: {}", ticker, date, detail);
                triggers.push(StopLossTrigger {
                    ticker: ticker.clone(),
                    kind: StopLossTriggerKind::ConsecutiveLimitDown,
                    detail,
                });
            }
        }
        triggers
    }
}
