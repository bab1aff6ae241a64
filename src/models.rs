use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::TradeDate;

/// One daily market observation for a ticker, as loaded from the clean bar
/// table. Optional columns stay optional here; derivation rules live in the
/// price index and the tradability map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: String,
    pub date: TradeDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub open_adj: Option<f64>,
    pub close_adj: Option<f64>,
    pub volume: f64,
    pub amount: f64,
    pub pct_change: Option<f64>,
    pub is_st: Option<bool>,
    pub is_suspended: Option<bool>,
    pub is_limit_up: Option<bool>,
    pub is_limit_down: Option<bool>,
}

/// Which bar price a fill references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    #[default]
    Close,
    Open,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Close => "close",
            PriceSource::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellType {
    HoldingPeriod,
    StopLoss,
    Rebalance,
    Forced,
}

impl SellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellType::HoldingPeriod => "holding_period",
            SellType::StopLoss => "stop_loss",
            SellType::Rebalance => "rebalance",
            SellType::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossTriggerKind {
    Drawdown,
    Trailing,
    ConsecutiveLimitDown,
}

impl StopLossTriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopLossTriggerKind::Drawdown => "drawdown",
            StopLossTriggerKind::Trailing => "trailing",
            StopLossTriggerKind::ConsecutiveLimitDown => "consecutive_limit_down",
        }
    }
}

/// A single open position. Cash accounting runs on the unadjusted
/// `buy_trade_price`; return attribution runs on the back-adjusted
/// `buy_pnl_price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub ticker: String,
    pub shares: i64,
    pub buy_trade_price: Decimal,
    pub buy_pnl_price: f64,
    pub buy_cost_cash: Decimal,
    pub buy_date: TradeDate,
    pub exit_due_date: Option<TradeDate>,
}

impl Lot {
    /// Fees paid on the buy leg (cash outflow beyond the gross notional).
    pub fn buy_fee(&self) -> Decimal {
        self.buy_cost_cash - Decimal::from(self.shares) * self.buy_trade_price
    }
}

/// Append-only record of an executed fill. Sell legs carry the matched buy
/// prices and realized PnL on the adjusted basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub date: TradeDate,
    pub ticker: String,
    pub side: TradeSide,
    pub shares: i64,
    pub trade_price: Decimal,
    pub pnl_price: f64,
    pub gross_amount: Decimal,
    pub commission: Decimal,
    pub stamp_tax: Decimal,
    pub slippage: Decimal,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy_trade_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy_pnl_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_profit_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_profit_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_type: Option<SellType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_trigger: Option<StopLossTriggerKind>,
}

impl TradeRecord {
    pub fn total_fee(&self) -> Decimal {
        self.commission + self.stamp_tax + self.slippage
    }
}

/// One entry of a T-day target set, consumed on T+1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetWeight {
    pub ticker: String,
    pub weight: f64,
    pub reason: String,
}

/// Ordered ranker output, best candidate first.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub ticker: String,
    pub score: Option<f64>,
}

/// A deferred order waiting for the ticker to become tradable again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticker: String,
    pub side: TradeSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_notional: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<i64>,
    pub origin_date: TradeDate,
    pub first_enqueued_date: TradeDate,
    pub retries_used: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_type: Option<SellType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_trigger: Option<StopLossTriggerKind>,
}

/// One NAV curve entry, appended exactly once per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavPoint {
    pub date: TradeDate,
    pub cash: Decimal,
    pub market_value: Decimal,
    pub total_value: Decimal,
    pub nav: f64,
    pub daily_return: f64,
}

/// Serializable account snapshot for paper mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub cash: Decimal,
    pub positions: BTreeMap<String, Lot>,
    #[serde(default)]
    pub last_update: Option<TradeDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightMethod {
    #[default]
    Equal,
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UniverseScope {
    #[default]
    Mainboard,
    All,
}

impl UniverseScope {
    /// Mainboard tickers carry a 600/601/603/605 (SH) or 000/001 (SZ) code
    /// prefix; everything else (STAR, ChiNext, BSE) is out of scope.
    pub fn includes(&self, ticker: &str) -> bool {
        match self {
            UniverseScope::All => true,
            UniverseScope::Mainboard => {
                let code = ticker.split('.').next().unwrap_or(ticker);
                code.starts_with("600")
                    || code.starts_with("601")
                    || code.starts_with("603")
                    || code.starts_with("605")
                    || code.starts_with("000")
                    || code.starts_with("001")
            }
        }
    }
}

/// Exchange lot size: A-share orders fill in multiples of 100 shares.
pub const SHARE_LOT_SIZE: i64 = 100;

/// Trading days per year used to annualize volatility and returns.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
