use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Result};
use log::{debug, warn};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::calendar::TradeDate;
use crate::cost::CostModel;
use crate::models::{
    AccountState, Lot, NavPoint, PriceSource, SellType, StopLossTriggerKind, TradeRecord,
    TradeSide, SHARE_LOT_SIZE,
};
use crate::price_index::PriceIndex;

/// Lift an f64 price into the decimal cash domain.
pub fn decimal_price(value: f64) -> Result<Decimal> {
    ensure!(value.is_finite(), "price is not finite: {}", value);
    Decimal::from_f64(value)
        .map(|d| d.round_dp(6))
        .ok_or_else(|| anyhow!("price {} is not representable as decimal", value))
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuyOutcome {
    Filled { shares: i64 },
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum SellOutcome {
    Filled { shares: i64 },
    Skipped { reason: &'static str },
}

/// Cash, open lots and the append-only trade log. Cash accounting runs in
/// decimal on unadjusted prices; return attribution runs on the adjusted
/// plane. One lot per ticker at any time.
pub struct Portfolio {
    initial_capital: Decimal,
    cash: Decimal,
    positions: BTreeMap<String, Lot>,
    trade_log: Vec<TradeRecord>,
    nav_history: Vec<NavPoint>,
    last_nav: f64,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal) -> Result<Self> {
        ensure!(
            initial_capital > Decimal::ZERO,
            "initial capital must be positive (value: {})",
            initial_capital
        );
        Ok(Self {
            initial_capital,
            cash: initial_capital,
            positions: BTreeMap::new(),
            trade_log: Vec::new(),
            nav_history: Vec::new(),
            last_nav: 1.0,
        })
    }

    /// Rebuild a portfolio from persisted account state (paper mode). The
    /// trade log starts empty; only fills of the current run accumulate.
    pub fn from_account_state(
        initial_capital: Decimal,
        state: AccountState,
        last_nav: Option<f64>,
    ) -> Result<Self> {
        let mut portfolio = Self::new(initial_capital)?;
        ensure!(
            state.cash >= Decimal::ZERO,
            "persisted cash is negative: {}",
            state.cash
        );
        for (ticker, lot) in &state.positions {
            ensure!(
                lot.shares > 0 && lot.shares % SHARE_LOT_SIZE == 0,
                "persisted lot for {} has invalid share count {}",
                ticker,
                lot.shares
            );
        }
        portfolio.cash = state.cash;
        portfolio.positions = state.positions;
        portfolio.last_nav = last_nav.unwrap_or(1.0);
        Ok(portfolio)
    }

    pub fn to_account_state(&self, last_update: Option<TradeDate>) -> AccountState {
        AccountState {
            cash: self.cash,
            positions: self.positions.clone(),
            last_update,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn positions(&self) -> &BTreeMap<String, Lot> {
        &self.positions
    }

    pub fn position(&self, ticker: &str) -> Option<&Lot> {
        self.positions.get(ticker)
    }

    pub fn has_position(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trade_log
    }

    pub fn nav_history(&self) -> &[NavPoint] {
        &self.nav_history
    }

    /// Equity used to size new orders: cash plus positions valued at the
    /// day's execution prices, falling back to the last known pnl price for
    /// tickers without a bar.
    pub fn total_value_at(
        &self,
        index: &PriceIndex,
        date: TradeDate,
        source: PriceSource,
    ) -> Result<Decimal> {
        let mut total = self.cash;
        for (ticker, lot) in &self.positions {
            let price = match index.trade_price(date, ticker, source) {
                Ok(price) => price,
                Err(_) => index
                    .last_pnl_price_at_or_before(date, ticker)
                    .unwrap_or(lot.buy_pnl_price),
            };
            total += Decimal::from(lot.shares) * decimal_price(price)?;
        }
        Ok(total)
    }

    /// Open a lot. Shares floor to the exchange lot size; the cash check
    /// includes fees. Failures below the corruption class come back as
    /// `Skipped` outcomes.
    #[allow(clippy::too_many_arguments)]
    pub fn buy(
        &mut self,
        index: &PriceIndex,
        cost: &CostModel,
        ticker: &str,
        date: TradeDate,
        target_notional: Decimal,
        source: PriceSource,
        exit_due_date: Option<TradeDate>,
        reason: &str,
    ) -> Result<BuyOutcome> {
        if self.positions.contains_key(ticker) {
            warn!("{} already holds an open lot, rejecting second entry", ticker);
            return Ok(BuyOutcome::Skipped {
                reason: "already_held",
                details: None,
            });
        }
        if target_notional <= Decimal::ZERO {
            return Ok(BuyOutcome::Skipped {
                reason: "insufficient_notional",
                details: Some(format!("target notional {}", target_notional)),
            });
        }

        let trade_price_raw = match index.trade_price(date, ticker, source) {
            Ok(price) => price,
            Err(err) => {
                return Ok(BuyOutcome::Skipped {
                    reason: err.reason(),
                    details: None,
                })
            }
        };
        ensure!(
            trade_price_raw.is_finite() && trade_price_raw > 0.0,
            "buy price for {} on {} is not positive: {}",
            ticker,
            date,
            trade_price_raw
        );
        let trade_price = decimal_price(trade_price_raw)?;

        let raw_shares = (target_notional / trade_price)
            .floor()
            .to_i64()
            .ok_or_else(|| anyhow!("share count overflow for {} on {}", ticker, date))?;
        let mut shares = raw_shares - raw_shares % SHARE_LOT_SIZE;
        if shares < SHARE_LOT_SIZE {
            return Ok(BuyOutcome::Skipped {
                reason: "insufficient_notional",
                details: Some(format!(
                    "target {:.2} buys {} shares at {}",
                    target_notional, raw_shares, trade_price
                )),
            });
        }

        let mut notional = Decimal::from(shares) * trade_price;
        let mut fees = cost.buy_fees(notional)?;
        if notional + fees.total() > self.cash {
            // Shrink to what the cash can carry, fees included.
            let budget = self.cash - fees.total();
            let affordable = if budget > Decimal::ZERO {
                (budget / trade_price)
                    .floor()
                    .to_i64()
                    .ok_or_else(|| anyhow!("share count overflow for {} on {}", ticker, date))?
            } else {
                0
            };
            shares = affordable - affordable % SHARE_LOT_SIZE;
            if shares < SHARE_LOT_SIZE {
                return Ok(BuyOutcome::Skipped {
                    reason: "insufficient_cash",
                    details: Some(format!(
                        "target {:.2} exceeds cash {:.2}",
                        target_notional, self.cash
                    )),
                });
            }
            notional = Decimal::from(shares) * trade_price;
            fees = cost.buy_fees(notional)?;
        }
        let total_cost = notional + fees.total();
        if total_cost > self.cash {
            return Ok(BuyOutcome::Skipped {
                reason: "insufficient_cash",
                details: Some(format!("need {:.2}, have {:.2}", total_cost, self.cash)),
            });
        }

        let pnl_price = index
            .pnl_price(date, ticker, source)
            .map_err(|err| anyhow!("{}", err))?;

        self.cash -= total_cost;
        self.positions.insert(
            ticker.to_string(),
            Lot {
                ticker: ticker.to_string(),
                shares,
                buy_trade_price: trade_price,
                buy_pnl_price: pnl_price,
                buy_cost_cash: total_cost,
                buy_date: date,
                exit_due_date,
            },
        );
        self.trade_log.push(TradeRecord {
            id: Uuid::new_v4().to_string(),
            date,
            ticker: ticker.to_string(),
            side: TradeSide::Buy,
            shares,
            trade_price,
            pnl_price,
            gross_amount: notional,
            commission: fees.commission,
            stamp_tax: fees.stamp_tax,
            slippage: fees.slippage,
            reason: reason.to_string(),
            buy_trade_price: None,
            buy_pnl_price: None,
            pnl_profit_amount: None,
            pnl_profit_pct: None,
            sell_type: None,
            stop_loss_trigger: None,
        });
        debug!(
            "buy {} x{} at {} on {} (cost {:.2})",
            ticker, shares, trade_price, date, total_cost
        );

        Ok(BuyOutcome::Filled { shares })
    }

    /// Close the lot for `ticker` in full. Realized PnL is computed on the
    /// adjusted basis against the matched buy leg, net of round-trip fees.
    #[allow(clippy::too_many_arguments)]
    pub fn sell(
        &mut self,
        index: &PriceIndex,
        cost: &CostModel,
        ticker: &str,
        date: TradeDate,
        source: PriceSource,
        sell_type: SellType,
        trigger: Option<StopLossTriggerKind>,
        reason: &str,
    ) -> Result<SellOutcome> {
        if !self.positions.contains_key(ticker) {
            return Ok(SellOutcome::Skipped { reason: "not_held" });
        }

        let sell_trade_price_raw = match index.trade_price(date, ticker, source) {
            Ok(price) => price,
            Err(err) => {
                return Ok(SellOutcome::Skipped {
                    reason: err.reason(),
                })
            }
        };
        let sell_trade_price = decimal_price(sell_trade_price_raw)?;
        let sell_pnl_price = index
            .pnl_price(date, ticker, source)
            .map_err(|err| anyhow!("{}", err))?;

        let lot = self.positions.remove(ticker).expect("checked above");
        let shares = lot.shares;
        let notional = Decimal::from(shares) * sell_trade_price;
        let fees = cost.sell_fees(notional)?;
        self.cash += notional - fees.total();

        let pnl_buy_notional = Decimal::from(shares) * decimal_price(lot.buy_pnl_price)?;
        let pnl_sell_notional = Decimal::from(shares) * decimal_price(sell_pnl_price)?;
        let round_trip_fees = lot.buy_fee() + fees.total();
        let profit_amount = pnl_sell_notional - pnl_buy_notional - round_trip_fees;
        let cost_basis = pnl_buy_notional + lot.buy_fee();
        let profit_pct = if cost_basis > Decimal::ZERO {
            (profit_amount / cost_basis).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        self.trade_log.push(TradeRecord {
            id: Uuid::new_v4().to_string(),
            date,
            ticker: ticker.to_string(),
            side: TradeSide::Sell,
            shares,
            trade_price: sell_trade_price,
            pnl_price: sell_pnl_price,
            gross_amount: notional,
            commission: fees.commission,
            stamp_tax: fees.stamp_tax,
            slippage: fees.slippage,
            reason: reason.to_string(),
            buy_trade_price: Some(lot.buy_trade_price),
            buy_pnl_price: Some(lot.buy_pnl_price),
            pnl_profit_amount: Some(profit_amount),
            pnl_profit_pct: Some(profit_pct),
            sell_type: Some(sell_type),
            stop_loss_trigger: trigger,
        });
        debug!(
            "sell {} x{} at {} on {} ({}, pnl {:.2})",
            ticker,
            shares,
            sell_trade_price,
            date,
            sell_type.as_str(),
            profit_amount
        );

        Ok(SellOutcome::Filled { shares })
    }

    /// Value the book on pnl prices and append one NAV point. Held tickers
    /// without a bar on `date` reuse their last known pnl price.
    pub fn mark_to_market(&mut self, index: &PriceIndex, date: TradeDate) -> Result<NavPoint> {
        let mut market_value = Decimal::ZERO;
        for (ticker, lot) in &self.positions {
            let price = match index.pnl_price(date, ticker, PriceSource::Close) {
                Ok(price) => price,
                Err(_) => {
                    let fallback = index
                        .last_pnl_price_at_or_before(date, ticker)
                        .unwrap_or(lot.buy_pnl_price);
                    warn!(
                        "no bar for held ticker {} on {}, marking at last known price {}",
                        ticker, date, fallback
                    );
                    fallback
                }
            };
            market_value += Decimal::from(lot.shares) * decimal_price(price)?;
        }

        self.check_integrity()?;

        let total_value = self.cash + market_value;
        let nav = (total_value / self.initial_capital)
            .to_f64()
            .ok_or_else(|| anyhow!("nav is not representable on {}", date))?;
        ensure!(nav.is_finite(), "nav is not finite on {}", date);
        let daily_return = if self.last_nav > 0.0 {
            nav / self.last_nav - 1.0
        } else {
            0.0
        };

        let point = NavPoint {
            date,
            cash: self.cash,
            market_value,
            total_value,
            nav,
            daily_return,
        };
        self.last_nav = nav;
        self.nav_history.push(point.clone());
        Ok(point)
    }

    /// Corruption-class checks; any failure aborts the run.
    fn check_integrity(&self) -> Result<()> {
        ensure!(self.cash >= Decimal::ZERO, "cash went negative: {}", self.cash);
        for (ticker, lot) in &self.positions {
            ensure!(
                lot.shares > 0 && lot.shares % SHARE_LOT_SIZE == 0,
                "lot for {} has invalid share count {}",
                ticker,
                lot.shares
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use rust_decimal_macros::dec;

    fn bar(ticker: &str, date: &str, close: f64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            date: TradeDate::parse(date).unwrap(),
            open: None,
            high: None,
            low: None,
            close,
            open_adj: None,
            close_adj: Some(close),
            volume: 1_000_000.0,
            amount: close * 1_000_000.0,
            pct_change: None,
            is_st: None,
            is_suspended: None,
            is_limit_up: None,
            is_limit_down: None,
        }
    }

    fn setup() -> (PriceIndex, CostModel) {
        let bars = vec![bar("000001.SZ", "20230103", 10.0), bar("000001.SZ", "20230104", 12.0)];
        (PriceIndex::build(&bars).unwrap(), CostModel::default())
    }

    #[test]
    fn buy_floors_to_full_lots_and_charges_fees() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let date = TradeDate::parse("20230103").unwrap();

        let outcome = portfolio
            .buy(&index, &cost, "000001.SZ", date, dec!(10050), PriceSource::Close, None, "test")
            .unwrap();
        assert_eq!(outcome, BuyOutcome::Filled { shares: 1000 });

        let lot = portfolio.position("000001.SZ").unwrap();
        assert_eq!(lot.shares, 1000);
        assert_eq!(lot.buy_trade_price, dec!(10));
        // notional 10000, commission floor 5, slippage 10
        assert_eq!(lot.buy_cost_cash, dec!(10015.000));
        assert_eq!(portfolio.cash(), dec!(89985.000));
    }

    #[test]
    fn sub_lot_order_is_skipped() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let date = TradeDate::parse("20230103").unwrap();

        let outcome = portfolio
            .buy(&index, &cost, "000001.SZ", date, dec!(500), PriceSource::Close, None, "test")
            .unwrap();
        assert!(matches!(
            outcome,
            BuyOutcome::Skipped { reason: "insufficient_notional", .. }
        ));
        assert!(portfolio.positions().is_empty());
    }

    #[test]
    fn second_entry_for_held_ticker_is_rejected() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let date = TradeDate::parse("20230103").unwrap();

        portfolio
            .buy(&index, &cost, "000001.SZ", date, dec!(10000), PriceSource::Close, None, "test")
            .unwrap();
        let outcome = portfolio
            .buy(&index, &cost, "000001.SZ", date, dec!(10000), PriceSource::Close, None, "test")
            .unwrap();
        assert!(matches!(outcome, BuyOutcome::Skipped { reason: "already_held", .. }));
    }

    #[test]
    fn sell_realizes_pnl_on_the_adjusted_basis() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let buy_date = TradeDate::parse("20230103").unwrap();
        let sell_date = TradeDate::parse("20230104").unwrap();

        portfolio
            .buy(&index, &cost, "000001.SZ", buy_date, dec!(100000), PriceSource::Close, None, "test")
            .unwrap();
        let buy_fee = portfolio.position("000001.SZ").unwrap().buy_fee();

        let outcome = portfolio
            .sell(
                &index,
                &cost,
                "000001.SZ",
                sell_date,
                PriceSource::Close,
                SellType::HoldingPeriod,
                None,
                "holding period",
            )
            .unwrap();
        assert_eq!(outcome, SellOutcome::Filled { shares: 9900 });

        let record = portfolio.trades().last().unwrap();
        let sell_fee = record.total_fee();
        // 9900 shares bought at 10, sold at 12
        let expected_profit = dec!(118800) - dec!(99000) - buy_fee - sell_fee;
        assert_eq!(record.pnl_profit_amount.unwrap(), expected_profit);
        assert_eq!(record.buy_trade_price.unwrap(), dec!(10));
        assert!(record.pnl_profit_pct.unwrap() > 0.19);
        assert!(portfolio.positions().is_empty());
    }

    #[test]
    fn cash_short_buy_shrinks_to_affordable_lots() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let date = TradeDate::parse("20230103").unwrap();

        let outcome = portfolio
            .buy(&index, &cost, "000001.SZ", date, dec!(200000), PriceSource::Close, None, "test")
            .unwrap();
        // fees estimated on the full target leave room for 9900 shares
        assert_eq!(outcome, BuyOutcome::Filled { shares: 9900 });
        assert!(portfolio.cash() >= Decimal::ZERO);
    }

    #[test]
    fn selling_an_unheld_ticker_is_skipped() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let date = TradeDate::parse("20230103").unwrap();
        let outcome = portfolio
            .sell(
                &index,
                &cost,
                "000001.SZ",
                date,
                PriceSource::Close,
                SellType::Rebalance,
                None,
                "exit",
            )
            .unwrap();
        assert_eq!(outcome, SellOutcome::Skipped { reason: "not_held" });
    }

    #[test]
    fn mark_to_market_tracks_nav_and_cash_identity() {
        let (index, cost) = setup();
        let mut portfolio = Portfolio::new(dec!(100000)).unwrap();
        let buy_date = TradeDate::parse("20230103").unwrap();
        let next = TradeDate::parse("20230104").unwrap();

        portfolio
            .buy(&index, &cost, "000001.SZ", buy_date, dec!(50000), PriceSource::Close, None, "test")
            .unwrap();
        let first = portfolio.mark_to_market(&index, buy_date).unwrap();
        let second = portfolio.mark_to_market(&index, next).unwrap();

        assert_eq!(first.total_value, first.cash + first.market_value);
        assert!(second.nav > first.nav);
        assert!((second.daily_return - (second.nav / first.nav - 1.0)).abs() < 1e-12);
    }
}
