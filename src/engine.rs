use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use log::{info, warn};
use polars::prelude::DataFrame;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::calendar::{TradeDate, TradingCalendar};
use crate::config::EngineConfig;
use crate::equity_curve::EquityCurveController;
use crate::models::{NavPoint, PendingOrder, SellType, TargetWeight, TradeRecord, TradeSide};
use crate::pending::PendingOrderQueue;
use crate::portfolio::{BuyOutcome, Portfolio, SellOutcome};
use crate::price_index::PriceIndex;
use crate::risk_budget::RiskBudgetScaler;
use crate::scheduler::Scheduler;
use crate::signals::{Ranker, SignalPipeline};
use crate::stop_loss::StopLossMonitor;
use crate::tradability::TradabilityMap;

/// Features per signal date, keyed the way the external feature builder
/// stores them.
pub type FeaturesByDate = BTreeMap<TradeDate, DataFrame>;

/// The per-day state machine. Strictly single-threaded and synchronous: one
/// tick runs pending retries, stop-loss checks, holding-period exits, T+1
/// fills, signal generation and mark-to-market in that order, and ticks
/// advance in calendar order. The price index and tradability map are
/// immutable and shared; everything mutable is owned here.
pub struct ExecutionEngine<'a> {
    config: EngineConfig,
    calendar: &'a TradingCalendar,
    index: &'a PriceIndex,
    tradability: &'a TradabilityMap,
    portfolio: Portfolio,
    pending: PendingOrderQueue,
    stop_loss: StopLossMonitor,
    scheduler: Scheduler,
    equity: EquityCurveController,
    risk: RiskBudgetScaler,
    pipeline: SignalPipeline,
    pending_weights: BTreeMap<TradeDate, Vec<TargetWeight>>,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        config: EngineConfig,
        calendar: &'a TradingCalendar,
        index: &'a PriceIndex,
        tradability: &'a TradabilityMap,
    ) -> Result<Self> {
        config.validate()?;
        let portfolio = Portfolio::new(config.initial_capital)?;
        let pending = PendingOrderQueue::new(config.max_retries, config.max_retry_days);
        let stop_loss = StopLossMonitor::new(config.stop_loss.clone());
        let scheduler = Scheduler::new(config.rebalance_freq, config.batch_tranches);
        let equity = EquityCurveController::new(config.equity_curve.clone());
        let risk = RiskBudgetScaler::new(config.risk_budget.clone());
        let pipeline = SignalPipeline {
            top_n: config.top_n,
            weight_method: config.weight_method,
        };
        Ok(Self {
            config,
            calendar,
            index,
            tradability,
            portfolio,
            pending,
            stop_loss,
            scheduler,
            equity,
            risk,
            pipeline,
            pending_weights: BTreeMap::new(),
        })
    }

    pub fn trades(&self) -> &[TradeRecord] {
        self.portfolio.trades()
    }

    pub fn nav_history(&self) -> &[NavPoint] {
        self.portfolio.nav_history()
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn pending_orders(&self) -> usize {
        self.pending.len()
    }

    /// Run the simulation over `[start, end]`. Dates outside the calendar
    /// are simply absent from the range; a failed tick leaves the NAV
    /// history at the last completed day.
    pub fn run(
        &mut self,
        start: TradeDate,
        end: TradeDate,
        ranker: &dyn Ranker,
        features: &FeaturesByDate,
    ) -> Result<()> {
        ensure!(start <= end, "backtest start {} is after end {}", start, end);
        let days = self.calendar.range(start, end);
        ensure!(
            !days.is_empty(),
            "no trading days between {} and {}",
            start,
            end
        );
        info!(
            "running simulation over {} trading days ({} to {})",
            days.len(),
            days[0],
            days[days.len() - 1]
        );
        for date in days {
            self.tick(date, ranker, features.get(&date))?;
        }
        Ok(())
    }

    /// One trading day.
    pub fn tick(
        &mut self,
        date: TradeDate,
        ranker: &dyn Ranker,
        features: Option<&DataFrame>,
    ) -> Result<()> {
        self.retry_pending(date)?;
        self.check_stop_losses(date);
        self.execute_holding_period_exits(date)?;
        self.execute_pending_buys(date)?;
        if self.scheduler.is_rebalance_day(date, self.calendar)? {
            self.generate_signals(date, ranker, features)?;
            self.scheduler.mark(date);
        }
        self.portfolio.mark_to_market(self.index, date)?;
        self.stop_loss.reconcile(self.portfolio.positions());
        Ok(())
    }

    /// Pending retries run to completion before anything else enters the
    /// queue, so a same-day re-enqueue cannot race its own retry.
    fn retry_pending(&mut self, date: TradeDate) -> Result<()> {
        let due = self.pending.due_orders(date, self.calendar)?;
        for order in due {
            self.attempt_pending_order(order, date)?;
        }
        Ok(())
    }

    fn attempt_pending_order(&mut self, order: PendingOrder, date: TradeDate) -> Result<()> {
        match order.side {
            TradeSide::Sell => {
                if let Err(block) = self.tradability.can_sell(date, &order.ticker) {
                    info!(
                        "pending sell {} still blocked on {}: {}",
                        order.ticker,
                        date,
                        block.reason()
                    );
                    self.pending.requeue(order);
                    return Ok(());
                }
                let outcome = self.portfolio.sell(
                    self.index,
                    &self.config.cost,
                    &order.ticker,
                    date,
                    self.config.sell_price,
                    order.sell_type.unwrap_or(SellType::Forced),
                    order.stop_loss_trigger,
                    &order.reason,
                )?;
                match outcome {
                    SellOutcome::Filled { shares } => {
                        info!(
                            "pending sell {} filled x{} on {} after {} retries",
                            order.ticker, shares, date, order.retries_used
                        );
                        self.stop_loss.purge(&order.ticker);
                    }
                    SellOutcome::Skipped { reason: "not_held" } => {
                        info!(
                            "pending sell {} dropped on {}: position already closed",
                            order.ticker, date
                        );
                    }
                    SellOutcome::Skipped { reason } => {
                        info!("pending sell {} failed on {}: {}", order.ticker, date, reason);
                        self.pending.requeue(order);
                    }
                }
            }
            TradeSide::Buy => {
                if let Err(block) = self.tradability.can_buy(date, &order.ticker) {
                    info!(
                        "pending buy {} still blocked on {}: {}",
                        order.ticker,
                        date,
                        block.reason()
                    );
                    self.pending.requeue(order);
                    return Ok(());
                }
                let target = order.target_notional.unwrap_or(Decimal::ZERO);
                let exit_due = self.exit_due_from(date);
                let outcome = self.portfolio.buy(
                    self.index,
                    &self.config.cost,
                    &order.ticker,
                    date,
                    target,
                    self.config.buy_price,
                    exit_due,
                    &order.reason,
                )?;
                match outcome {
                    BuyOutcome::Filled { shares } => {
                        info!("pending buy {} filled x{} on {}", order.ticker, shares, date);
                    }
                    BuyOutcome::Skipped {
                        reason: "already_held",
                        ..
                    } => {
                        info!("pending buy {} dropped on {}: already held", order.ticker, date);
                    }
                    BuyOutcome::Skipped { reason, .. } => {
                        info!("pending buy {} failed on {}: {}", order.ticker, date, reason);
                        self.pending.requeue(order);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop-loss triggers never fill same-day: they enter the queue and the
    /// first attempt happens at the next tick's retry step, preserving the
    /// T+1 convention.
    fn check_stop_losses(&mut self, date: TradeDate) {
        let triggers = self.stop_loss.update_and_check(
            date,
            self.portfolio.positions(),
            self.index,
            self.tradability,
        );
        for trigger in triggers {
            if self.pending.has(&trigger.ticker, TradeSide::Sell) {
                continue;
            }
            let shares = self
                .portfolio
                .position(&trigger.ticker)
                .map(|lot| lot.shares);
            self.pending.enqueue(
                PendingOrder {
                    ticker: trigger.ticker.clone(),
                    side: TradeSide::Sell,
                    target_notional: None,
                    shares,
                    origin_date: date,
                    first_enqueued_date: date,
                    retries_used: 0,
                    reason: format!("stop_loss: {}", trigger.detail),
                    sell_type: Some(SellType::StopLoss),
                    stop_loss_trigger: Some(trigger.kind),
                },
                date,
            );
        }
    }

    fn execute_holding_period_exits(&mut self, date: TradeDate) -> Result<()> {
        let due: Vec<String> = self
            .portfolio
            .positions()
            .iter()
            .filter(|(_, lot)| lot.exit_due_date.map_or(false, |d| d <= date))
            .map(|(ticker, _)| ticker.clone())
            .collect();

        for ticker in due {
            if self.pending.has(&ticker, TradeSide::Sell) {
                continue;
            }
            match self.tradability.can_sell(date, &ticker) {
                Ok(()) => {
                    let outcome = self.portfolio.sell(
                        self.index,
                        &self.config.cost,
                        &ticker,
                        date,
                        self.config.sell_price,
                        SellType::HoldingPeriod,
                        None,
                        "holding period expiry",
                    )?;
                    if let SellOutcome::Filled { .. } = outcome {
                        self.stop_loss.purge(&ticker);
                    }
                }
                Err(block) => {
                    warn!(
                        "holding-period exit for {} deferred on {}: {}",
                        ticker,
                        date,
                        block.reason()
                    );
                    let shares = self.portfolio.position(&ticker).map(|lot| lot.shares);
                    self.pending.enqueue(
                        PendingOrder {
                            ticker: ticker.clone(),
                            side: TradeSide::Sell,
                            target_notional: None,
                            shares,
                            origin_date: date,
                            first_enqueued_date: date,
                            retries_used: 0,
                            reason: format!("holding_period: {}", block.reason()),
                            sell_type: Some(SellType::HoldingPeriod),
                            stop_loss_trigger: None,
                        },
                        date,
                    );
                }
            }
        }
        Ok(())
    }

    /// Fills for the target set generated yesterday. Blocked buys are
    /// dropped with a logged reason, never deferred: stale signals are not
    /// worth chasing.
    fn execute_pending_buys(&mut self, date: TradeDate) -> Result<()> {
        let Some(weights) = self.pending_weights.remove(&date) else {
            return Ok(());
        };
        let total = self
            .portfolio
            .total_value_at(self.index, date, self.config.buy_price)?;
        let exit_due = self.exit_due_from(date);

        for target in weights {
            if target.weight <= 0.0 {
                continue;
            }
            if let Err(block) = self.tradability.can_buy(date, &target.ticker) {
                warn!(
                    "buy {} dropped on {}: {}",
                    target.ticker,
                    date,
                    block.reason()
                );
                continue;
            }
            let Some(weight) = Decimal::from_f64(target.weight) else {
                warn!("buy {} dropped on {}: weight not representable", target.ticker, date);
                continue;
            };
            let notional = (total * weight).round_dp(4);
            let outcome = self.portfolio.buy(
                self.index,
                &self.config.cost,
                &target.ticker,
                date,
                notional,
                self.config.buy_price,
                exit_due,
                &target.reason,
            )?;
            if let BuyOutcome::Skipped { reason, details } = outcome {
                warn!(
                    "buy {} skipped on {}: {}{}",
                    target.ticker,
                    date,
                    reason,
                    details.map(|d| format!(" ({})", d)).unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    /// T-day signal generation: rank, backfill against tomorrow's
    /// tradability, scale by the equity-curve exposure and the risk budget,
    /// then stage the set for tomorrow's fills.
    fn generate_signals(
        &mut self,
        date: TradeDate,
        ranker: &dyn Ranker,
        features: Option<&DataFrame>,
    ) -> Result<()> {
        let Some(fill_date) = self.calendar.next_after(date) else {
            info!("no trading day after {}, skipping signal generation", date);
            return Ok(());
        };

        let universe: Vec<String> = self
            .index
            .tickers_on(date)
            .into_iter()
            .filter(|ticker| self.config.universe.includes(ticker))
            .collect();
        if universe.is_empty() {
            warn!("universe is empty on {}", date);
            return Ok(());
        }

        let mut weights = self.pipeline.run(
            ranker,
            date,
            fill_date,
            &universe,
            features,
            self.tradability,
            self.portfolio.positions(),
        )?;
        if weights.is_empty() {
            return Ok(());
        }

        if let Some((tranche, count)) = self.scheduler.due_tranche() {
            weights = tranche_slice(weights, tranche, count);
            if weights.is_empty() {
                return Ok(());
            }
        }

        let navs: Vec<f64> = self.portfolio.nav_history().iter().map(|p| p.nav).collect();
        let (exposure, reason) = self.equity.exposure(&navs);
        if exposure < 1.0 {
            info!("exposure scaled to {:.2} on {}: {}", exposure, date, reason);
            for target in &mut weights {
                target.weight *= exposure;
            }
        }

        self.risk.scale(&mut weights, self.index, date);
        weights.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        let total: f64 = weights.iter().map(|w| w.weight).sum();
        ensure!(
            total <= 1.0 + 1e-9,
            "target weights sum to {} on {}",
            total,
            date
        );

        info!(
            "staged {} target weights for {} (signal day {})",
            weights.len(),
            fill_date,
            date
        );
        self.pending_weights.insert(fill_date, weights);
        Ok(())
    }

    fn exit_due_from(&self, fill_date: TradeDate) -> Option<TradeDate> {
        self.config
            .holding_period
            .and_then(|days| self.calendar.shift(fill_date, days as usize))
    }
}

/// Slice a target set into its due tranche. The set is already sorted by
/// weight; tranches take contiguous runs so each rebalance period works a
/// distinct slice of the list.
fn tranche_slice(weights: Vec<TargetWeight>, tranche: u32, count: u32) -> Vec<TargetWeight> {
    let per = weights.len().div_ceil(count as usize);
    weights
        .into_iter()
        .skip(per * tranche as usize)
        .take(per)
        .collect()
}
