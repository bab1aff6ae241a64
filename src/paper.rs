use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use polars::prelude::{DataFrame, ParquetReader, SerReader};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::json;

use crate::bars::{self, load_bar_table};
use crate::calendar::{TradeDate, TradingCalendar};
use crate::config::PaperConfig;
use crate::models::{Bar, PendingOrder, SellType, TradeSide};
use crate::pending::PendingOrderQueue;
use crate::portfolio::{decimal_price, BuyOutcome, Portfolio, SellOutcome};
use crate::price_index::PriceIndex;
use crate::risk_budget::RiskBudgetScaler;
use crate::scheduler::Scheduler;
use crate::signals::{Ranker, SignalPipeline};
use crate::stop_loss::StopLossMonitor;
use crate::store::{PaperStore, RunKind};
use crate::tradability::TradabilityMap;

/// External market-data dependency of the paper runner. The three-stage
/// ensure walk (features from clean bars from raw) lives behind this seam;
/// the runner only asks for presence and reads.
pub trait MarketDataProvider {
    fn trading_calendar(&self) -> Result<TradingCalendar>;

    /// Guarantee that data for `date` is available, or fail. A failure
    /// aborts the tick with state untouched.
    fn ensure(&self, date: TradeDate) -> Result<()>;

    fn bars_for_dates(&self, dates: &[TradeDate]) -> Result<Vec<Bar>>;

    fn features_for_date(&self, date: TradeDate) -> Result<Option<DataFrame>>;
}

/// Directory-backed provider over already-built clean data:
///
/// ```text
/// <data_root>/calendar.txt            one YYYYMMDD per line
/// <data_root>/daily/{YYYYMMDD}.parquet
/// <data_root>/features/{YYYYMMDD}.parquet   (optional)
/// ```
pub struct ParquetMarketData {
    data_root: PathBuf,
}

impl ParquetMarketData {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    fn daily_path(&self, date: TradeDate) -> PathBuf {
        self.data_root.join("daily").join(format!("{}.parquet", date))
    }
}

impl MarketDataProvider for ParquetMarketData {
    fn trading_calendar(&self) -> Result<TradingCalendar> {
        bars::load_calendar_file(&self.data_root.join("calendar.txt"))
    }

    fn ensure(&self, date: TradeDate) -> Result<()> {
        let path = self.daily_path(date);
        if !path.exists() {
            bail!(
                "clean daily data for {} is missing at {}; run the data pipeline first",
                date,
                path.display()
            );
        }
        Ok(())
    }

    fn bars_for_dates(&self, dates: &[TradeDate]) -> Result<Vec<Bar>> {
        let mut bars = Vec::new();
        for date in dates {
            let path = self.daily_path(*date);
            if !path.exists() {
                continue;
            }
            bars.extend(load_bar_table(&path)?);
        }
        Ok(bars)
    }

    fn features_for_date(&self, date: TradeDate) -> Result<Option<DataFrame>> {
        let path = self
            .data_root
            .join("features")
            .join(format!("{}.parquet", date));
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open features {}", path.display()))?;
        let frame = ParquetReader::new(file)
            .finish()
            .with_context(|| format!("failed to read features {}", path.display()))?;
        Ok(Some(frame))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Both sub-steps had already completed for the day.
    NoOp,
    Completed {
        date: TradeDate,
        fills: usize,
        targets_staged: usize,
    },
}

/// Single-execution-per-day counterpart of the backtest engine: the same
/// state machine, with every piece of mutable state round-tripping through
/// the paper store and each sub-step guarded by an idempotency sentinel.
pub struct PaperRunner<'a> {
    store: &'a PaperStore,
    provider: &'a dyn MarketDataProvider,
    config: PaperConfig,
}

impl<'a> PaperRunner<'a> {
    pub fn load(store: &'a PaperStore, provider: &'a dyn MarketDataProvider) -> Result<Self> {
        let config = match store.load_config()? {
            Some(config) => config,
            None => {
                warn!("no config.json found under {}, using defaults", store.root().display());
                PaperConfig::default()
            }
        };
        config.validate()?;
        Ok(Self {
            store,
            provider,
            config,
        })
    }

    pub fn config(&self) -> &PaperConfig {
        &self.config
    }

    /// Execute one trading day. Re-invocation on the same day is a no-op
    /// for sub-steps that already ran.
    pub fn run_day(&self, requested: TradeDate, ranker: &dyn Ranker) -> Result<RunOutcome> {
        let calendar = self.provider.trading_calendar()?;
        let date = self.normalize_date(requested, &calendar)?;

        let _lock = self.store.lock()?;
        let t1_done = self.store.run_exists(RunKind::T1, date);
        let t0_done = self.store.run_exists(RunKind::T0, date);
        if t1_done && t0_done {
            info!("both sub-steps already ran for {}, nothing to do", date);
            return Ok(RunOutcome::NoOp);
        }

        self.provider.ensure(date)?;
        let (index, tradability) = self.build_market_view(date, &calendar)?;

        let mut state = self.load_state(&calendar)?;

        let mut fills = 0usize;
        if t1_done {
            info!("T1 sub-step already ran for {}", date);
        } else {
            fills = self.run_t1(date, &calendar, &index, &tradability, &mut state)?;
        }

        let mut targets_staged = 0usize;
        if t0_done {
            info!("T0 sub-step already ran for {}", date);
        } else {
            targets_staged =
                self.run_t0(date, &calendar, &index, &tradability, &mut state, ranker)?;
        }

        Ok(RunOutcome::Completed {
            date,
            fills,
            targets_staged,
        })
    }

    /// Re-attempt deferred sells without the daily sentinel; fills persist
    /// immediately. Mirrors the intraday retry entry point of the original
    /// workflow.
    pub fn retry_sells(&self, requested: TradeDate) -> Result<usize> {
        let calendar = self.provider.trading_calendar()?;
        let date = self.normalize_date(requested, &calendar)?;

        let _lock = self.store.lock()?;
        self.provider.ensure(date)?;
        let (index, tradability) = self.build_market_view(date, &calendar)?;
        let mut state = self.load_state(&calendar)?;

        let fills = self.retry_pending_sells(date, &calendar, &index, &tradability, &mut state)?;
        if fills > 0 {
            let nav_point = state.portfolio.mark_to_market(&index, date)?;
            state.monitor.reconcile(state.portfolio.positions());
            self.persist(&mut state, date, &[nav_point])?;
        } else {
            // Queue bookkeeping (retry counters, expiries) still persists.
            self.store.save_pending_orders(state.queue.orders())?;
        }
        info!("retry complete for {}: {} fills", date, fills);
        Ok(fills)
    }

    /// Current positions marked at `date`, as a printable table.
    pub fn positions_report(&self, requested: TradeDate) -> Result<String> {
        let calendar = self.provider.trading_calendar()?;
        let date = self.normalize_date(requested, &calendar)?;
        let (index, _) = self.build_market_view(date, &calendar)?;
        let state = self.load_state(&calendar)?;

        let mut out = String::new();
        writeln!(
            out,
            "{:<12} {:>8} {:>10} {:>10} {:>10} {:>6} {:>10} {:>12} {:>12} {:>9}",
            "ticker", "shares", "buy_price", "buy_cost", "buy_date", "held", "price", "value", "pnl", "pnl_pct"
        )?;
        let mut total_value = Decimal::ZERO;
        for (ticker, lot) in state.portfolio.positions() {
            let price = index
                .last_pnl_price_at_or_before(date, ticker)
                .unwrap_or(lot.buy_pnl_price);
            let value = Decimal::from(lot.shares) * decimal_price(price)?;
            let cost = Decimal::from(lot.shares) * decimal_price(lot.buy_pnl_price)? + lot.buy_fee();
            let pnl = value - cost;
            let pnl_pct = if cost > Decimal::ZERO {
                (pnl / cost).to_f64().unwrap_or(0.0) * 100.0
            } else {
                0.0
            };
            let held = calendar.distance(lot.buy_date, date).unwrap_or(0);
            total_value += value;
            writeln!(
                out,
                "{:<12} {:>8} {:>10.2} {:>10.2} {:>10} {:>6} {:>10.2} {:>12.2} {:>12.2} {:>8.2}%",
                ticker,
                lot.shares,
                lot.buy_trade_price,
                lot.buy_cost_cash,
                lot.buy_date.to_string(),
                held,
                price,
                value,
                pnl,
                pnl_pct
            )?;
        }
        if state.portfolio.positions().is_empty() {
            writeln!(out, "(no open positions)")?;
        }
        writeln!(out, "cash        {:>12.2}", state.portfolio.cash())?;
        writeln!(out, "positions   {:>12.2}", total_value)?;
        writeln!(out, "total       {:>12.2}", state.portfolio.cash() + total_value)?;
        Ok(out)
    }

    fn normalize_date(&self, requested: TradeDate, calendar: &TradingCalendar) -> Result<TradeDate> {
        let Some(date) = calendar.roll_forward(requested) else {
            bail!("no trading day on or after {} in the calendar", requested);
        };
        if date != requested {
            warn!("{} is not a trading day, rolled forward to {}", requested, date);
        }
        Ok(date)
    }

    /// Price index and tradability map over a trailing window wide enough
    /// for volatility lookbacks and last-known-price fallbacks.
    fn build_market_view(
        &self,
        date: TradeDate,
        calendar: &TradingCalendar,
    ) -> Result<(PriceIndex, TradabilityMap)> {
        let idx = calendar
            .index_of(date)
            .context("normalized date must be in the calendar")?;
        let lookback = self.config.vol_window.max(20) + 1;
        let start = idx.saturating_sub(lookback);
        let window: Vec<TradeDate> = calendar.dates()[start..=idx].to_vec();
        let bars = self.provider.bars_for_dates(&window)?;
        if !bars.iter().any(|bar| bar.date == date) {
            bail!("no bars available for {}", date);
        }
        let index = PriceIndex::build(&bars)?;
        let tradability = TradabilityMap::build(&bars);
        Ok((index, tradability))
    }

    fn load_state(&self, _calendar: &TradingCalendar) -> Result<RunnerState> {
        let initial_capital = Decimal::from_f64(self.config.initial_capital)
            .context("initial_capital is not representable")?;
        let nav_curve = self.store.load_nav_curve()?;
        let last_nav = nav_curve.last().map(|(_, nav)| *nav);

        let portfolio = match self.store.load_account()? {
            Some(account) => Portfolio::from_account_state(initial_capital, account, last_nav)?,
            None => {
                info!("no account state found, opening a fresh paper account");
                Portfolio::new(initial_capital)?
            }
        };

        let monitor = match self.store.load_stop_loss_state()? {
            Some(state) => StopLossMonitor::from_state(self.config.stop_loss_config(), state),
            None => StopLossMonitor::new(self.config.stop_loss_config()),
        };

        let queue = PendingOrderQueue::from_orders(
            self.store.load_pending_orders()?,
            self.config.max_retries,
            self.config.max_retry_days,
        );

        let scheduler = match self.store.load_rebalance_state()? {
            Some(state) => Scheduler::from_state(&state, self.config.batch_rebalance_tranches),
            None => Scheduler::new(
                self.config.rebalance_freq,
                self.config.batch_rebalance_tranches,
            ),
        };

        Ok(RunnerState {
            portfolio,
            monitor,
            queue,
            scheduler,
            nav_curve,
        })
    }

    /// T1: deferred-sell retries, stop-loss checks, holding-period exits,
    /// then fills from yesterday's staged target weights; one NAV point and
    /// a full state flush at the end.
    fn run_t1(
        &self,
        date: TradeDate,
        calendar: &TradingCalendar,
        index: &PriceIndex,
        tradability: &TradabilityMap,
        state: &mut RunnerState,
    ) -> Result<usize> {
        info!("T1 sub-step for {}", date);
        let cost = self.config.cost_model()?;
        let mut fills = 0usize;

        fills += self.retry_pending_sells(date, calendar, index, tradability, state)?;

        let triggers =
            state
                .monitor
                .update_and_check(date, state.portfolio.positions(), index, tradability);
        for trigger in triggers {
            if state.queue.has(&trigger.ticker, TradeSide::Sell) {
                continue;
            }
            let shares = state.portfolio.position(&trigger.ticker).map(|lot| lot.shares);
            state.queue.enqueue(
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

        let due_exits: Vec<String> = state
            .portfolio
            .positions()
            .iter()
            .filter(|(_, lot)| lot.exit_due_date.map_or(false, |due| due <= date))
            .map(|(ticker, _)| ticker.clone())
            .collect();
        for ticker in due_exits {
            if state.queue.has(&ticker, TradeSide::Sell) {
                continue;
            }
            match tradability.can_sell(date, &ticker) {
                Ok(()) => {
                    let outcome = state.portfolio.sell(
                        index,
                        &cost,
                        &ticker,
                        date,
                        self.config.sell_price,
                        SellType::HoldingPeriod,
                        None,
                        "holding period expiry",
                    )?;
                    if let SellOutcome::Filled { .. } = outcome {
                        state.monitor.purge(&ticker);
                        fills += 1;
                    }
                }
                Err(block) => {
                    warn!(
                        "holding-period exit for {} deferred on {}: {}",
                        ticker,
                        date,
                        block.reason()
                    );
                    let shares = state.portfolio.position(&ticker).map(|lot| lot.shares);
                    state.queue.enqueue(
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

        let targets = self.store.load_pending_weights(date)?.unwrap_or_default();
        if !targets.is_empty() {
            let total = state
                .portfolio
                .total_value_at(index, date, self.config.buy_price)?;
            let exit_due = self
                .config
                .holding_period
                .and_then(|days| calendar.shift(date, days as usize));
            let mut sorted = targets;
            sorted.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.ticker.cmp(&b.ticker))
            });
            for target in sorted {
                if target.weight <= 0.0 {
                    continue;
                }
                if let Err(block) = tradability.can_buy(date, &target.ticker) {
                    warn!(
                        "buy {} dropped on {}: {}",
                        target.ticker,
                        date,
                        block.reason()
                    );
                    continue;
                }
                let Some(weight) = Decimal::from_f64(target.weight) else {
                    continue;
                };
                let outcome = state.portfolio.buy(
                    index,
                    &cost,
                    &target.ticker,
                    date,
                    (total * weight).round_dp(4),
                    self.config.buy_price,
                    exit_due,
                    &target.reason,
                )?;
                match outcome {
                    BuyOutcome::Filled { .. } => fills += 1,
                    BuyOutcome::Skipped { reason, details } => warn!(
                        "buy {} skipped on {}: {}{}",
                        target.ticker,
                        date,
                        reason,
                        details.map(|d| format!(" ({})", d)).unwrap_or_default()
                    ),
                }
            }
        } else {
            info!("no staged target weights for {}", date);
        }

        let nav_point = state.portfolio.mark_to_market(index, date)?;
        state.monitor.reconcile(state.portfolio.positions());
        self.persist(state, date, &[nav_point.clone()])?;
        self.store.save_run_record(
            RunKind::T1,
            date,
            &json!({
                "trade_date": date.to_string(),
                "fills": fills,
                "nav": nav_point.nav,
                "pending_orders": state.queue.len(),
            }),
        )?;
        info!("T1 complete for {}: {} fills, nav {:.4}", date, fills, nav_point.nav);
        Ok(fills)
    }

    /// T0: signal generation for the next trading day, gated on the
    /// rebalance cadence.
    fn run_t0(
        &self,
        date: TradeDate,
        calendar: &TradingCalendar,
        index: &PriceIndex,
        tradability: &TradabilityMap,
        state: &mut RunnerState,
        ranker: &dyn Ranker,
    ) -> Result<usize> {
        if !state.scheduler.is_rebalance_day(date, calendar)? {
            info!(
                "{} is not a rebalance day (last {}), skipping signal generation",
                date,
                state
                    .scheduler
                    .last_rebalance_date()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            return Ok(0);
        }
        let Some(fill_date) = calendar.next_after(date) else {
            warn!("no trading day after {}, cannot stage targets", date);
            return Ok(0);
        };

        info!("T0 sub-step for {} (fills on {})", date, fill_date);
        let features = self.provider.features_for_date(date)?;
        let universe: Vec<String> = index
            .tickers_on(date)
            .into_iter()
            .filter(|ticker| self.config.universe.includes(ticker))
            .collect();

        let pipeline = SignalPipeline {
            top_n: self.config.top_n,
            weight_method: self.config.weight_method,
        };
        // Tomorrow's bars do not exist yet: screen tradability on the
        // signal day and let T1 drop anything that locks overnight.
        let mut weights = pipeline.run(
            ranker,
            date,
            date,
            &universe,
            features.as_ref(),
            tradability,
            state.portfolio.positions(),
        )?;
        if weights.is_empty() {
            warn!("no target weights generated on {}", date);
            state.scheduler.mark(date);
            self.store.save_rebalance_state(&state.scheduler.to_state())?;
            self.save_t0_record(date, fill_date, 0)?;
            return Ok(0);
        }

        if let Some((tranche, count)) = state.scheduler.due_tranche() {
            let per = weights.len().div_ceil(count as usize);
            weights = weights
                .into_iter()
                .skip(per * tranche as usize)
                .take(per)
                .collect();
        }

        let navs: Vec<f64> = state.nav_curve.iter().map(|(_, nav)| *nav).collect();
        let mut controller =
            crate::equity_curve::EquityCurveController::new(self.config.equity_curve_config());
        let (exposure, reason) = controller.exposure(&navs);
        if exposure < 1.0 {
            info!("exposure scaled to {:.2}: {}", exposure, reason);
            for target in &mut weights {
                target.weight *= exposure;
            }
        }

        let scaler = RiskBudgetScaler::new(self.config.risk_budget_config());
        scaler.scale(&mut weights, index, date);
        weights.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        self.store.save_pending_weights(fill_date, &weights)?;
        state.scheduler.mark(date);
        self.store.save_rebalance_state(&state.scheduler.to_state())?;
        self.save_t0_record(date, fill_date, weights.len())?;
        info!("T0 complete for {}: staged {} targets", date, weights.len());
        Ok(weights.len())
    }

    fn save_t0_record(&self, date: TradeDate, fill_date: TradeDate, targets: usize) -> Result<()> {
        self.store.save_run_record(
            RunKind::T0,
            date,
            &json!({
                "trade_date": date.to_string(),
                "t1_date": fill_date.to_string(),
                "top_n": self.config.top_n,
                "universe": self.config.universe,
                "model_version": self.config.model_version,
                "rebalance_freq": self.config.rebalance_freq,
                "targets_count": targets,
            }),
        )
    }

    fn retry_pending_sells(
        &self,
        date: TradeDate,
        calendar: &TradingCalendar,
        index: &PriceIndex,
        tradability: &TradabilityMap,
        state: &mut RunnerState,
    ) -> Result<usize> {
        let cost = self.config.cost_model()?;
        let mut fills = 0usize;
        let due = state.queue.due_orders(date, calendar)?;
        for order in due {
            if order.side != TradeSide::Sell {
                warn!(
                    "dropping pending {} {}: paper queue only defers sells",
                    order.side.as_str(),
                    order.ticker
                );
                continue;
            }
            if let Err(block) = tradability.can_sell(date, &order.ticker) {
                info!(
                    "pending sell {} still blocked on {}: {}",
                    order.ticker,
                    date,
                    block.reason()
                );
                state.queue.requeue(order);
                continue;
            }
            let outcome = state.portfolio.sell(
                index,
                &cost,
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
                    state.monitor.purge(&order.ticker);
                    fills += 1;
                }
                SellOutcome::Skipped { reason: "not_held" } => {
                    info!(
                        "pending sell {} dropped on {}: position already closed",
                        order.ticker, date
                    );
                }
                SellOutcome::Skipped { reason } => {
                    info!("pending sell {} failed on {}: {}", order.ticker, date, reason);
                    state.queue.requeue(order);
                }
            }
        }
        Ok(fills)
    }

    /// Flush mutable state: account, stop-loss state, pending sells, trade
    /// log and NAV. Each file is written atomically.
    fn persist(
        &self,
        state: &mut RunnerState,
        date: TradeDate,
        nav_points: &[crate::models::NavPoint],
    ) -> Result<()> {
        self.store
            .save_account(&state.portfolio.to_account_state(Some(date)))?;
        self.store.save_stop_loss_state(state.monitor.state())?;
        self.store.save_pending_orders(state.queue.orders())?;
        self.store.append_trades(state.portfolio.trades())?;
        self.store.append_nav(nav_points)?;
        Ok(())
    }
}

struct RunnerState {
    portfolio: Portfolio,
    monitor: StopLossMonitor,
    queue: PendingOrderQueue,
    scheduler: Scheduler,
    nav_curve: Vec<(TradeDate, f64)>,
}
