use std::collections::BTreeMap;

use anyhow::Result;
use polars::prelude::DataFrame;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

use ashare_engine::calendar::{TradeDate, TradingCalendar};
use ashare_engine::config::PaperConfig;
use ashare_engine::engine::{ExecutionEngine, FeaturesByDate};
use ashare_engine::models::{
    Bar, RankedCandidate, SellType, StopLossTriggerKind, TradeSide, UniverseScope,
};
use ashare_engine::price_index::PriceIndex;
use ashare_engine::signals::Ranker;
use ashare_engine::tradability::TradabilityMap;

const DAYS: [&str; 7] = [
    "20230103", "20230104", "20230105", "20230106", "20230109", "20230110", "20230111",
];

fn date(raw: &str) -> TradeDate {
    TradeDate::parse(raw).unwrap()
}

fn calendar() -> TradingCalendar {
    let raw: Vec<String> = DAYS.iter().map(|d| d.to_string()).collect();
    TradingCalendar::parse(&raw).unwrap()
}

#[derive(Clone, Default)]
struct BarSpec {
    close: f64,
    limit_up: bool,
    limit_down: bool,
    suspended: bool,
}

fn bar(ticker: &str, day: &str, spec: &BarSpec) -> Bar {
    Bar {
        ticker: ticker.to_string(),
        date: date(day),
        open: Some(spec.close),
        high: Some(spec.close),
        low: Some(spec.close),
        close: spec.close,
        open_adj: Some(spec.close),
        close_adj: Some(spec.close),
        volume: if spec.suspended { 0.0 } else { 1_000_000.0 },
        amount: spec.close * 1_000_000.0,
        pct_change: None,
        is_st: None,
        is_suspended: Some(spec.suspended),
        is_limit_up: Some(spec.limit_up),
        is_limit_down: Some(spec.limit_down),
    }
}

fn flat(close: f64) -> BarSpec {
    BarSpec {
        close,
        ..BarSpec::default()
    }
}

/// Ranker returning the same ordered list on every signal day.
struct ListRanker(Vec<(&'static str, f64)>);

impl Ranker for ListRanker {
    fn generate_ranked(
        &self,
        _date: TradeDate,
        _universe: &[String],
        _features: Option<&DataFrame>,
    ) -> Result<Vec<RankedCandidate>> {
        Ok(self
            .0
            .iter()
            .map(|(ticker, score)| RankedCandidate {
                ticker: ticker.to_string(),
                score: Some(*score),
            })
            .collect())
    }
}

fn base_config(initial_capital: f64) -> PaperConfig {
    PaperConfig {
        initial_capital,
        top_n: 1,
        rebalance_freq: 1,
        holding_period: Some(5),
        universe: UniverseScope::All,
        ..PaperConfig::default()
    }
}

fn assert_invariants(engine: &ExecutionEngine<'_>, initial_capital: f64) {
    // the NAV identity holds on every tick
    for point in engine.nav_history() {
        assert_eq!(point.total_value, point.cash + point.market_value);
        let implied = point.total_value.to_f64().unwrap() / initial_capital;
        assert!(
            (point.nav - implied).abs() < 1e-9,
            "nav {} diverges from identity {}",
            point.nav,
            implied
        );
        // cash can never go negative
        assert!(point.cash >= dec!(0), "cash went negative: {}", point.cash);
    }
    // full lots only, and every sell matches the open lot it closes
    let mut open_shares: BTreeMap<&str, i64> = BTreeMap::new();
    for trade in engine.trades() {
        assert!(trade.shares > 0 && trade.shares % 100 == 0, "bad share count");
        match trade.side {
            TradeSide::Buy => {
                assert!(
                    open_shares.insert(trade.ticker.as_str(), trade.shares).is_none(),
                    "overlapping lot for {}",
                    trade.ticker
                );
            }
            TradeSide::Sell => {
                let bought = open_shares
                    .remove(trade.ticker.as_str())
                    .expect("sell without a preceding buy");
                assert_eq!(bought, trade.shares, "sell shares mismatch the open lot");
                assert!(trade.sell_type.is_some());
                assert!(trade.pnl_profit_amount.is_some());
            }
        }
    }
}

// Single buy on T+1, mandatory exit after the holding period, profit on
// the adjusted basis net of round-trip fees.
#[test]
fn single_buy_hold_five_days_sell() {
    let cal = calendar();
    let mut bars = Vec::new();
    for (i, day) in DAYS.iter().enumerate() {
        let close = if i == 6 { 12.0 } else { 10.0 };
        bars.push(bar("600001.SH", day, &flat(close)));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let config = base_config(100_000.0);
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230111"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let trades = engine.trades();
    assert!(trades.len() >= 2, "expected at least a buy and a sell");

    let buy = &trades[0];
    assert_eq!(buy.side, TradeSide::Buy);
    assert_eq!(buy.date, date("20230104"));
    assert_eq!(buy.trade_price, dec!(10));
    // 100k target at 10 with fees leaves 9900 shares after lot flooring
    assert_eq!(buy.shares, 9900);

    let sell = &trades[1];
    assert_eq!(sell.side, TradeSide::Sell);
    assert_eq!(sell.date, date("20230111"));
    assert_eq!(sell.sell_type, Some(SellType::HoldingPeriod));
    assert_eq!(sell.trade_price, dec!(12));
    assert_eq!(sell.buy_trade_price, Some(dec!(10)));

    // profit = 9900 * (12 - 10) - round-trip fees, pct against buy basis
    let buy_fee = buy.total_fee();
    let sell_fee = sell.total_fee();
    let expected_profit = dec!(118800) - dec!(99000) - buy_fee - sell_fee;
    assert_eq!(sell.pnl_profit_amount, Some(expected_profit));
    let expected_pct = expected_profit.to_f64().unwrap()
        / (99_000.0 + buy_fee.to_f64().unwrap());
    assert!((sell.pnl_profit_pct.unwrap() - expected_pct).abs() < 1e-9);

    let final_nav = engine.nav_history().last().unwrap().nav;
    assert!(final_nav > 1.0, "final NAV should beat 1.0, got {}", final_nav);
    assert_invariants(&engine, 100_000.0);
}

// The top-ranked name is limit-up on the fill day; backfill promotes the
// runner-up on T-day and nothing enters the pending queue.
#[test]
fn limit_up_on_fill_day_backfills_the_runner_up() {
    let cal = calendar();
    let mut bars = Vec::new();
    for day in &DAYS[..2] {
        bars.push(bar(
            "600001.SH",
            day,
            &BarSpec {
                close: 10.0,
                limit_up: *day == "20230104",
                ..BarSpec::default()
            },
        ));
        bars.push(bar("600002.SH", day, &flat(20.0)));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let config = base_config(100_000.0);
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 0.9), ("600002.SH", 0.5)]);
    engine
        .run(date("20230103"), date("20230104"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let trades = engine.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].ticker, "600002.SH");
    assert_eq!(trades[0].date, date("20230104"));
    assert_eq!(engine.pending_orders(), 0);
    assert!(engine.portfolio().position("600001.SH").is_none());
    assert_invariants(&engine, 100_000.0);
}

// A drawdown stop-loss triggers on the close that breaches the floor and
// the position is sold on the next trading day.
#[test]
fn drawdown_stop_loss_sells_next_day() {
    let cal = calendar();
    let closes = [10.0, 10.0, 9.0, 8.5, 8.0, 7.9, 7.9];
    let mut bars = Vec::new();
    for (day, close) in DAYS.iter().zip(closes) {
        bars.push(bar("600001.SH", day, &flat(close)));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let mut config = base_config(100_000.0);
    config.holding_period = None;
    config.stop_loss_enabled = true;
    config.stop_loss_drawdown_pct = 20.0;
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230110"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let sells: Vec<_> = engine
        .trades()
        .iter()
        .filter(|t| t.side == TradeSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    let sell = sells[0];
    // floor is 10 * 0.8 = 8.0, first breached on 20230109; fill next day
    assert_eq!(sell.date, date("20230110"));
    assert_eq!(sell.trade_price, dec!(7.9));
    assert_eq!(sell.sell_type, Some(SellType::StopLoss));
    assert_eq!(sell.stop_loss_trigger, Some(StopLossTriggerKind::Drawdown));
    assert!(sell.pnl_profit_amount.unwrap() < dec!(0));
    assert_invariants(&engine, 100_000.0);
}

// A consecutive-limit-down trigger enqueues the sell; the retry fails
// while the name stays locked and fills on the first clear day.
#[test]
fn consecutive_limit_down_defers_the_sell() {
    let cal = calendar();
    let mut bars = Vec::new();
    let specs = [
        ("20230103", 10.0, false),
        ("20230104", 10.0, false),
        ("20230105", 9.0, true),
        ("20230106", 8.1, true),
        ("20230109", 7.3, true),
        ("20230110", 7.3, false),
    ];
    for (day, close, limit_down) in specs {
        bars.push(bar(
            "600001.SH",
            day,
            &BarSpec {
                close,
                limit_down,
                ..BarSpec::default()
            },
        ));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let mut config = base_config(100_000.0);
    config.holding_period = None;
    config.stop_loss_enabled = true;
    config.stop_loss_drawdown_pct = 50.0;
    config.stop_loss_consecutive_limit_down = 2;
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230110"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let sells: Vec<_> = engine
        .trades()
        .iter()
        .filter(|t| t.side == TradeSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    let sell = sells[0];
    // trigger on 20230106 (two limit-down closes), blocked on 20230109,
    // filled on 20230110
    assert_eq!(sell.date, date("20230110"));
    assert_eq!(
        sell.stop_loss_trigger,
        Some(StopLossTriggerKind::ConsecutiveLimitDown)
    );
    assert_eq!(sell.sell_type, Some(SellType::StopLoss));
    assert_eq!(engine.pending_orders(), 0);
    assert_invariants(&engine, 100_000.0);
}

// A deferred sell that stays blocked past max_retry_days expires with
// no sell record.
#[test]
fn pending_sell_expires_after_the_retry_window() {
    let cal = calendar();
    let mut bars = Vec::new();
    for (i, day) in DAYS.iter().enumerate() {
        // Locked limit-down from the third day onwards
        bars.push(bar(
            "600001.SH",
            day,
            &BarSpec {
                close: if i < 2 { 10.0 } else { 9.0 },
                limit_down: i >= 2,
                ..BarSpec::default()
            },
        ));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let mut config = base_config(100_000.0);
    config.holding_period = Some(1);
    config.max_retries = 1;
    config.max_retry_days = 1;
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230111"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let sells = engine
        .trades()
        .iter()
        .filter(|t| t.side == TradeSide::Sell)
        .count();
    assert_eq!(sells, 0, "the locked position can never sell");
    // The original deferral expired and was dropped; what remains is the
    // fresh order the still-due exit re-armed afterwards.
    assert!(engine.pending_orders() <= 1);
    assert!(engine.portfolio().position("600001.SH").is_some());
    assert_invariants(&engine, 100_000.0);
}

// After a drawdown the equity controller shrinks the
// invested notional of the next entry.
#[test]
fn equity_curve_shrinks_entries_after_a_drawdown() {
    let cal = calendar();
    // Price collapses after the entry, then stabilizes
    let closes = [10.0, 10.0, 8.2, 8.2, 8.2, 8.2, 8.2];
    let mut bars = Vec::new();
    for (day, close) in DAYS.iter().zip(closes) {
        bars.push(bar("600001.SH", day, &flat(close)));
    }
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let mut config = base_config(100_000.0);
    config.holding_period = Some(1);
    config.equity_curve_enabled = true;
    config.equity_curve_ma_short = 1;
    config.equity_curve_ma_long = 2;
    config.equity_curve_ma_exposure_on = 1.0;
    config.equity_curve_ma_exposure_off = 1.0;
    config.equity_curve_recovery_mode = ashare_engine::equity_curve::RecoveryMode::Immediate;
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230111"), &ranker, &FeaturesByDate::new())
        .unwrap();

    let buys: Vec<_> = engine
        .trades()
        .iter()
        .filter(|t| t.side == TradeSide::Buy)
        .collect();
    assert!(buys.len() >= 2, "expected re-entries after exits");

    let first_ratio = buys[0].gross_amount.to_f64().unwrap() / 100_000.0;
    assert!(first_ratio > 0.95, "first entry should be near fully invested");

    // NAV fell ~18% with the price: the 15% bracket caps exposure at 0.4
    let nav_at_entry = engine.nav_history()[2].total_value.to_f64().unwrap();
    let later = buys.last().unwrap();
    let later_ratio = later.gross_amount.to_f64().unwrap() / nav_at_entry;
    assert!(
        later_ratio < 0.5,
        "post-drawdown entry should be scaled down, invested {:.2} of equity",
        later_ratio
    );
    assert_invariants(&engine, 100_000.0);
}

// A suspended name cannot be marked tradable through silence: a missing bar
// on the fill day drops the buy.
#[test]
fn missing_bar_on_fill_day_drops_the_buy() {
    let cal = calendar();
    let bars = vec![
        bar("600001.SH", "20230103", &flat(10.0)),
        // no bar on 20230104
        bar("600001.SH", "20230105", &flat(10.0)),
    ];
    let index = PriceIndex::build(&bars).unwrap();
    let tradability = TradabilityMap::build(&bars);

    let config = base_config(100_000.0);
    let mut engine =
        ExecutionEngine::new(config.engine_config().unwrap(), &cal, &index, &tradability).unwrap();
    let ranker = ListRanker(vec![("600001.SH", 1.0)]);
    engine
        .run(date("20230103"), date("20230104"), &ranker, &FeaturesByDate::new())
        .unwrap();

    assert!(engine.trades().is_empty());
    assert_eq!(engine.pending_orders(), 0);
    assert_invariants(&engine, 100_000.0);
}
