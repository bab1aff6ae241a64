use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::calendar::TradeDate;
use crate::config::PaperConfig;
use crate::models::{
    AccountState, NavPoint, PendingOrder, SellType, StopLossTriggerKind, TargetWeight,
    TradeRecord, TradeSide,
};
use crate::scheduler::RebalanceState;
use crate::stop_loss::PositionRisk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    T0,
    T1,
}

impl RunKind {
    fn prefix(&self) -> &'static str {
        match self {
            RunKind::T0 => "t0",
            RunKind::T1 => "t1",
        }
    }
}

/// File-backed persistence for paper mode. The directory layout is a
/// compatibility contract:
///
/// ```text
/// paper/
///   config.json
///   pending/{YYYYMMDD}.parquet
///   pending_sells/pending_sells.json
///   state/account.json
///   state/stop_loss_state.json
///   trades/trades.parquet
///   nav/nav.parquet
///   runs/t0_{YYYYMMDD}.json
///   runs/t1_{YYYYMMDD}.json
///   runs/rebalance_state.json
/// ```
///
/// All writes go through a temp file and an atomic rename; a reload that
/// fails to parse is surfaced as corruption, never silently replaced.
pub struct PaperStore {
    root: PathBuf,
}

impl PaperStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["pending", "pending_sells", "state", "trades", "nav", "runs"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("failed to create {}", root.join(sub).display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclusive-create lock file serializing concurrent paper processes.
    pub fn lock(&self) -> Result<StoreLock> {
        let path = self.root.join(".lock");
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                anyhow!(
                    "another process holds the paper lock at {} ({})",
                    path.display(),
                    err
                )
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(StoreLock { path })
    }

    // ---- config ----

    pub fn save_config(&self, config: &PaperConfig) -> Result<()> {
        write_json_atomic(&self.root.join("config.json"), config)
    }

    pub fn load_config(&self) -> Result<Option<PaperConfig>> {
        read_json(&self.root.join("config.json"))
    }

    // ---- account / stop-loss state ----

    pub fn save_account(&self, state: &AccountState) -> Result<()> {
        write_json_atomic(&self.root.join("state").join("account.json"), state)
    }

    pub fn load_account(&self) -> Result<Option<AccountState>> {
        read_json(&self.root.join("state").join("account.json"))
    }

    pub fn save_stop_loss_state(&self, state: &BTreeMap<String, PositionRisk>) -> Result<()> {
        write_json_atomic(&self.root.join("state").join("stop_loss_state.json"), state)
    }

    pub fn load_stop_loss_state(&self) -> Result<Option<BTreeMap<String, PositionRisk>>> {
        read_json(&self.root.join("state").join("stop_loss_state.json"))
    }

    // ---- pending sells / rebalance state ----

    pub fn save_pending_orders(&self, orders: &[PendingOrder]) -> Result<()> {
        write_json_atomic(
            &self.root.join("pending_sells").join("pending_sells.json"),
            &orders,
        )
    }

    pub fn load_pending_orders(&self) -> Result<Vec<PendingOrder>> {
        Ok(read_json(&self.root.join("pending_sells").join("pending_sells.json"))?
            .unwrap_or_default())
    }

    pub fn save_rebalance_state(&self, state: &RebalanceState) -> Result<()> {
        write_json_atomic(&self.root.join("runs").join("rebalance_state.json"), state)
    }

    pub fn load_rebalance_state(&self) -> Result<Option<RebalanceState>> {
        read_json(&self.root.join("runs").join("rebalance_state.json"))
    }

    // ---- idempotency sentinels ----

    fn run_path(&self, kind: RunKind, date: TradeDate) -> PathBuf {
        self.root
            .join("runs")
            .join(format!("{}_{}.json", kind.prefix(), date))
    }

    pub fn run_exists(&self, kind: RunKind, date: TradeDate) -> bool {
        self.run_path(kind, date).exists()
    }

    pub fn save_run_record(
        &self,
        kind: RunKind,
        date: TradeDate,
        record: &serde_json::Value,
    ) -> Result<()> {
        write_json_atomic(&self.run_path(kind, date), record)
    }

    // ---- pending target weights ----

    pub fn save_pending_weights(&self, date: TradeDate, targets: &[TargetWeight]) -> Result<()> {
        let tickers: Vec<&str> = targets.iter().map(|t| t.ticker.as_str()).collect();
        let weights: Vec<f64> = targets.iter().map(|t| t.weight).collect();
        let reasons: Vec<&str> = targets.iter().map(|t| t.reason.as_str()).collect();
        let mut frame = df!(
            "ts_code" => tickers,
            "target_weight" => weights,
            "reason" => reasons,
        )?;
        write_parquet_atomic(
            &self.root.join("pending").join(format!("{}.parquet", date)),
            &mut frame,
        )
    }

    pub fn load_pending_weights(&self, date: TradeDate) -> Result<Option<Vec<TargetWeight>>> {
        let path = self.root.join("pending").join(format!("{}.parquet", date));
        if !path.exists() {
            return Ok(None);
        }
        let frame = read_parquet(&path)?;
        let tickers = frame
            .column("ts_code")
            .map_err(|_| corrupt(&path, "ts_code column missing"))?
            .as_materialized_series()
            .clone();
        let tickers = tickers
            .str()
            .map_err(|_| corrupt(&path, "ts_code is not a string column"))?;
        let weights = frame
            .column("target_weight")
            .map_err(|_| corrupt(&path, "target_weight column missing"))?
            .as_materialized_series()
            .cast(&DataType::Float64)
            .map_err(|_| corrupt(&path, "target_weight is not numeric"))?;
        let weights = weights.f64().expect("cast above").clone();
        let reasons = frame
            .column("reason")
            .ok()
            .map(|col| col.as_materialized_series().clone());

        let mut targets = Vec::with_capacity(frame.height());
        for row in 0..frame.height() {
            let ticker = tickers
                .get(row)
                .ok_or_else(|| corrupt(&path, "null ts_code"))?
                .to_string();
            let weight = weights
                .get(row)
                .ok_or_else(|| corrupt(&path, "null target_weight"))?;
            let reason = reasons
                .as_ref()
                .and_then(|col| col.str().ok())
                .and_then(|col| col.get(row))
                .unwrap_or("signal")
                .to_string();
            targets.push(TargetWeight {
                ticker,
                weight,
                reason,
            });
        }
        Ok(Some(targets))
    }

    // ---- trade log ----

    pub fn append_trades(&self, trades: &[TradeRecord]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let path = self.root.join("trades").join("trades.parquet");
        let mut new = trades_frame(trades)?;
        let mut combined = if path.exists() {
            let existing = read_parquet(&path)?;
            existing
                .vstack(&new)
                .map_err(|err| anyhow!("failed to append trades: {}", err))?
        } else {
            std::mem::take(&mut new)
        };
        write_parquet_atomic(&path, &mut combined)?;
        debug!("appended {} trade records", trades.len());
        Ok(())
    }

    // ---- NAV curve ----

    pub fn append_nav(&self, points: &[NavPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let path = self.root.join("nav").join("nav.parquet");
        let mut new = nav_frame(points)?;
        let mut combined = if path.exists() {
            let existing = read_parquet(&path)?;
            existing
                .vstack(&new)
                .map_err(|err| anyhow!("failed to append nav: {}", err))?
        } else {
            std::mem::take(&mut new)
        };
        write_parquet_atomic(&path, &mut combined)?;
        Ok(())
    }

    /// The persisted NAV curve as (date, nav) pairs in date order.
    pub fn load_nav_curve(&self) -> Result<Vec<(TradeDate, f64)>> {
        let path = self.root.join("nav").join("nav.parquet");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let frame = read_parquet(&path)?;
        let dates = frame
            .column("trade_date")
            .map_err(|_| corrupt(&path, "trade_date column missing"))?
            .as_materialized_series()
            .clone();
        let dates = dates
            .str()
            .map_err(|_| corrupt(&path, "trade_date is not a string column"))?;
        let navs = frame
            .column("nav")
            .map_err(|_| corrupt(&path, "nav column missing"))?
            .as_materialized_series()
            .cast(&DataType::Float64)
            .map_err(|_| corrupt(&path, "nav is not numeric"))?;
        let navs = navs.f64().expect("cast above").clone();

        let mut curve = Vec::with_capacity(frame.height());
        for row in 0..frame.height() {
            let raw = dates.get(row).ok_or_else(|| corrupt(&path, "null trade_date"))?;
            let date = TradeDate::parse(raw).map_err(|_| corrupt(&path, "bad trade_date"))?;
            let nav = navs.get(row).ok_or_else(|| corrupt(&path, "null nav"))?;
            curve.push((date, nav));
        }
        curve.sort_by_key(|(date, _)| *date);
        Ok(curve)
    }
}

/// Removes the lock file when the guard goes out of scope.
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub(crate) fn trades_frame(trades: &[TradeRecord]) -> Result<DataFrame> {
    let dec = |value: rust_decimal::Decimal| value.to_f64().unwrap_or(f64::NAN);
    let frame = df!(
        "trade_date" => trades.iter().map(|t| t.date.to_string()).collect::<Vec<_>>(),
        "ts_code" => trades.iter().map(|t| t.ticker.clone()).collect::<Vec<_>>(),
        "action" => trades.iter().map(|t| t.side.as_str()).collect::<Vec<_>>(),
        "shares" => trades.iter().map(|t| t.shares).collect::<Vec<_>>(),
        "trade_price" => trades.iter().map(|t| dec(t.trade_price)).collect::<Vec<_>>(),
        "pnl_price" => trades.iter().map(|t| t.pnl_price).collect::<Vec<_>>(),
        "amount" => trades.iter().map(|t| dec(t.gross_amount)).collect::<Vec<_>>(),
        "commission" => trades.iter().map(|t| dec(t.commission)).collect::<Vec<_>>(),
        "stamp_tax" => trades.iter().map(|t| dec(t.stamp_tax)).collect::<Vec<_>>(),
        "slippage" => trades.iter().map(|t| dec(t.slippage)).collect::<Vec<_>>(),
        "reason" => trades.iter().map(|t| t.reason.clone()).collect::<Vec<_>>(),
        "buy_trade_price" => trades.iter().map(|t| t.buy_trade_price.map(dec)).collect::<Vec<_>>(),
        "buy_pnl_price" => trades.iter().map(|t| t.buy_pnl_price).collect::<Vec<_>>(),
        "pnl_profit_amount" => trades.iter().map(|t| t.pnl_profit_amount.map(dec)).collect::<Vec<_>>(),
        "pnl_profit_pct" => trades.iter().map(|t| t.pnl_profit_pct).collect::<Vec<_>>(),
        "sell_type" => trades.iter().map(|t| t.sell_type.map(|s| s.as_str().to_string())).collect::<Vec<_>>(),
        "stop_loss_trigger" => trades.iter().map(|t| t.stop_loss_trigger.map(|k| k.as_str().to_string())).collect::<Vec<_>>(),
    )?;
    Ok(frame)
}

pub(crate) fn nav_frame(points: &[NavPoint]) -> Result<DataFrame> {
    let dec = |value: rust_decimal::Decimal| value.to_f64().unwrap_or(f64::NAN);
    let frame = df!(
        "trade_date" => points.iter().map(|p| p.date.to_string()).collect::<Vec<_>>(),
        "cash" => points.iter().map(|p| dec(p.cash)).collect::<Vec<_>>(),
        "market_value" => points.iter().map(|p| dec(p.market_value)).collect::<Vec<_>>(),
        "total_value" => points.iter().map(|p| dec(p.total_value)).collect::<Vec<_>>(),
        "nav" => points.iter().map(|p| p.nav).collect::<Vec<_>>(),
        "daily_return" => points.iter().map(|p| p.daily_return).collect::<Vec<_>>(),
    )?;
    Ok(frame)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        anyhow!("atomic rename to {} failed: {}", path.display(), err)
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw).map_err(|err| corrupt(path, &err.to_string()))?;
    Ok(Some(value))
}

pub(crate) fn write_parquet_atomic(path: &Path, frame: &mut DataFrame) -> Result<()> {
    let tmp = path.with_extension("parquet.tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    ParquetWriter::new(&mut file)
        .finish(frame)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        anyhow!("atomic rename to {} failed: {}", path.display(), err)
    })
}

fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|err| corrupt(path, &err.to_string()))
}

fn corrupt(path: &Path, detail: &str) -> anyhow::Error {
    anyhow!(
        "persisted state at {} is corrupt ({}); operator intervention required",
        path.display(),
        detail
    )
}

/// Simplified trade row used by the positions/report surfaces when reading
/// the persisted log back.
#[derive(Debug, Clone)]
pub struct StoredTrade {
    pub date: TradeDate,
    pub ticker: String,
    pub side: TradeSide,
    pub shares: i64,
    pub pnl_profit_pct: Option<f64>,
    pub sell_type: Option<SellType>,
    pub stop_loss_trigger: Option<StopLossTriggerKind>,
}

impl PaperStore {
    pub fn load_trades(&self) -> Result<Vec<StoredTrade>> {
        let path = self.root.join("trades").join("trades.parquet");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let frame = read_parquet(&path)?;
        let col_str = |name: &str| -> Result<Series> {
            Ok(frame
                .column(name)
                .map_err(|_| corrupt(&path, &format!("{} column missing", name)))?
                .as_materialized_series()
                .clone())
        };
        let dates = col_str("trade_date")?;
        let dates = dates
            .str()
            .map_err(|_| corrupt(&path, "trade_date is not a string column"))?
            .clone();
        let tickers = col_str("ts_code")?;
        let tickers = tickers
            .str()
            .map_err(|_| corrupt(&path, "ts_code is not a string column"))?
            .clone();
        let actions = col_str("action")?;
        let actions = actions
            .str()
            .map_err(|_| corrupt(&path, "action is not a string column"))?
            .clone();
        let shares = col_str("shares")?
            .cast(&DataType::Int64)
            .map_err(|_| corrupt(&path, "shares is not numeric"))?;
        let shares = shares.i64().expect("cast above").clone();
        let profit = col_str("pnl_profit_pct")
            .ok()
            .and_then(|s| s.cast(&DataType::Float64).ok())
            .and_then(|s| s.f64().ok().cloned());
        let sell_types = col_str("sell_type").ok().and_then(|s| s.str().ok().cloned());
        let triggers = col_str("stop_loss_trigger")
            .ok()
            .and_then(|s| s.str().ok().cloned());

        let mut out = Vec::with_capacity(frame.height());
        for row in 0..frame.height() {
            let raw_date = dates.get(row).ok_or_else(|| corrupt(&path, "null trade_date"))?;
            let side = match actions.get(row) {
                Some("buy") => TradeSide::Buy,
                Some("sell") => TradeSide::Sell,
                other => bail!("unknown trade action {:?} in {}", other, path.display()),
            };
            out.push(StoredTrade {
                date: TradeDate::parse(raw_date).map_err(|_| corrupt(&path, "bad trade_date"))?,
                ticker: tickers
                    .get(row)
                    .ok_or_else(|| corrupt(&path, "null ts_code"))?
                    .to_string(),
                side,
                shares: shares.get(row).unwrap_or(0),
                pnl_profit_pct: profit.as_ref().and_then(|col| col.get(row)),
                sell_type: sell_types.as_ref().and_then(|col| col.get(row)).and_then(parse_sell_type),
                stop_loss_trigger: triggers
                    .as_ref()
                    .and_then(|col| col.get(row))
                    .and_then(parse_trigger),
            });
        }
        Ok(out)
    }
}

fn parse_sell_type(raw: &str) -> Option<SellType> {
    match raw {
        "holding_period" => Some(SellType::HoldingPeriod),
        "stop_loss" => Some(SellType::StopLoss),
        "rebalance" => Some(SellType::Rebalance),
        "forced" => Some(SellType::Forced),
        _ => None,
    }
}

fn parse_trigger(raw: &str) -> Option<StopLossTriggerKind> {
    match raw {
        "drawdown" => Some(StopLossTriggerKind::Drawdown),
        "trailing" => Some(StopLossTriggerKind::Trailing),
        "consecutive_limit_down" => Some(StopLossTriggerKind::ConsecutiveLimitDown),
        _ => None,
    }
}
