use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use log::info;
use polars::prelude::*;

use crate::calendar::{TradeDate, TradingCalendar};
use crate::models::Bar;

const REQUIRED_COLUMNS: [&str; 8] = [
    "ts_code",
    "trade_date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "amount",
];

/// Read a clean bar table from Parquet and validate it into typed rows.
pub fn load_bar_table(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open bar table {}", path.display()))?;
    let df = ParquetReader::new(file)
        .finish()
        .with_context(|| format!("failed to read bar table {}", path.display()))?;
    let bars = bars_from_dataframe(&df)
        .with_context(|| format!("invalid bar table {}", path.display()))?;
    info!("loaded {} bars from {}", bars.len(), path.display());
    Ok(bars)
}

/// Validate a bar dataframe. Missing required columns, unparseable dates and
/// non-finite values in load-bearing columns are data-integrity errors that
/// abort the run.
pub fn bars_from_dataframe(df: &DataFrame) -> Result<Vec<Bar>> {
    for name in REQUIRED_COLUMNS {
        ensure!(
            df.column(name).is_ok(),
            "bar table is missing required column {}",
            name
        );
    }

    let tickers = string_column(df, "ts_code")?;
    let dates = string_column(df, "trade_date")?;
    let opens = float_column(df, "open")?;
    let highs = float_column(df, "high")?;
    let lows = float_column(df, "low")?;
    let closes = float_column(df, "close")?;
    let volumes = float_column(df, "volume")?;
    let amounts = float_column(df, "amount")?;
    let open_adjs = optional_float_column(df, "open_adj")?;
    let close_adjs = optional_float_column(df, "close_adj")?;
    let pct_changes = optional_float_column(df, "pct_change")?;
    let is_st = optional_flag_column(df, "is_st")?;
    let is_suspended = optional_flag_column(df, "is_suspended")?;
    let is_limit_up = optional_flag_column(df, "is_limit_up")?;
    let is_limit_down = optional_flag_column(df, "is_limit_down")?;

    let mut bars = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let ticker = tickers
            .get(row)
            .ok_or_else(|| anyhow!("null ts_code in row {}", row))?
            .to_string();
        let raw_date = dates
            .get(row)
            .ok_or_else(|| anyhow!("null trade_date for {} (row {})", ticker, row))?;
        let date = TradeDate::parse(raw_date)
            .with_context(|| format!("bad trade_date for {} (row {})", ticker, row))?;

        let close = closes
            .get(row)
            .filter(|v| v.is_finite())
            .ok_or_else(|| anyhow!("missing close for {} on {}", ticker, date))?;
        ensure!(close > 0.0, "non-positive close {} for {} on {}", close, ticker, date);
        let volume = volumes
            .get(row)
            .filter(|v| v.is_finite())
            .ok_or_else(|| anyhow!("missing volume for {} on {}", ticker, date))?;
        let amount = amounts
            .get(row)
            .filter(|v| v.is_finite())
            .ok_or_else(|| anyhow!("missing amount for {} on {}", ticker, date))?;

        bars.push(Bar {
            ticker,
            date,
            open: opens.get(row).filter(|v| v.is_finite() && *v > 0.0),
            high: highs.get(row).filter(|v| v.is_finite() && *v > 0.0),
            low: lows.get(row).filter(|v| v.is_finite() && *v > 0.0),
            close,
            open_adj: open_adjs.as_ref().and_then(|col| col.get(row)).filter(|v| v.is_finite()),
            close_adj: close_adjs.as_ref().and_then(|col| col.get(row)).filter(|v| v.is_finite()),
            volume,
            amount,
            pct_change: pct_changes.as_ref().and_then(|col| col.get(row)).filter(|v| v.is_finite()),
            is_st: is_st.as_ref().and_then(|col| col[row]),
            is_suspended: is_suspended.as_ref().and_then(|col| col[row]),
            is_limit_up: is_limit_up.as_ref().and_then(|col| col[row]),
            is_limit_down: is_limit_down.as_ref().and_then(|col| col[row]),
        });
    }

    Ok(bars)
}

/// Distinct bar dates in order, for runs without an explicit calendar file.
pub fn calendar_from_bars(bars: &[Bar]) -> Result<TradingCalendar> {
    let mut dates: Vec<TradeDate> = bars.iter().map(|bar| bar.date).collect();
    dates.sort();
    dates.dedup();
    TradingCalendar::new(dates)
}

/// Load a trading calendar from a text file with one YYYYMMDD per line.
pub fn load_calendar_file(path: &Path) -> Result<TradingCalendar> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read calendar {}", path.display()))?;
    let lines: Vec<String> = raw
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    TradingCalendar::parse(&lines)
        .with_context(|| format!("invalid calendar {}", path.display()))
}

fn string_column(df: &DataFrame, name: &str) -> Result<StringChunked> {
    let series = df
        .column(name)
        .map_err(|_| anyhow!("missing column {}", name))?
        .as_materialized_series()
        .clone();
    Ok(series
        .str()
        .map_err(|_| anyhow!("column {} must be a string column", name))?
        .clone())
}

fn float_column(df: &DataFrame, name: &str) -> Result<Float64Chunked> {
    let series = df
        .column(name)
        .map_err(|_| anyhow!("missing column {}", name))?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .map_err(|_| anyhow!("column {} must be numeric", name))?;
    Ok(series.f64().expect("cast to f64 above").clone())
}

fn optional_float_column(df: &DataFrame, name: &str) -> Result<Option<Float64Chunked>> {
    if df.column(name).is_err() {
        return Ok(None);
    }
    float_column(df, name).map(Some)
}

/// Flag columns arrive as bool or 0/1 integers depending on the writer.
fn optional_flag_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<bool>>>> {
    if df.column(name).is_err() {
        return Ok(None);
    }
    let values = float_column(df, name)?;
    Ok(Some(
        values
            .into_iter()
            .map(|value| value.map(|v| v > 0.5))
            .collect(),
    ))
}
