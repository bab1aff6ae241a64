use std::collections::{BTreeMap, HashMap};

use anyhow::{ensure, Result};
use log::warn;

use crate::calendar::TradeDate;
use crate::errors::LookupError;
use crate::models::{Bar, PriceSource};

#[derive(Debug, Clone, Copy)]
struct PriceRow {
    open: Option<f64>,
    close: f64,
    open_adj: Option<f64>,
    close_adj: Option<f64>,
}

/// Dual-keyed price lookup built once from the clean bar table and immutable
/// afterwards. Tickers are interned to compact ids; each date maps ids to a
/// columnar price row, and each ticker keeps its pnl-close series for
/// last-known fallbacks and trailing windows.
pub struct PriceIndex {
    tickers: Vec<String>,
    ids: HashMap<String, u32>,
    day_rows: BTreeMap<TradeDate, HashMap<u32, PriceRow>>,
    pnl_series: Vec<Vec<(TradeDate, f64)>>,
}

impl PriceIndex {
    pub fn build(bars: &[Bar]) -> Result<Self> {
        let mut index = PriceIndex {
            tickers: Vec::new(),
            ids: HashMap::new(),
            day_rows: BTreeMap::new(),
            pnl_series: Vec::new(),
        };

        let mut missing_adj = 0usize;
        for bar in bars {
            ensure!(
                bar.close.is_finite() && bar.close > 0.0,
                "bar for {} on {} has invalid close {}",
                bar.ticker,
                bar.date,
                bar.close
            );
            if bar.close_adj.is_none() {
                missing_adj += 1;
            }
            let id = index.intern(&bar.ticker);
            let row = PriceRow {
                open: bar.open.filter(|p| p.is_finite() && *p > 0.0),
                close: bar.close,
                open_adj: bar.open_adj.filter(|p| p.is_finite() && *p > 0.0),
                close_adj: bar.close_adj.filter(|p| p.is_finite() && *p > 0.0),
            };
            let replaced = index.day_rows.entry(bar.date).or_default().insert(id, row);
            ensure!(
                replaced.is_none(),
                "duplicate bar for {} on {}",
                bar.ticker,
                bar.date
            );
        }

        if missing_adj > 0 {
            warn!(
                "{} bars lack close_adj; pnl prices fall back to the unadjusted close",
                missing_adj
            );
        }

        // Per-ticker pnl series in date order for fallback and vol windows.
        for (date, rows) in &index.day_rows {
            for (id, row) in rows {
                index.pnl_series[*id as usize].push((*date, row.close_adj.unwrap_or(row.close)));
            }
        }
        for series in &mut index.pnl_series {
            series.sort_by_key(|(date, _)| *date);
        }

        Ok(index)
    }

    fn intern(&mut self, ticker: &str) -> u32 {
        if let Some(id) = self.ids.get(ticker) {
            return *id;
        }
        let id = self.tickers.len() as u32;
        self.tickers.push(ticker.to_string());
        self.ids.insert(ticker.to_string(), id);
        self.pnl_series.push(Vec::new());
        id
    }

    fn row(&self, date: TradeDate, ticker: &str) -> Result<&PriceRow, LookupError> {
        self.ids
            .get(ticker)
            .and_then(|id| self.day_rows.get(&date)?.get(id))
            .ok_or_else(|| LookupError::missing(ticker, date))
    }

    pub fn has(&self, date: TradeDate, ticker: &str) -> bool {
        self.row(date, ticker).is_ok()
    }

    /// Unadjusted execution price. An open request degrades to the close
    /// when the open is missing.
    pub fn trade_price(
        &self,
        date: TradeDate,
        ticker: &str,
        source: PriceSource,
    ) -> Result<f64, LookupError> {
        let row = self.row(date, ticker)?;
        Ok(match source {
            PriceSource::Close => row.close,
            PriceSource::Open => row.open.unwrap_or_else(|| {
                warn!("{} has no open on {}, degrading to close", ticker, date);
                row.close
            }),
        })
    }

    /// Back-adjusted attribution price with the same timing as the fill.
    /// Never fails once the (date, ticker) pair is indexed: missing adjusted
    /// columns fall back to the unadjusted value.
    pub fn pnl_price(
        &self,
        date: TradeDate,
        ticker: &str,
        source: PriceSource,
    ) -> Result<f64, LookupError> {
        let row = self.row(date, ticker)?;
        Ok(match source {
            PriceSource::Close => row.close_adj.unwrap_or(row.close),
            PriceSource::Open => row
                .open_adj
                .or(row.open)
                .unwrap_or_else(|| row.close_adj.unwrap_or(row.close)),
        })
    }

    /// Most recent pnl close at or before `date`, for marking held tickers
    /// whose bar is missing on the valuation day.
    pub fn last_pnl_price_at_or_before(&self, date: TradeDate, ticker: &str) -> Option<f64> {
        let id = *self.ids.get(ticker)?;
        let series = &self.pnl_series[id as usize];
        let idx = series.partition_point(|(d, _)| *d <= date);
        if idx == 0 {
            None
        } else {
            Some(series[idx - 1].1)
        }
    }

    /// Up to `count` pnl closes strictly before `date`, oldest first.
    pub fn pnl_closes_before(&self, date: TradeDate, ticker: &str, count: usize) -> Vec<f64> {
        let Some(id) = self.ids.get(ticker) else {
            return Vec::new();
        };
        let series = &self.pnl_series[*id as usize];
        let end = series.partition_point(|(d, _)| *d < date);
        let start = end.saturating_sub(count);
        series[start..end].iter().map(|(_, price)| *price).collect()
    }

    /// Tickers with a bar on `date`, lexicographically sorted.
    pub fn tickers_on(&self, date: TradeDate) -> Vec<String> {
        let mut out: Vec<String> = self
            .day_rows
            .get(&date)
            .map(|rows| {
                rows.keys()
                    .map(|id| self.tickers[*id as usize].clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn dates(&self) -> Vec<TradeDate> {
        self.day_rows.keys().copied().collect()
    }
}
