use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, ensure, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A trading-calendar day, carried as `YYYYMMDD` on every external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        ensure!(
            trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()),
            "trade date must be an eight-digit YYYYMMDD string (value: {})",
            raw
        );
        let date = NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .map_err(|_| anyhow!("invalid trade date {}", raw))?;
        Ok(TradeDate(date))
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl Serialize for TradeDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TradeDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TradeDate::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Ordered sequence of open trading days. The engine never sees a date that
/// is not in this sequence.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    dates: Vec<TradeDate>,
    index: HashMap<TradeDate, usize>,
}

impl TradingCalendar {
    pub fn new(dates: Vec<TradeDate>) -> Result<Self> {
        ensure!(!dates.is_empty(), "trading calendar cannot be empty");
        for pair in dates.windows(2) {
            ensure!(
                pair[0] < pair[1],
                "trading calendar must be strictly increasing ({} then {})",
                pair[0],
                pair[1]
            );
        }
        let index = dates
            .iter()
            .enumerate()
            .map(|(i, date)| (*date, i))
            .collect();
        Ok(Self { dates, index })
    }

    pub fn parse(raw_dates: &[String]) -> Result<Self> {
        let dates = raw_dates
            .iter()
            .map(|raw| TradeDate::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        Self::new(dates)
    }

    pub fn dates(&self) -> &[TradeDate] {
        &self.dates
    }

    pub fn first(&self) -> TradeDate {
        self.dates[0]
    }

    pub fn last(&self) -> TradeDate {
        *self.dates.last().expect("calendar is non-empty")
    }

    pub fn contains(&self, date: TradeDate) -> bool {
        self.index.contains_key(&date)
    }

    pub fn index_of(&self, date: TradeDate) -> Option<usize> {
        self.index.get(&date).copied()
    }

    /// The next trading day strictly after `date`.
    pub fn next_after(&self, date: TradeDate) -> Option<TradeDate> {
        match self.dates.binary_search(&date) {
            Ok(idx) => self.dates.get(idx + 1).copied(),
            Err(idx) => self.dates.get(idx).copied(),
        }
    }

    /// Normalize an arbitrary calendar date to a trading day: the date
    /// itself when the market is open, otherwise the next open day.
    pub fn roll_forward(&self, date: TradeDate) -> Option<TradeDate> {
        match self.dates.binary_search(&date) {
            Ok(idx) => self.dates.get(idx).copied(),
            Err(idx) => self.dates.get(idx).copied(),
        }
    }

    /// Count of trading days in `(from, to]`. Zero when `to <= from`.
    pub fn distance(&self, from: TradeDate, to: TradeDate) -> Result<usize> {
        let from_idx = self
            .index_of(from)
            .ok_or_else(|| anyhow!("{} is not in the trading calendar", from))?;
        let to_idx = self
            .index_of(to)
            .ok_or_else(|| anyhow!("{} is not in the trading calendar", to))?;
        Ok(to_idx.saturating_sub(from_idx))
    }

    /// The trading day `n` days after `date`.
    pub fn shift(&self, date: TradeDate, n: usize) -> Option<TradeDate> {
        let idx = self.index_of(date)?;
        self.dates.get(idx + n).copied()
    }

    /// Inclusive range of trading days between two dates.
    pub fn range(&self, start: TradeDate, end: TradeDate) -> Vec<TradeDate> {
        self.dates
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar() -> TradingCalendar {
        let raw: Vec<String> = ["20230103", "20230104", "20230105", "20230109", "20230110"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        TradingCalendar::parse(&raw).unwrap()
    }

    #[test]
    fn parse_rejects_malformed_dates() {
        assert!(TradeDate::parse("2023-01-03").is_err());
        assert!(TradeDate::parse("20231340").is_err());
        assert_eq!(TradeDate::parse("20230103").unwrap().to_string(), "20230103");
    }

    #[test]
    fn rejects_unsorted_calendar() {
        let raw: Vec<String> = ["20230104", "20230103"].iter().map(|s| s.to_string()).collect();
        assert!(TradingCalendar::parse(&raw).is_err());
    }

    #[test]
    fn roll_forward_skips_closed_days() {
        let cal = calendar();
        // 20230106 is not an open day in this calendar
        let rolled = cal.roll_forward(TradeDate::parse("20230106").unwrap()).unwrap();
        assert_eq!(rolled.to_string(), "20230109");
        let open = cal.roll_forward(TradeDate::parse("20230104").unwrap()).unwrap();
        assert_eq!(open.to_string(), "20230104");
    }

    #[test]
    fn distance_counts_trading_days_only() {
        let cal = calendar();
        let a = TradeDate::parse("20230104").unwrap();
        let b = TradeDate::parse("20230110").unwrap();
        assert_eq!(cal.distance(a, b).unwrap(), 3);
        assert_eq!(cal.distance(b, a).unwrap(), 0);
    }

    #[test]
    fn shift_walks_the_calendar() {
        let cal = calendar();
        let start = TradeDate::parse("20230104").unwrap();
        assert_eq!(cal.shift(start, 2).unwrap().to_string(), "20230109");
        assert!(cal.shift(start, 10).is_none());
    }
}
