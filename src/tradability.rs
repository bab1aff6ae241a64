use std::collections::{BTreeMap, HashMap};

use crate::calendar::TradeDate;
use crate::errors::LookupError;
use crate::models::Bar;

/// Daily price-move caps for the A-share market, in percent. Regular names
/// cap at 10% (detected at 9.9 to absorb rounding), ST names at 5%.
const LIMIT_PCT: f64 = 9.9;
const ST_LIMIT_PCT: f64 = 4.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tradability {
    pub suspended: bool,
    pub limit_up: bool,
    pub limit_down: bool,
}

/// Per-(date, ticker) tradability flags derived once from the bar table.
/// Explicit flag columns win; otherwise suspension comes from zero volume
/// and limit locks from `pct_change` against the ST-aware thresholds.
pub struct TradabilityMap {
    ids: HashMap<String, u32>,
    days: BTreeMap<TradeDate, HashMap<u32, Tradability>>,
}

impl TradabilityMap {
    pub fn build(bars: &[Bar]) -> Self {
        let mut ids: HashMap<String, u32> = HashMap::new();
        let mut days: BTreeMap<TradeDate, HashMap<u32, Tradability>> = BTreeMap::new();

        for bar in bars {
            let next_id = ids.len() as u32;
            let id = *ids.entry(bar.ticker.clone()).or_insert(next_id);
            days.entry(bar.date)
                .or_default()
                .insert(id, derive_flags(bar));
        }

        Self { ids, days }
    }

    /// Flags for a pair, or `MissingBar` when the pair is absent. Callers
    /// must treat the error as "untradable", never guess.
    pub fn flags(&self, date: TradeDate, ticker: &str) -> Result<Tradability, LookupError> {
        self.ids
            .get(ticker)
            .and_then(|id| self.days.get(&date)?.get(id))
            .copied()
            .ok_or_else(|| LookupError::missing(ticker, date))
    }

    /// Ok when a buy can fill on (date, ticker); the error names the block.
    pub fn can_buy(&self, date: TradeDate, ticker: &str) -> Result<(), LookupError> {
        let flags = self.flags(date, ticker)?;
        if flags.suspended {
            return Err(LookupError::Suspended {
                ticker: ticker.to_string(),
                date,
            });
        }
        if flags.limit_up {
            return Err(LookupError::LimitUp {
                ticker: ticker.to_string(),
                date,
            });
        }
        Ok(())
    }

    /// Ok when a sell can fill on (date, ticker); the error names the block.
    pub fn can_sell(&self, date: TradeDate, ticker: &str) -> Result<(), LookupError> {
        let flags = self.flags(date, ticker)?;
        if flags.suspended {
            return Err(LookupError::Suspended {
                ticker: ticker.to_string(),
                date,
            });
        }
        if flags.limit_down {
            return Err(LookupError::LimitDown {
                ticker: ticker.to_string(),
                date,
            });
        }
        Ok(())
    }

    pub fn is_limit_down(&self, date: TradeDate, ticker: &str) -> bool {
        self.flags(date, ticker)
            .map(|f| f.limit_down)
            .unwrap_or(false)
    }
}

fn derive_flags(bar: &Bar) -> Tradability {
    let suspended = bar
        .is_suspended
        .unwrap_or(bar.volume <= 0.0 || !bar.volume.is_finite());

    let threshold = if bar.is_st.unwrap_or(false) {
        ST_LIMIT_PCT
    } else {
        LIMIT_PCT
    };

    let limit_up = bar
        .is_limit_up
        .unwrap_or_else(|| bar.pct_change.map(|pct| pct >= threshold).unwrap_or(false));
    let limit_down = bar
        .is_limit_down
        .unwrap_or_else(|| bar.pct_change.map(|pct| pct <= -threshold).unwrap_or(false));

    Tradability {
        suspended,
        limit_up,
        limit_down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ticker: &str, date: &str) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            date: TradeDate::parse(date).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 10.0,
            open_adj: None,
            close_adj: None,
            volume: 1000.0,
            amount: 10_000.0,
            pct_change: None,
            is_st: None,
            is_suspended: None,
            is_limit_up: None,
            is_limit_down: None,
        }
    }

    #[test]
    fn zero_volume_means_suspended() {
        let mut b = bar("000001.SZ", "20230103");
        b.volume = 0.0;
        let map = TradabilityMap::build(&[b]);
        let date = TradeDate::parse("20230103").unwrap();
        let err = map.can_buy(date, "000001.SZ").unwrap_err();
        assert_eq!(err.reason(), "suspended");
        assert_eq!(map.can_sell(date, "000001.SZ").unwrap_err().reason(), "suspended");
    }

    #[test]
    fn pct_change_detection_respects_st_threshold() {
        let mut regular = bar("000001.SZ", "20230103");
        regular.pct_change = Some(5.0);
        let mut st = bar("000002.SZ", "20230103");
        st.pct_change = Some(5.0);
        st.is_st = Some(true);

        let map = TradabilityMap::build(&[regular, st]);
        let date = TradeDate::parse("20230103").unwrap();
        // 5% move locks an ST name but not a regular one
        assert!(map.can_buy(date, "000001.SZ").is_ok());
        assert_eq!(map.can_buy(date, "000002.SZ").unwrap_err().reason(), "limit_up");
    }

    #[test]
    fn explicit_flags_win_over_derivation() {
        let mut b = bar("000001.SZ", "20230103");
        b.pct_change = Some(0.0);
        b.is_limit_down = Some(true);
        let map = TradabilityMap::build(&[b]);
        let date = TradeDate::parse("20230103").unwrap();
        assert!(map.can_buy(date, "000001.SZ").is_ok());
        assert_eq!(map.can_sell(date, "000001.SZ").unwrap_err().reason(), "limit_down");
    }

    #[test]
    fn missing_pair_is_not_guessed() {
        let map = TradabilityMap::build(&[bar("000001.SZ", "20230103")]);
        let other = TradeDate::parse("20230104").unwrap();
        assert_eq!(map.can_buy(other, "000001.SZ").unwrap_err().reason(), "missing_bar");
    }
}
