use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::calendar::{TradeDate, TradingCalendar};

/// Persistent scheduler state, written to `runs/rebalance_state.json` in
/// paper mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceState {
    pub last_rebalance_date: Option<TradeDate>,
    pub rebalance_freq: u32,
    #[serde(default)]
    pub tranche_cursor: u32,
}

/// Decides whether a trading day opens a rebalance window: the first day of
/// a run always does, afterwards a day qualifies when at least
/// `rebalance_freq` trading days have passed since the last rebalance.
/// Optional batch mode splits the target count across `tranches` rebalance
/// periods.
#[derive(Debug, Clone)]
pub struct Scheduler {
    rebalance_freq: u32,
    last_rebalance_date: Option<TradeDate>,
    tranches: Option<u32>,
    tranche_cursor: u32,
}

impl Scheduler {
    pub fn new(rebalance_freq: u32, tranches: Option<u32>) -> Self {
        Self {
            rebalance_freq: rebalance_freq.max(1),
            last_rebalance_date: None,
            tranches: tranches.filter(|t| *t > 1),
            tranche_cursor: 0,
        }
    }

    pub fn from_state(state: &RebalanceState, tranches: Option<u32>) -> Self {
        let mut scheduler = Self::new(state.rebalance_freq, tranches);
        scheduler.last_rebalance_date = state.last_rebalance_date;
        scheduler.tranche_cursor = state.tranche_cursor;
        scheduler
    }

    pub fn to_state(&self) -> RebalanceState {
        RebalanceState {
            last_rebalance_date: self.last_rebalance_date,
            rebalance_freq: self.rebalance_freq,
            tranche_cursor: self.tranche_cursor,
        }
    }

    pub fn last_rebalance_date(&self) -> Option<TradeDate> {
        self.last_rebalance_date
    }

    pub fn is_rebalance_day(&self, date: TradeDate, calendar: &TradingCalendar) -> Result<bool> {
        match self.last_rebalance_date {
            None => Ok(true),
            Some(last) => {
                if date <= last {
                    return Ok(false);
                }
                Ok(calendar.distance(last, date)? >= self.rebalance_freq as usize)
            }
        }
    }

    /// Record a completed rebalance; in batch mode this also advances the
    /// tranche cursor.
    pub fn mark(&mut self, date: TradeDate) {
        self.last_rebalance_date = Some(date);
        if let Some(tranches) = self.tranches {
            self.tranche_cursor = (self.tranche_cursor + 1) % tranches;
        }
    }

    /// The tranche due at the next rebalance (zero-based), and the tranche
    /// count. `None` when batch mode is off.
    pub fn due_tranche(&self) -> Option<(u32, u32)> {
        self.tranches.map(|tranches| (self.tranche_cursor, tranches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar() -> TradingCalendar {
        let raw: Vec<String> = (1..=20)
            .map(|day| format!("202303{:02}", day))
            .filter(|raw| {
                // Treat the 4th/5th/11th/12th/18th/19th as closed
                !matches!(&raw[6..], "04" | "05" | "11" | "12" | "18" | "19")
            })
            .collect();
        TradingCalendar::parse(&raw).unwrap()
    }

    fn date(raw: &str) -> TradeDate {
        TradeDate::parse(raw).unwrap()
    }

    #[test]
    fn first_day_is_always_a_rebalance_day() {
        let cal = calendar();
        let scheduler = Scheduler::new(5, None);
        assert!(scheduler.is_rebalance_day(date("20230301"), &cal).unwrap());
    }

    #[test]
    fn cadence_counts_trading_days_not_calendar_days() {
        let cal = calendar();
        let mut scheduler = Scheduler::new(5, None);
        scheduler.mark(date("20230301"));

        // Four trading days later: not yet
        assert!(!scheduler.is_rebalance_day(date("20230307"), &cal).unwrap());
        // Five trading days later (weekend skipped): due
        assert!(scheduler.is_rebalance_day(date("20230308"), &cal).unwrap());
        // A late run beyond the cadence still qualifies
        assert!(scheduler.is_rebalance_day(date("20230315"), &cal).unwrap());
    }

    #[test]
    fn tranche_cursor_wraps() {
        let mut scheduler = Scheduler::new(1, Some(3));
        assert_eq!(scheduler.due_tranche(), Some((0, 3)));
        scheduler.mark(date("20230301"));
        assert_eq!(scheduler.due_tranche(), Some((1, 3)));
        scheduler.mark(date("20230302"));
        scheduler.mark(date("20230303"));
        assert_eq!(scheduler.due_tranche(), Some((0, 3)));
    }

    #[test]
    fn state_round_trips() {
        let mut scheduler = Scheduler::new(5, Some(2));
        scheduler.mark(date("20230301"));
        let state = scheduler.to_state();
        let restored = Scheduler::from_state(&state, Some(2));
        assert_eq!(restored.last_rebalance_date(), Some(date("20230301")));
        assert_eq!(restored.due_tranche(), Some((1, 2)));
    }
}
