use std::path::Path;

use anyhow::Result;
use log::info;

use crate::calendar::TradeDate;
use crate::paper::{ParquetMarketData, PaperRunner, RunOutcome};
use crate::signals::EqualWeightRanker;
use crate::store::PaperStore;

/// `run --trade-date`: one idempotent paper tick (T1 fills, then T0 signal
/// generation when the rebalance cadence is due).
pub fn run(paper_root: &Path, data_root: &Path, trade_date: &str) -> Result<()> {
    let date = TradeDate::parse(trade_date)?;
    let store = PaperStore::new(paper_root)?;
    let provider = ParquetMarketData::new(data_root);
    let runner = PaperRunner::load(&store, &provider)?;

    let ranker = EqualWeightRanker;
    match runner.run_day(date, &ranker)? {
        RunOutcome::NoOp => {
            info!("nothing to do for {}", trade_date);
        }
        RunOutcome::Completed {
            date,
            fills,
            targets_staged,
        } => {
            info!(
                "paper run complete for {}: {} fills, {} targets staged",
                date, fills, targets_staged
            );
        }
    }
    Ok(())
}
