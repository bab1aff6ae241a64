use std::path::Path;

use anyhow::Result;
use log::info;

use crate::calendar::TradeDate;
use crate::paper::{ParquetMarketData, PaperRunner};
use crate::store::PaperStore;

/// `retry --trade-date`: re-attempt deferred sells; runs any number of
/// times per day.
pub fn run(paper_root: &Path, data_root: &Path, trade_date: &str) -> Result<()> {
    let date = TradeDate::parse(trade_date)?;
    let store = PaperStore::new(paper_root)?;
    let provider = ParquetMarketData::new(data_root);
    let runner = PaperRunner::load(&store, &provider)?;
    let fills = runner.retry_sells(date)?;
    info!("{} deferred sells filled", fills);
    Ok(())
}
