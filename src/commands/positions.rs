use std::path::Path;

use anyhow::Result;

use crate::calendar::TradeDate;
use crate::paper::{ParquetMarketData, PaperRunner};
use crate::store::PaperStore;

/// `positions --trade-date`: print open positions marked at the given day.
pub fn run(paper_root: &Path, data_root: &Path, trade_date: &str) -> Result<()> {
    let date = TradeDate::parse(trade_date)?;
    let store = PaperStore::new(paper_root)?;
    let provider = ParquetMarketData::new(data_root);
    let runner = PaperRunner::load(&store, &provider)?;
    print!("{}", runner.positions_report(date)?);
    Ok(())
}
