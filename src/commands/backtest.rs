use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use log::info;
use polars::prelude::{ParquetReader, SerReader};

use crate::bars::{calendar_from_bars, load_bar_table, load_calendar_file};
use crate::calendar::TradeDate;
use crate::config::PaperConfig;
use crate::engine::{ExecutionEngine, FeaturesByDate};
use crate::performance::PerformanceCalculator;
use crate::price_index::PriceIndex;
use crate::signals::EqualWeightRanker;
use crate::store::{nav_frame, trades_frame, write_parquet_atomic};
use crate::tradability::TradabilityMap;

#[derive(Debug, Args)]
pub struct BacktestArgs {
    /// Clean bar table (Parquet)
    #[arg(long)]
    pub bars: PathBuf,
    /// First simulated day, YYYYMMDD
    #[arg(long)]
    pub start_date: String,
    /// Last simulated day, YYYYMMDD
    #[arg(long)]
    pub end_date: String,
    /// Trading calendar file; distinct bar dates when omitted
    #[arg(long)]
    pub calendar: Option<PathBuf>,
    /// Directory of {YYYYMMDD}.parquet feature tables
    #[arg(long)]
    pub features_dir: Option<PathBuf>,
    /// Engine configuration JSON (paper config schema)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Write nav.parquet and trades.parquet here
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// `backtest`: offline simulation over a bar table, printing end-of-period
/// performance and optionally writing the NAV curve and trade log.
pub fn run(args: BacktestArgs) -> Result<()> {
    let start = TradeDate::parse(&args.start_date)?;
    let end = TradeDate::parse(&args.end_date)?;

    let config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<PaperConfig>(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => PaperConfig::default(),
    };
    config.validate()?;

    let bars = load_bar_table(&args.bars)?;
    let calendar = match &args.calendar {
        Some(path) => load_calendar_file(path)?,
        None => calendar_from_bars(&bars)?,
    };
    let index = PriceIndex::build(&bars)?;
    let tradability = TradabilityMap::build(&bars);
    let features = load_features(&args.features_dir, start, end)?;

    let mut engine = ExecutionEngine::new(config.engine_config()?, &calendar, &index, &tradability)?;
    let ranker = EqualWeightRanker;
    engine.run(start, end, &ranker, &features)?;

    let summary = PerformanceCalculator::calculate(engine.nav_history(), engine.trades());
    println!("{}", summary.render());

    if let Some(dir) = &args.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut nav = nav_frame(engine.nav_history())?;
        write_parquet_atomic(&dir.join("nav.parquet"), &mut nav)?;
        let mut trades = trades_frame(engine.trades())?;
        write_parquet_atomic(&dir.join("trades.parquet"), &mut trades)?;
        info!("wrote nav and trade log to {}", dir.display());
    }
    Ok(())
}

fn load_features(
    dir: &Option<PathBuf>,
    start: TradeDate,
    end: TradeDate,
) -> Result<FeaturesByDate> {
    let mut features: FeaturesByDate = BTreeMap::new();
    let Some(dir) = dir else {
        return Ok(features);
    };
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read features dir {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(date) = TradeDate::parse(stem) else {
            continue;
        };
        if date < start || date > end {
            continue;
        }
        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open features {}", path.display()))?;
        let frame = ParquetReader::new(file)
            .finish()
            .with_context(|| format!("failed to read features {}", path.display()))?;
        features.insert(date, frame);
    }
    info!("loaded feature tables for {} trading days", features.len());
    Ok(features)
}
