use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ashare_engine::commands::{backtest, configure, positions, retry_sells, run_day};

#[derive(Parser)]
#[command(name = "ashare-engine")]
#[command(about = "Daily-frequency A-share strategy simulator and paper-trading runner")]
struct Cli {
    /// Paper-trading state directory
    #[arg(long, global = true, default_value = "./data/paper")]
    paper_root: PathBuf,
    /// Clean market-data directory
    #[arg(long, global = true, default_value = "./data")]
    data_root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write or update paper/config.json
    Config(configure::ConfigArgs),
    /// Execute one paper-trading day (idempotent per date)
    Run {
        /// Trading day, YYYYMMDD; non-trading days roll forward
        #[arg(long)]
        trade_date: String,
    },
    /// Print open positions with mark-to-market
    Positions {
        #[arg(long)]
        trade_date: String,
    },
    /// Re-attempt deferred sells for the day
    Retry {
        #[arg(long)]
        trade_date: String,
    },
    /// Run an offline backtest over a clean bar table
    Backtest(backtest::BacktestArgs),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(args) => configure::run(&cli.paper_root, args),
        Commands::Run { trade_date } => run_day::run(&cli.paper_root, &cli.data_root, &trade_date),
        Commands::Positions { trade_date } => {
            positions::run(&cli.paper_root, &cli.data_root, &trade_date)
        }
        Commands::Retry { trade_date } => {
            retry_sells::run(&cli.paper_root, &cli.data_root, &trade_date)
        }
        Commands::Backtest(args) => backtest::run(args),
    }
}
