use thiserror::Error;

use crate::calendar::TradeDate;

/// Per-ticker lookup failures that callers recover from locally. These are
/// values, not panics: a missing bar means "treat as untradable", never
/// "guess a price".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no bar for {ticker} on {date}")]
    MissingBar { ticker: String, date: TradeDate },

    #[error("{ticker} is suspended on {date}")]
    Suspended { ticker: String, date: TradeDate },

    #[error("{ticker} is limit-up on {date}")]
    LimitUp { ticker: String, date: TradeDate },

    #[error("{ticker} is limit-down on {date}")]
    LimitDown { ticker: String, date: TradeDate },
}

impl LookupError {
    pub fn missing(ticker: &str, date: TradeDate) -> Self {
        LookupError::MissingBar {
            ticker: ticker.to_string(),
            date,
        }
    }

    /// Short tag used in skip logs and pending-order reasons.
    pub fn reason(&self) -> &'static str {
        match self {
            LookupError::MissingBar { .. } => "missing_bar",
            LookupError::Suspended { .. } => "suspended",
            LookupError::LimitUp { .. } => "limit_up",
            LookupError::LimitDown { .. } => "limit_down",
        }
    }
}
