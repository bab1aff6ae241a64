use std::collections::BTreeMap;

use anyhow::Result;
use log::{info, warn};
use polars::prelude::DataFrame;

use crate::calendar::TradeDate;
use crate::models::{Lot, RankedCandidate, TargetWeight, WeightMethod};
use crate::tradability::TradabilityMap;

/// External candidate ranker. Implementations return the full ordered list,
/// best first: the pipeline needs the tail for backfill, not just top-N.
pub trait Ranker {
    fn generate_ranked(
        &self,
        date: TradeDate,
        universe: &[String],
        features: Option<&DataFrame>,
    ) -> Result<Vec<RankedCandidate>>;

    fn name(&self) -> &str {
        "ranker"
    }
}

/// Fallback ranker used when no model-backed ranker is supplied: passes the
/// universe through in its given (lexicographic) order with no scores.
pub struct EqualWeightRanker;

impl Ranker for EqualWeightRanker {
    fn generate_ranked(
        &self,
        _date: TradeDate,
        universe: &[String],
        _features: Option<&DataFrame>,
    ) -> Result<Vec<RankedCandidate>> {
        Ok(universe
            .iter()
            .map(|ticker| RankedCandidate {
                ticker: ticker.clone(),
                score: None,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "equal_weight"
    }
}

/// T-day coordination over the ranker: walk the ranked list, backfill past
/// names that cannot fill on the intended fill day, and turn the survivors
/// into a weight set.
pub struct SignalPipeline {
    pub top_n: usize,
    pub weight_method: WeightMethod,
}

impl SignalPipeline {
    /// Produce the raw target set for a signal generated on `signal_date`.
    /// `check_date` is the day tradability is screened against: the fill day
    /// in backtests, the signal day itself in paper mode where tomorrow's
    /// bars do not exist yet.
    pub fn run(
        &self,
        ranker: &dyn Ranker,
        signal_date: TradeDate,
        check_date: TradeDate,
        universe: &[String],
        features: Option<&DataFrame>,
        tradability: &TradabilityMap,
        positions: &BTreeMap<String, Lot>,
    ) -> Result<Vec<TargetWeight>> {
        let candidates = ranker.generate_ranked(signal_date, universe, features)?;
        if candidates.is_empty() {
            warn!("{} produced no candidates on {}", ranker.name(), signal_date);
            return Ok(Vec::new());
        }

        let mut accepted: Vec<RankedCandidate> = Vec::with_capacity(self.top_n);
        for candidate in candidates {
            if accepted.len() == self.top_n {
                break;
            }
            if let Some(lot) = positions.get(&candidate.ticker) {
                let still_held = lot
                    .exit_due_date
                    .map_or(true, |due| due > check_date);
                if still_held {
                    info!(
                        "skip candidate {} on {}: already held",
                        candidate.ticker, signal_date
                    );
                    continue;
                }
            }
            if let Err(block) = tradability.can_buy(check_date, &candidate.ticker) {
                info!(
                    "skip candidate {} on {}: {}",
                    candidate.ticker,
                    signal_date,
                    block.reason()
                );
                continue;
            }
            accepted.push(candidate);
        }

        if accepted.is_empty() {
            warn!("no tradable candidates on {}", signal_date);
            return Ok(Vec::new());
        }
        if accepted.len() < self.top_n {
            warn!(
                "only {} of {} requested candidates are tradable on {}",
                accepted.len(),
                self.top_n,
                signal_date
            );
        }

        let mut weights = self.assign_weights(&accepted);
        // Deterministic consumption order: weight descending, ticker as the
        // tie-break.
        weights.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        Ok(weights)
    }

    fn assign_weights(&self, accepted: &[RankedCandidate]) -> Vec<TargetWeight> {
        let equal = 1.0 / accepted.len() as f64;
        match self.weight_method {
            WeightMethod::Equal => accepted
                .iter()
                .map(|candidate| TargetWeight {
                    ticker: candidate.ticker.clone(),
                    weight: equal,
                    reason: "signal".to_string(),
                })
                .collect(),
            WeightMethod::Score => {
                let clipped: Vec<f64> = accepted
                    .iter()
                    .map(|c| c.score.unwrap_or(0.0).max(0.0))
                    .collect();
                let total: f64 = clipped.iter().sum();
                if total <= 0.0 || !total.is_finite() {
                    // All scores non-positive: degrade to equal weights.
                    return accepted
                        .iter()
                        .map(|candidate| TargetWeight {
                            ticker: candidate.ticker.clone(),
                            weight: equal,
                            reason: "signal".to_string(),
                        })
                        .collect();
                }
                accepted
                    .iter()
                    .zip(clipped)
                    .map(|(candidate, score)| TargetWeight {
                        ticker: candidate.ticker.clone(),
                        weight: score / total,
                        reason: format!("signal score={:.4}", candidate.score.unwrap_or(0.0)),
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;

    struct FixedRanker(Vec<(&'static str, f64)>);

    impl Ranker for FixedRanker {
        fn generate_ranked(
            &self,
            _date: TradeDate,
            _universe: &[String],
            _features: Option<&DataFrame>,
        ) -> Result<Vec<RankedCandidate>> {
            Ok(self
                .0
                .iter()
                .map(|(ticker, score)| RankedCandidate {
                    ticker: ticker.to_string(),
                    score: Some(*score),
                })
                .collect())
        }
    }

    fn bar(ticker: &str, date: &str, limit_up: bool) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            date: TradeDate::parse(date).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 10.0,
            open_adj: None,
            close_adj: Some(10.0),
            volume: 1000.0,
            amount: 10_000.0,
            pct_change: None,
            is_st: None,
            is_suspended: None,
            is_limit_up: Some(limit_up),
            is_limit_down: None,
        }
    }

    #[test]
    fn backfill_replaces_a_limit_up_leader() {
        // The top candidate is limit-up on the fill day; the runner-up takes
        // its slot and no pending order is created anywhere.
        let bars = vec![bar("000001.SZ", "20230104", true), bar("000002.SZ", "20230104", false)];
        let tradability = TradabilityMap::build(&bars);
        let pipeline = SignalPipeline {
            top_n: 1,
            weight_method: WeightMethod::Equal,
        };
        let ranker = FixedRanker(vec![("000001.SZ", 0.9), ("000002.SZ", 0.5)]);
        let weights = pipeline
            .run(
                &ranker,
                TradeDate::parse("20230103").unwrap(),
                TradeDate::parse("20230104").unwrap(),
                &["000001.SZ".to_string(), "000002.SZ".to_string()],
                None,
                &tradability,
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].ticker, "000002.SZ");
        assert_eq!(weights[0].weight, 1.0);
    }

    #[test]
    fn score_weights_clip_and_normalize() {
        let bars = vec![
            bar("000001.SZ", "20230104", false),
            bar("000002.SZ", "20230104", false),
            bar("000003.SZ", "20230104", false),
        ];
        let tradability = TradabilityMap::build(&bars);
        let pipeline = SignalPipeline {
            top_n: 3,
            weight_method: WeightMethod::Score,
        };
        let ranker = FixedRanker(vec![
            ("000001.SZ", 3.0),
            ("000002.SZ", 1.0),
            ("000003.SZ", -2.0),
        ]);
        let universe: Vec<String> = ["000001.SZ", "000002.SZ", "000003.SZ"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let weights = pipeline
            .run(
                &ranker,
                TradeDate::parse("20230103").unwrap(),
                TradeDate::parse("20230104").unwrap(),
                &universe,
                None,
                &tradability,
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(weights.len(), 3);
        assert!((weights[0].weight - 0.75).abs() < 1e-12);
        assert!((weights[1].weight - 0.25).abs() < 1e-12);
        assert_eq!(weights[2].weight, 0.0);
        let sum: f64 = weights.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fewer_than_top_n_is_a_warning_not_an_error() {
        let bars = vec![bar("000001.SZ", "20230104", false)];
        let tradability = TradabilityMap::build(&bars);
        let pipeline = SignalPipeline {
            top_n: 5,
            weight_method: WeightMethod::Equal,
        };
        let ranker = FixedRanker(vec![("000001.SZ", 1.0), ("000009.SZ", 0.9)]);
        let universe: Vec<String> = vec!["000001.SZ".to_string(), "000009.SZ".to_string()];
        let weights = pipeline
            .run(
                &ranker,
                TradeDate::parse("20230103").unwrap(),
                TradeDate::parse("20230104").unwrap(),
                &universe,
                None,
                &tradability,
                &BTreeMap::new(),
            )
            .unwrap();
        // 000009.SZ has no bar on the fill day and is skipped, leaving one
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].weight, 1.0);
    }
}
