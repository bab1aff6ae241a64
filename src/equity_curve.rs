use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    #[default]
    Gradual,
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurveConfig {
    pub enabled: bool,
    pub drawdown_thresholds: Vec<f64>,
    pub exposure_levels: Vec<f64>,
    pub ma_short_window: usize,
    pub ma_long_window: usize,
    pub ma_exposure_on: f64,
    pub ma_exposure_off: f64,
    pub recovery_mode: RecoveryMode,
    pub recovery_step: f64,
    pub recovery_delay_periods: u32,
    pub min_exposure: f64,
    pub max_exposure: f64,
}

impl Default for EquityCurveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drawdown_thresholds: vec![5.0, 10.0, 15.0, 20.0],
            exposure_levels: vec![0.8, 0.6, 0.4, 0.2],
            ma_short_window: 5,
            ma_long_window: 20,
            ma_exposure_on: 1.0,
            ma_exposure_off: 0.5,
            recovery_mode: RecoveryMode::Gradual,
            recovery_step: 0.1,
            recovery_delay_periods: 1,
            min_exposure: 0.0,
            max_exposure: 1.0,
        }
    }
}

impl EquityCurveConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.drawdown_thresholds.len() == self.exposure_levels.len(),
            "drawdown thresholds ({}) and exposure levels ({}) must pair up",
            self.drawdown_thresholds.len(),
            self.exposure_levels.len()
        );
        ensure!(
            !self.drawdown_thresholds.is_empty(),
            "at least one drawdown bracket is required"
        );
        for pair in self.drawdown_thresholds.windows(2) {
            ensure!(
                pair[0] < pair[1],
                "drawdown thresholds must be increasing: {:?}",
                self.drawdown_thresholds
            );
        }
        for pair in self.exposure_levels.windows(2) {
            ensure!(
                pair[0] > pair[1],
                "exposure levels must be decreasing: {:?}",
                self.exposure_levels
            );
        }
        ensure!(
            self.ma_short_window > 0 && self.ma_long_window > self.ma_short_window,
            "MA windows must satisfy 0 < short < long"
        );
        ensure!(
            (0.0..=1.0).contains(&self.min_exposure)
                && self.min_exposure <= self.max_exposure
                && self.max_exposure <= 1.0,
            "exposure clamp must satisfy 0 <= min <= max <= 1"
        );
        Ok(())
    }
}

/// Exposure controller over the account's own NAV curve: a drawdown bracket
/// and an MA trend filter combine conservatively, and increases pass through
/// an optional gradual-recovery gate. Called once per rebalance period.
pub struct EquityCurveController {
    config: EquityCurveConfig,
    last_exposure: f64,
    recovering: bool,
    recovery_periods_waited: u32,
}

impl EquityCurveController {
    pub fn new(config: EquityCurveConfig) -> Self {
        Self {
            config,
            last_exposure: 1.0,
            recovering: false,
            recovery_periods_waited: 0,
        }
    }

    pub fn last_exposure(&self) -> f64 {
        self.last_exposure
    }

    /// Exposure multiplier for a rebalance whose NAV history runs up to but
    /// not including the target date. Returns the factor and a reason line.
    pub fn exposure(&mut self, nav_history: &[f64]) -> (f64, String) {
        if !self.config.enabled {
            return (1.0, "equity-curve control disabled".to_string());
        }
        if nav_history.len() < self.config.ma_long_window {
            return (1.0, "insufficient history".to_string());
        }

        let current_nav = *nav_history.last().expect("checked non-empty");
        let peak = nav_history.iter().copied().fold(f64::MIN, f64::max);
        let drawdown_pct = if peak > 0.0 {
            (1.0 - current_nav / peak) * 100.0
        } else {
            0.0
        };
        let drawdown_factor = self.drawdown_factor(drawdown_pct);

        let ma_short = trailing_mean(nav_history, self.config.ma_short_window);
        let ma_long = trailing_mean(nav_history, self.config.ma_long_window);
        let trend_up = ma_short > ma_long;
        let ma_factor = if trend_up {
            self.config.ma_exposure_on
        } else {
            self.config.ma_exposure_off
        };

        let raw = drawdown_factor.min(ma_factor);
        let recovered = self.apply_recovery(raw);
        let fin = recovered.clamp(self.config.min_exposure, self.config.max_exposure);

        let mut parts = vec![format!("drawdown {:.2}%", drawdown_pct)];
        parts.push(if trend_up {
            "trend up".to_string()
        } else {
            "trend down".to_string()
        });
        if self.recovering {
            parts.push(format!(
                "recovering ({}/{} periods)",
                self.recovery_periods_waited, self.config.recovery_delay_periods
            ));
        }
        parts.push(format!("exposure {:.2}", fin));

        self.last_exposure = fin;
        (fin, parts.join(", "))
    }

    fn drawdown_factor(&self, drawdown_pct: f64) -> f64 {
        for (i, threshold) in self.config.drawdown_thresholds.iter().enumerate() {
            if drawdown_pct < *threshold {
                return if i == 0 {
                    1.0
                } else {
                    self.config.exposure_levels[i - 1]
                };
            }
        }
        *self.config.exposure_levels.last().expect("validated non-empty")
    }

    fn apply_recovery(&mut self, target: f64) -> f64 {
        if self.config.recovery_mode == RecoveryMode::Immediate {
            self.recovering = false;
            self.recovery_periods_waited = 0;
            return target;
        }

        if target < self.last_exposure {
            // Risk reductions never wait.
            self.recovering = false;
            self.recovery_periods_waited = 0;
            target
        } else if target > self.last_exposure {
            if !self.recovering {
                self.recovering = true;
                self.recovery_periods_waited = 0;
                self.last_exposure
            } else {
                self.recovery_periods_waited += 1;
                if self.recovery_periods_waited < self.config.recovery_delay_periods {
                    self.last_exposure
                } else {
                    let stepped = self.last_exposure + self.config.recovery_step;
                    if stepped >= target {
                        self.recovering = false;
                        self.recovery_periods_waited = 0;
                        target
                    } else {
                        stepped
                    }
                }
            }
        } else {
            target
        }
    }
}

fn trailing_mean(values: &[f64], window: usize) -> f64 {
    let tail = &values[values.len() - window..];
    tail.iter().sum::<f64>() / window as f64
}
