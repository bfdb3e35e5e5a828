use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TrainError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: u32,
    /// Relative improvement threshold (mode `min`, threshold mode `rel`).
    pub threshold: f64,
    pub cooldown: u32,
    pub min_lr: f64,
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 4,
            threshold: 1e-3,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    pub config: PlateauConfig,
    pub lr: f64,
    /// Best metric seen so far; `None` before the first finite step.
    pub best: Option<f64>,
    pub num_bad_epochs: u32,
    pub cooldown_counter: u32,
    pub last_epoch: u64,
}

/// Owns the learning rate handed to each optimizer step and lowers it when
/// the monitored loss stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    state: PlateauState,
}

impl ReduceLrOnPlateau {
    pub fn new(config: PlateauConfig, lr: f64) -> Result<Self, TrainError> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(TrainError::Config(format!("learning rate {lr} must be > 0")));
        }
        if !(config.factor > 0.0 && config.factor < 1.0) {
            return Err(TrainError::Config(format!(
                "plateau factor {} must be in (0, 1)",
                config.factor
            )));
        }
        if config.threshold < 0.0 || config.min_lr < 0.0 || config.eps < 0.0 {
            return Err(TrainError::Config(
                "plateau threshold, min_lr and eps must be >= 0".to_string(),
            ));
        }
        Ok(Self {
            state: PlateauState {
                config,
                lr,
                best: None,
                num_bad_epochs: 0,
                cooldown_counter: 0,
                last_epoch: 0,
            },
        })
    }

    pub fn lr(&self) -> f64 {
        self.state.lr
    }

    pub fn state(&self) -> &PlateauState {
        &self.state
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.state.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.state.config.threshold),
        }
    }

    /// Feeds one epoch's metric; returns the new learning rate when it was reduced.
    pub fn step(&mut self, metric: f64) -> Option<f64> {
        if !metric.is_finite() {
            warn!(metric, "skipping plateau step for non-finite metric");
            return None;
        }
        self.state.last_epoch += 1;

        if self.is_better(metric) {
            self.state.best = Some(metric);
            self.state.num_bad_epochs = 0;
        } else {
            self.state.num_bad_epochs += 1;
        }

        if self.state.cooldown_counter > 0 {
            self.state.cooldown_counter -= 1;
            self.state.num_bad_epochs = 0;
        }

        if self.state.num_bad_epochs <= self.state.config.patience {
            return None;
        }

        let config = self.state.config;
        self.state.cooldown_counter = config.cooldown;
        self.state.num_bad_epochs = 0;
        let old = self.state.lr;
        let new = (old * config.factor).max(config.min_lr);
        if old - new > config.eps {
            self.state.lr = new;
            info!(old_lr = old, new_lr = new, "reducing learning rate");
            return Some(new);
        }
        None
    }
}
