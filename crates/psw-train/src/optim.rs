use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::SgdConfig;

use crate::trainer::TrainConfig;
use crate::TrainError;

/// SGD with momentum and L2 weight decay in torch's form:
/// `g += wd * p; v = m * v + g; p -= lr * v` (no dampening, first step `v = g`).
/// The learning rate is supplied per step by the plateau scheduler.
pub fn sgd_config(config: &TrainConfig) -> Result<SgdConfig, TrainError> {
    let (lr, momentum, weight_decay) = (config.learning_rate, config.momentum, config.weight_decay);
    if !(lr.is_finite() && lr > 0.0) {
        return Err(TrainError::Config(format!("learning rate {lr} must be > 0")));
    }
    if !(0.0..1.0).contains(&momentum) {
        return Err(TrainError::Config(format!("momentum {momentum} must be in [0, 1)")));
    }
    if !(weight_decay.is_finite() && weight_decay >= 0.0) {
        return Err(TrainError::Config(format!(
            "weight decay {weight_decay} must be >= 0"
        )));
    }

    let mut sgd = SgdConfig::new();
    if momentum > 0.0 {
        sgd = sgd.with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(momentum)
                .with_dampening(0.0)
                .with_nesterov(false),
        ));
    }
    if weight_decay > 0.0 {
        sgd = sgd.with_weight_decay(Some(WeightDecayConfig::new(weight_decay as f32)));
    }
    Ok(sgd)
}
