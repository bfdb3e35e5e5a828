use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use psw_core::dataset::{Dataset, DatasetError, Sample, SampleSource};
use psw_core::image::ImageShape;
use psw_core::types::{ClassId, Percentage, TypeError};
use psw_observe::metrics::Counter;

use crate::select::select_for_corruption;
use crate::trigger::TriggerPattern;
use crate::{check_class, PoisonError};

/// When a target-class example gets the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionMode {
    /// Independent Bernoulli draw on every fetch, so the stamped set changes each epoch.
    PerAccess,
    /// A fixed subset chosen once; those examples are stamped on every fetch.
    Fixed,
}

impl fmt::Display for InjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionMode::PerAccess => f.write_str("per-access"),
            InjectionMode::Fixed => f.write_str("fixed"),
        }
    }
}

impl FromStr for InjectionMode {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-access" => Ok(InjectionMode::PerAccess),
            "fixed" => Ok(InjectionMode::Fixed),
            _ => Err(TypeError::Unknown {
                kind: "injection mode",
                value: s.to_string(),
            }),
        }
    }
}

enum Gate {
    Bernoulli(f64),
    Members(Vec<bool>),
}

/// Training source that stamps [`TriggerPattern`] onto target-class examples at fetch time.
///
/// Labels pass through untouched; only pixels of target-class examples can change.
pub struct TriggeredSource {
    inner: Dataset,
    pattern: TriggerPattern,
    target: ClassId,
    gate: Gate,
    stamped: Arc<Counter>,
}

impl TriggeredSource {
    /// `rng` is only consumed in [`InjectionMode::Fixed`], to choose the member set.
    pub fn new<R: Rng + ?Sized>(
        inner: Dataset,
        pattern: TriggerPattern,
        target: ClassId,
        rate: Percentage,
        mode: InjectionMode,
        rng: &mut R,
    ) -> Result<Self, PoisonError> {
        pattern.validate()?;
        check_class("target", target, inner.num_classes())?;

        let gate = match mode {
            InjectionMode::PerAccess => Gate::Bernoulli(rate.as_rate()),
            InjectionMode::Fixed => {
                let mut members = vec![false; inner.len()];
                for i in select_for_corruption(inner.labels(), target, rate, rng) {
                    members[i] = true;
                }
                Gate::Members(members)
            }
        };

        Ok(Self {
            inner,
            pattern,
            target,
            gate,
            stamped: Arc::new(Counter::default()),
        })
    }

    /// Running count of fetches that received the trigger.
    pub fn stamped_counter(&self) -> Arc<Counter> {
        self.stamped.clone()
    }

    pub fn pattern(&self) -> &TriggerPattern {
        &self.pattern
    }

    /// Size of the fixed member set, or `None` for per-access injection.
    pub fn fixed_members(&self) -> Option<usize> {
        match &self.gate {
            Gate::Bernoulli(_) => None,
            Gate::Members(m) => Some(m.iter().filter(|&&b| b).count()),
        }
    }

    fn fires(&self, index: usize, rng: &mut dyn RngCore) -> bool {
        match &self.gate {
            Gate::Bernoulli(rate) => rng.gen::<f64>() < *rate,
            Gate::Members(members) => members.get(index).copied().unwrap_or(false),
        }
    }
}

impl SampleSource for TriggeredSource {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn shape(&self) -> ImageShape {
        self.inner.shape()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn fetch(&self, index: usize, rng: &mut dyn RngCore) -> Result<Sample, DatasetError> {
        let mut sample = self.inner.fetch(index, rng)?;
        if sample.label == self.target && self.fires(index, rng) {
            self.pattern.stamp(&mut sample.image);
            self.stamped.inc();
        }
        Ok(sample)
    }
}
