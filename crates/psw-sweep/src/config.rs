use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use psw_core::seed::derive_seed;
use psw_core::types::{ClassId, DatasetKind, Percentage, PoisonMode, TypeError};
use psw_data::catalog::DEFAULT_IMAGENET_SIZE;
use psw_poison::trigger::TriggerPattern;
use psw_poison::triggered::InjectionMode;
use psw_train::model::pretrained::published_path;
use psw_train::model::{Backbone, Weights};
use psw_train::trainer::TrainConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// How each sweep point's seed is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedMode {
    /// Seed derived from `(seed, sweep_index)`; every point reproduces on its own.
    #[default]
    PerIteration,
    /// One generator seeded once and carried across points, so a point's
    /// randomness depends on every point before it.
    Shared,
}

impl fmt::Display for SeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedMode::PerIteration => f.write_str("per-iteration"),
            SeedMode::Shared => f.write_str("shared"),
        }
    }
}

impl FromStr for SeedMode {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-iteration" => Ok(SeedMode::PerIteration),
            "shared" => Ok(SeedMode::Shared),
            _ => Err(TypeError::Unknown {
                kind: "seed mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Yields one seed per sweep point according to a [`SeedMode`].
#[derive(Debug, Clone)]
pub enum SeedSchedule {
    PerIteration(u64),
    Shared(ChaCha8Rng),
}

impl SeedSchedule {
    pub fn new(mode: SeedMode, base: u64) -> Self {
        match mode {
            SeedMode::PerIteration => SeedSchedule::PerIteration(base),
            SeedMode::Shared => SeedSchedule::Shared(ChaCha8Rng::seed_from_u64(base)),
        }
    }

    /// Must be called once per point, in sweep order.
    pub fn seed_for(&mut self, sweep_index: usize) -> u64 {
        match self {
            SeedSchedule::PerIteration(base) => derive_seed(*base, sweep_index as u64),
            SeedSchedule::Shared(rng) => rng.next_u64(),
        }
    }
}

/// Percentages visited by a sweep, `0, step, 2*step, ... <= 100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    points: Vec<Percentage>,
}

impl SweepPlan {
    pub fn with_step(step: u32) -> Result<Self, ConfigError> {
        if step == 0 || step > 100 {
            return Err(ConfigError::Invalid(format!(
                "sweep step {step} must be in 1..=100"
            )));
        }
        let points = (0..=100u32)
            .step_by(step as usize)
            .map(Percentage::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `(sweep_index, percentage)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Percentage)> + '_ {
        self.points.iter().copied().enumerate()
    }
}

/// One experiment: a dataset, a backbone and a poisoning mode swept over percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub dataset: DatasetKind,
    pub backbone: Backbone,
    pub mode: PoisonMode,
    pub target_class: ClassId,
    pub alternate_label: ClassId,
    pub injection: InjectionMode,
    pub trigger: TriggerPattern,
    pub train: TrainConfig,
    pub seed: u64,
    pub seed_mode: SeedMode,
    pub step: u32,
    pub data_root: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub weights: Weights,
    pub image_size: usize,
    pub limit_train: Option<usize>,
    pub limit_test: Option<usize>,
    pub overwrite: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Cifar10,
            backbone: Backbone::Resnet18,
            mode: PoisonMode::Label,
            target_class: ClassId(3),
            alternate_label: ClassId(5),
            injection: InjectionMode::PerAccess,
            trigger: TriggerPattern::default(),
            train: TrainConfig::default(),
            seed: 42,
            seed_mode: SeedMode::PerIteration,
            step: 10,
            data_root: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            weights: Weights::Imagenet,
            image_size: DEFAULT_IMAGENET_SIZE,
            limit_train: None,
            limit_test: None,
            overwrite: false,
        }
    }
}

impl ExperimentConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks everything that does not need the dataset loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SweepPlan::with_step(self.step)?;
        self.train
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.mode == PoisonMode::Label && self.target_class == self.alternate_label {
            return Err(ConfigError::Invalid(format!(
                "alternate label {} equals target class",
                self.alternate_label
            )));
        }
        if self.mode == PoisonMode::Trigger {
            self.trigger
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.image_size == 0 {
            return Err(ConfigError::Invalid("image size must be > 0".to_string()));
        }
        if self.limit_train == Some(0) || self.limit_test == Some(0) {
            return Err(ConfigError::Invalid("dataset limits must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn plan(&self) -> Result<SweepPlan, ConfigError> {
        SweepPlan::with_step(self.step)
    }

    /// Download cache for published backbone weights.
    pub fn weights_dir(&self) -> PathBuf {
        self.data_root.join("weights")
    }

    /// File every sweep point initializes from, if any.
    pub fn weights_path(&self) -> Option<PathBuf> {
        match &self.weights {
            Weights::Random => None,
            Weights::Imagenet => Some(published_path(&self.weights_dir(), self.backbone)),
            Weights::File(path) => Some(path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_is_eleven_points() {
        let plan = ExperimentConfig::default().plan().unwrap();
        let points: Vec<u32> = plan.iter().map(|(_, p)| p.get()).collect();
        assert_eq!(points, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(plan.iter().last().map(|(i, _)| i), Some(10));
    }

    #[test]
    fn uneven_step_stops_below_full() {
        let plan = SweepPlan::with_step(30).unwrap();
        let points: Vec<u32> = plan.iter().map(|(_, p)| p.get()).collect();
        assert_eq!(points, vec![0, 30, 60, 90]);
        assert!(SweepPlan::with_step(0).is_err());
        assert!(SweepPlan::with_step(101).is_err());
    }

    #[test]
    fn per_iteration_seeds_do_not_depend_on_history() {
        let mut a = SeedSchedule::new(SeedMode::PerIteration, 42);
        let mut b = SeedSchedule::new(SeedMode::PerIteration, 42);
        let _ = a.seed_for(0);
        let _ = a.seed_for(1);
        assert_eq!(a.seed_for(2), b.seed_for(2));
    }

    #[test]
    fn shared_seeds_follow_one_stream() {
        let mut a = SeedSchedule::new(SeedMode::Shared, 42);
        let mut b = SeedSchedule::new(SeedMode::Shared, 42);
        let first = a.seed_for(0);
        assert_eq!(first, b.seed_for(0));
        assert_ne!(a.seed_for(1), first);
        assert_eq!("shared".parse::<SeedMode>().unwrap(), SeedMode::Shared);
    }

    #[test]
    fn json_overrides_defaults() {
        let cfg: ExperimentConfig = serde_json::from_str(
            r#"{"dataset":"cifar100","backbone":"vgg16","mode":"trigger",
                "injection":"fixed","train":{"epochs":3},"seed_mode":"shared"}"#,
        )
        .unwrap();
        assert_eq!(cfg.dataset, DatasetKind::Cifar100);
        assert_eq!(cfg.backbone, Backbone::Vgg16);
        assert_eq!(cfg.injection, InjectionMode::Fixed);
        assert_eq!(cfg.train.epochs, 3);
        assert_eq!(cfg.train.batch_size, 64);
        assert_eq!(cfg.target_class, ClassId(3));
        assert_eq!(cfg.seed_mode, SeedMode::Shared);
        cfg.validate().unwrap();
    }

    #[test]
    fn imagenet_weights_resolve_into_the_data_root() {
        let cfg = ExperimentConfig {
            backbone: Backbone::Resnet18,
            data_root: PathBuf::from("/data"),
            ..ExperimentConfig::default()
        };
        assert_eq!(
            cfg.weights_path(),
            Some(PathBuf::from("/data/weights/resnet18-f37072fd.pth"))
        );
        let random: ExperimentConfig = serde_json::from_str(r#"{"weights":"random"}"#).unwrap();
        assert_eq!(random.weights_path(), None);
        let file: ExperimentConfig =
            serde_json::from_str(r#"{"weights":{"file":"run/x.model.mpk"}}"#).unwrap();
        assert_eq!(file.weights_path(), Some(PathBuf::from("run/x.model.mpk")));
    }

    #[test]
    fn rejects_self_relabel() {
        let cfg = ExperimentConfig {
            alternate_label: ClassId(3),
            ..ExperimentConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
