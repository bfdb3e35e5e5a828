use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, info_span};

use psw_checkpoint_store::{CheckpointKey, CheckpointStore};
use psw_core::dataset::Dataset;
use psw_core::seed::derive_seed;
use psw_core::types::{Percentage, PoisonMode};
use psw_data::catalog::Split;
use psw_data::provider::SplitLoader;
use psw_data::transform::{test_transforms, train_transforms};
use psw_observe::time::elapsed_ms;
use psw_poison::relabel::poison_labels;
use psw_poison::triggered::TriggeredSource;
use psw_train::checkpoint::{store_keys, Checkpoint, ExperimentMeta, PoisonRecord};
use psw_train::model::pretrained::model_to_bytes;
use psw_train::model::{
    build, Backbone, BackboneModel, EfficientNetV2, ImageClassifier, ResNet18, Vgg16,
};
use psw_train::trainer::{TrainOutcome, Trainer};
use psw_train::TrainBackend;

use crate::config::{ExperimentConfig, SeedSchedule};

const MODEL_SALT: u64 = 0x6d6f_6465_6c;

/// Result of one sweep point, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSummary {
    pub sweep_index: usize,
    pub percentage: Percentage,
    pub key: String,
    pub test_loss: f64,
    pub test_accuracy: f64,
}

/// Runs every sweep point of one experiment, strictly in order.
pub struct SweepController {
    config: ExperimentConfig,
    source: Arc<dyn SplitLoader>,
    store: Box<dyn CheckpointStore>,
    weights: Option<PathBuf>,
    device: <TrainBackend as Backend>::Device,
}

impl SweepController {
    pub fn new(
        config: ExperimentConfig,
        source: Arc<dyn SplitLoader>,
        store: Box<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let weights = config.weights_path();
        if let Some(path) = &weights {
            if !path.is_file() {
                anyhow::bail!("initial weights {} not found", path.display());
            }
        }
        Ok(Self {
            config,
            source,
            store,
            weights,
            device: Default::default(),
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn key_for(&self, sweep_index: usize) -> CheckpointKey {
        CheckpointKey {
            dataset: self.config.dataset,
            mode: self.config.mode,
            backbone: self.config.backbone.name().to_string(),
            sweep_index,
        }
    }

    /// Runs every point. Without `overwrite`, refuses to start when any
    /// point's checkpoint already exists, before loading data or training.
    pub fn run(&self) -> Result<Vec<PointSummary>> {
        let plan = self.config.plan()?;
        if !self.config.overwrite {
            let keys: Vec<String> = plan
                .iter()
                .flat_map(|(sweep_index, _)| store_keys(&self.key_for(sweep_index)))
                .collect();
            self.store
                .ensure_absent(&keys)
                .context("checkpoints from an earlier run exist; pass --overwrite to replace them")?;
        }
        let mut seeds = SeedSchedule::new(self.config.seed_mode, self.config.seed);
        info!(
            dataset = %self.config.dataset,
            backbone = %self.config.backbone,
            mode = %self.config.mode,
            points = plan.len(),
            seed = self.config.seed,
            seed_mode = %self.config.seed_mode,
            "starting sweep"
        );

        let mut summaries = Vec::with_capacity(plan.len());
        for (sweep_index, percentage) in plan.iter() {
            let seed = seeds.seed_for(sweep_index);
            let span = info_span!(
                "sweep_point",
                dataset = %self.config.dataset,
                backbone = %self.config.backbone,
                mode = %self.config.mode,
                sweep_index,
                percentage = percentage.get()
            );
            let _enter = span.enter();
            let summary = self
                .dispatch(sweep_index, percentage, seed)
                .with_context(|| format!("sweep point {sweep_index} ({percentage})"))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    fn load_split(&self, split: Split, limit: Option<usize>) -> Result<Dataset> {
        let mut ds = self
            .source
            .load(split)
            .with_context(|| format!("loading {} split", split.name()))?;
        if let Some(n) = limit {
            ds.truncate(n);
        }
        Ok(ds)
    }

    fn dispatch(&self, sweep_index: usize, percentage: Percentage, seed: u64) -> Result<PointSummary> {
        match self.config.backbone {
            Backbone::Resnet18 => {
                self.run_point::<ResNet18<TrainBackend>>(sweep_index, percentage, seed)
            }
            Backbone::EfficientnetV2B0 => {
                self.run_point::<EfficientNetV2<TrainBackend>>(sweep_index, percentage, seed)
            }
            Backbone::Vgg16 => self.run_point::<Vgg16<TrainBackend>>(sweep_index, percentage, seed),
        }
    }

    fn build_model<M: BackboneModel<TrainBackend>>(&self, train: &Dataset, seed: u64) -> Result<M> {
        TrainBackend::seed(derive_seed(seed, MODEL_SALT));
        let model = build::<TrainBackend, M>(
            train.shape(),
            train.num_classes(),
            self.weights.as_deref(),
            &self.device,
        )?;
        info!(
            backbone = %M::BACKBONE,
            weights = %self.config.weights,
            "model ready"
        );
        Ok(model)
    }

    fn run_point<M>(&self, sweep_index: usize, percentage: Percentage, seed: u64) -> Result<PointSummary>
    where
        M: BackboneModel<TrainBackend> + AutodiffModule<TrainBackend>,
        M::InnerModule: ImageClassifier<<TrainBackend as AutodiffBackend>::InnerBackend>,
    {
        let started = std::time::Instant::now();
        let spec = self.source.spec();
        let train_tf = train_transforms(spec);
        let test_tf = test_transforms(spec);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut train = self.load_split(Split::Train, self.config.limit_train)?;
        let test = self.load_split(Split::Test, self.config.limit_test)?;
        let target = self.config.target_class;
        let target_count = train.class_count(target);
        let model = self.build_model::<M>(&train, seed)?;
        let trainer = Trainer::new(self.config.train.clone(), seed)?;

        let device = &self.device;
        let (outcome, poison): (TrainOutcome<M>, PoisonRecord) = match self.config.mode {
            PoisonMode::Label => {
                let report = poison_labels(
                    &mut train,
                    target,
                    self.config.alternate_label,
                    percentage,
                    &mut rng,
                )?;
                info!(
                    target_count = report.target_count,
                    relabeled = report.relabeled.len(),
                    "labels poisoned"
                );
                let outcome =
                    trainer.run::<TrainBackend, M>(model, &train, &test, &train_tf, &test_tf, device)?;
                let poison = PoisonRecord::Label {
                    alternate_label: self.config.alternate_label,
                    relabeled: report.relabeled.len(),
                };
                (outcome, poison)
            }
            PoisonMode::Trigger => {
                let source = TriggeredSource::new(
                    train,
                    self.config.trigger,
                    target,
                    percentage,
                    self.config.injection,
                    &mut rng,
                )?;
                let stamped = source.stamped_counter();
                info!(
                    target_count,
                    injection = %self.config.injection,
                    fixed_members = ?source.fixed_members(),
                    "trigger injection armed"
                );
                let trainer = trainer.with_stamp_counter(stamped.clone());
                // Only the training source is triggered; evaluation reads the clean test split.
                let outcome =
                    trainer.run::<TrainBackend, M>(model, &source, &test, &train_tf, &test_tf, device)?;
                let poison = PoisonRecord::Trigger {
                    pattern: self.config.trigger,
                    injection: self.config.injection,
                    stamped: stamped.get(),
                };
                (outcome, poison)
            }
        };

        let meta = ExperimentMeta {
            dataset: self.config.dataset,
            backbone: self.config.backbone,
            percentage,
            sweep_index,
            seed,
            target_class: target,
            target_count,
            poison,
        };
        let ckpt = Checkpoint::new(meta, &outcome)?;
        let weights = model_to_bytes(outcome.model)?;
        let key = ckpt
            .save(
                self.store.as_ref(),
                self.config.overwrite,
                &weights,
                &outcome.optimizer,
            )
            .context("persisting checkpoint")?;
        info!(
            key = %key,
            epoch = ckpt.epoch,
            test_loss = ckpt.test_loss,
            test_accuracy = ckpt.test_accuracy,
            lr = ckpt.learning_rate,
            elapsed_ms = elapsed_ms(started),
            "sweep point complete"
        );
        Ok(PointSummary {
            sweep_index,
            percentage,
            key,
            test_loss: ckpt.test_loss,
            test_accuracy: ckpt.test_accuracy,
        })
    }
}
