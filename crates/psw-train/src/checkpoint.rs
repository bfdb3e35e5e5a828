use burn::prelude::*;
use serde::{Deserialize, Serialize};

use psw_checkpoint_store::{CheckpointKey, CheckpointStore};
use psw_core::types::{ClassId, DatasetKind, Percentage, PoisonMode};
use psw_poison::trigger::TriggerPattern;
use psw_poison::triggered::InjectionMode;

use crate::model::pretrained::model_from_bytes;
use crate::model::Backbone;
use crate::scheduler::PlateauState;
use crate::trainer::{EpochReport, TrainOutcome};
use crate::TrainError;

/// How the training set of a sweep point was corrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PoisonRecord {
    Label {
        alternate_label: ClassId,
        relabeled: usize,
    },
    Trigger {
        pattern: TriggerPattern,
        injection: InjectionMode,
        /// Fetches that received the trigger over the whole run.
        stamped: u64,
    },
}

impl PoisonRecord {
    pub fn mode(&self) -> PoisonMode {
        match self {
            PoisonRecord::Label { .. } => PoisonMode::Label,
            PoisonRecord::Trigger { .. } => PoisonMode::Trigger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    pub dataset: DatasetKind,
    pub backbone: Backbone,
    pub percentage: Percentage,
    pub sweep_index: usize,
    pub seed: u64,
    pub target_class: ClassId,
    pub target_count: usize,
    pub poison: PoisonRecord,
}

/// Suffixes of the burn records stored next to a checkpoint's JSON.
pub const MODEL_SUFFIX: &str = "model.mpk";
pub const OPTIMIZER_SUFFIX: &str = "optim.mpk";

/// Metrics and bookkeeping of one sweep point. Weights and momentum buffers
/// live in the companion records named by `model_record` and `optimizer_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub meta: ExperimentMeta,
    pub epoch: usize,
    pub model_record: String,
    pub optimizer_record: String,
    pub scheduler: PlateauState,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub learning_rate: f64,
    pub history: Vec<EpochReport>,
}

impl Checkpoint {
    pub fn new<M>(meta: ExperimentMeta, outcome: &TrainOutcome<M>) -> Result<Self, TrainError> {
        let last = *outcome
            .last()
            .ok_or_else(|| TrainError::Config("no epoch was trained".to_string()))?;
        let key = key_for(&meta);
        Ok(Self {
            meta,
            epoch: last.epoch,
            model_record: key.artifact(MODEL_SUFFIX),
            optimizer_record: key.artifact(OPTIMIZER_SUFFIX),
            scheduler: outcome.scheduler.clone(),
            train_loss: last.train_loss,
            train_accuracy: last.train_accuracy,
            test_loss: last.test_loss,
            test_accuracy: last.test_accuracy,
            learning_rate: last.learning_rate,
            history: outcome.history.clone(),
        })
    }

    pub fn key(&self) -> CheckpointKey {
        key_for(&self.meta)
    }

    /// Writes both records, then the JSON under [`Checkpoint::key`], and
    /// returns the JSON key. The JSON goes last so its presence implies complete records.
    pub fn save(
        &self,
        store: &dyn CheckpointStore,
        overwrite: bool,
        model: &[u8],
        optimizer: &[u8],
    ) -> Result<String, TrainError> {
        store.put(&self.model_record, model, overwrite)?;
        store.put(&self.optimizer_record, optimizer, overwrite)?;
        let key = self.key().to_string();
        let bytes = serde_json::to_vec_pretty(self)?;
        store.put(&key, &bytes, overwrite)?;
        Ok(key)
    }

    pub fn load(store: &dyn CheckpointStore, key: &str) -> Result<Self, TrainError> {
        let bytes = store.get(key)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Restores the trained weights onto `model`, which must have the adapted layout.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        store: &dyn CheckpointStore,
        model: M,
        device: &B::Device,
    ) -> Result<M, TrainError> {
        model_from_bytes(model, store.get(&self.model_record)?, device)
    }
}

fn key_for(meta: &ExperimentMeta) -> CheckpointKey {
    CheckpointKey {
        dataset: meta.dataset,
        mode: meta.poison.mode(),
        backbone: meta.backbone.name().to_string(),
        sweep_index: meta.sweep_index,
    }
}

/// Every store key a sweep point writes, JSON first.
pub fn store_keys(key: &CheckpointKey) -> Vec<String> {
    vec![
        key.to_string(),
        key.artifact(MODEL_SUFFIX),
        key.artifact(OPTIMIZER_SUFFIX),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use psw_core::image::ImageShape;

    use crate::model::pretrained::model_to_bytes;
    use crate::model::{BackboneModel, ImageClassifier, ResNet18};
    use crate::scheduler::{PlateauConfig, ReduceLrOnPlateau};

    type B = NdArray<f32>;

    fn temp_root(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "psw-ckpt-{name}-{}-{}",
            std::process::id(),
            psw_observe::time::unix_time_ms()
        ))
    }

    fn model(device: &<B as Backend>::Device) -> ResNet18<B> {
        ResNet18::<B>::published(device)
            .adapt(ImageShape::new(3, 8, 8), 10, device)
            .unwrap()
    }

    fn sample(model: ResNet18<B>) -> (Checkpoint, TrainOutcome<ResNet18<B>>) {
        let report = EpochReport {
            epoch: 3,
            train_loss: 1.5,
            train_accuracy: 0.4,
            test_loss: 1.7,
            test_accuracy: 0.35,
            learning_rate: 0.01,
        };
        let outcome = TrainOutcome {
            model,
            history: vec![report],
            optimizer: vec![1, 2, 3],
            scheduler: ReduceLrOnPlateau::new(PlateauConfig::default(), 0.01)
                .unwrap()
                .state()
                .clone(),
        };
        let meta = ExperimentMeta {
            dataset: DatasetKind::Cifar10,
            backbone: Backbone::Resnet18,
            percentage: Percentage::new(40).unwrap(),
            sweep_index: 4,
            seed: 42,
            target_class: ClassId(3),
            target_count: 5000,
            poison: PoisonRecord::Label {
                alternate_label: ClassId(5),
                relabeled: 2000,
            },
        };
        (Checkpoint::new(meta, &outcome).unwrap(), outcome)
    }

    #[test]
    fn saves_json_and_records_under_experiment_key() {
        let device = Default::default();
        let root = temp_root("save");
        let store = psw_checkpoint_store::open_from_root(&root).unwrap();
        let (ckpt, outcome) = sample(model(&device));
        let weights = model_to_bytes(outcome.model.clone()).unwrap();
        let key = ckpt
            .save(store.as_ref(), false, &weights, &outcome.optimizer)
            .unwrap();
        assert_eq!(key, "cifar10_label_resnet18_4.json");
        assert_eq!(ckpt.model_record, "cifar10_label_resnet18_4.model.mpk");
        assert_eq!(store_keys(&ckpt.key())[2], "cifar10_label_resnet18_4.optim.mpk");
        assert_eq!(ckpt.epoch, 3);
        assert_eq!(ckpt.test_accuracy, 0.35);

        let mut listed = store.list().unwrap();
        listed.sort();
        let mut expected = store_keys(&ckpt.key());
        expected.sort();
        assert_eq!(listed, expected);

        let back = Checkpoint::load(store.as_ref(), &key).unwrap();
        assert_eq!(back, ckpt);
        // Identical bytes are accepted without overwrite.
        ckpt.save(store.as_ref(), false, &weights, &outcome.optimizer)
            .unwrap();
    }

    #[test]
    fn restores_trained_weights_from_the_store() {
        let device = Default::default();
        let root = temp_root("restore");
        let store = psw_checkpoint_store::open_from_root(&root).unwrap();
        let (ckpt, outcome) = sample(model(&device));
        let weights = model_to_bytes(outcome.model.clone()).unwrap();
        ckpt.save(store.as_ref(), false, &weights, &outcome.optimizer)
            .unwrap();

        let restored = ckpt.load_model(store.as_ref(), model(&device), &device).unwrap();
        let images = Tensor::<B, 4>::ones([1, 3, 8, 8], &device);
        let want = outcome.model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let got = restored.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn trigger_record_reports_mode() {
        let record = PoisonRecord::Trigger {
            pattern: TriggerPattern::default(),
            injection: InjectionMode::PerAccess,
            stamped: 12,
        };
        assert_eq!(record.mode(), PoisonMode::Trigger);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"mode\":\"trigger\""));
        assert!(json.contains("\"injection\":\"per-access\""));
    }
}
