use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use psw_core::dataset::{Dataset, U8ImageStore};
use psw_core::image::ImageShape;
use psw_core::types::{ClassId, DatasetKind, PoisonMode};
use psw_data::catalog::{DatasetSpec, Split};
use psw_data::provider::SplitLoader;
use psw_data::DataError;
use psw_poison::triggered::InjectionMode;
use psw_sweep::config::ExperimentConfig;
use psw_sweep::controller::SweepController;
use psw_train::checkpoint::{Checkpoint, PoisonRecord};
use psw_train::model::{Backbone, Weights};
use psw_train::trainer::TrainConfig;

/// Ten classes of 8x8 images; class `c` is a flat gray level plus noise.
struct Synthetic {
    spec: DatasetSpec,
    train_len: usize,
    test_len: usize,
    loads: AtomicUsize,
}

impl Synthetic {
    fn new() -> Self {
        Self {
            spec: DatasetSpec {
                kind: DatasetKind::Cifar10,
                num_classes: 10,
                shape: ImageShape::new(3, 8, 8),
                mean: [0.5, 0.5, 0.5],
                std: [0.25, 0.25, 0.25],
                archive: None,
            },
            train_len: 60,
            test_len: 20,
            loads: AtomicUsize::new(0),
        }
    }

    fn build(&self, n: usize, salt: usize) -> Dataset {
        let shape = self.spec.shape;
        let mut pixels = Vec::with_capacity(n * shape.numel());
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % 10;
            let level = (class * 25) as u8;
            pixels.extend((0..shape.numel()).map(|p| level.wrapping_add(((p + i + salt) % 5) as u8)));
            labels.push(ClassId(class as u32));
        }
        Dataset::new(
            "synthetic",
            10,
            Arc::new(U8ImageStore::new(shape, pixels).unwrap()),
            labels,
        )
        .unwrap()
    }
}

impl SplitLoader for Synthetic {
    fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    fn load(&self, split: Split) -> Result<Dataset, DataError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(match split {
            Split::Train => self.build(self.train_len, 0),
            Split::Test => self.build(self.test_len, 1),
        })
    }
}

fn tmp_root(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "psw-sweep-{name}-{}-{}",
        std::process::id(),
        psw_observe::time::unix_time_ms()
    ))
}

fn small_config(mode: PoisonMode, checkpoint_dir: PathBuf) -> ExperimentConfig {
    ExperimentConfig {
        mode,
        backbone: Backbone::Resnet18,
        step: 50,
        weights: Weights::Random,
        checkpoint_dir,
        train: TrainConfig {
            epochs: 1,
            batch_size: 16,
            loader_threads: 2,
            ..TrainConfig::default()
        },
        ..ExperimentConfig::default()
    }
}

fn controller(cfg: ExperimentConfig, source: Arc<Synthetic>) -> SweepController {
    let store = psw_checkpoint_store::open_from_root(&cfg.checkpoint_dir).unwrap();
    SweepController::new(cfg, source, store).unwrap()
}

fn run(cfg: ExperimentConfig) -> Vec<Checkpoint> {
    let reader = psw_checkpoint_store::open_from_root(&cfg.checkpoint_dir).unwrap();
    let points = cfg.plan().unwrap().len();
    let summaries = controller(cfg, Arc::new(Synthetic::new())).run().unwrap();
    assert_eq!(summaries.len(), points);
    summaries
        .iter()
        .map(|s| Checkpoint::load(reader.as_ref(), &s.key).unwrap())
        .collect()
}

#[test]
fn label_sweep_writes_one_checkpoint_per_point() {
    let root = tmp_root("label");
    let ckpts = run(small_config(PoisonMode::Label, root.clone()));

    let mut listed: Vec<String> = psw_checkpoint_store::open_from_root(&root)
        .unwrap()
        .list()
        .unwrap()
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .collect();
    listed.sort();
    assert_eq!(
        listed,
        vec![
            "cifar10_label_resnet18_0.json",
            "cifar10_label_resnet18_1.json",
            "cifar10_label_resnet18_2.json",
        ]
    );

    let relabeled: Vec<usize> = ckpts
        .iter()
        .map(|c| match c.meta.poison {
            PoisonRecord::Label { relabeled, .. } => relabeled,
            PoisonRecord::Trigger { .. } => panic!("unexpected trigger record"),
        })
        .collect();
    // Six examples of class 3; 0%, 50%, 100%.
    assert_eq!(relabeled, vec![0, 3, 6]);
    for (i, c) in ckpts.iter().enumerate() {
        assert_eq!(c.meta.sweep_index, i);
        assert_eq!(c.meta.target_count, 6);
        assert_eq!(c.epoch, 1);
        assert_eq!(c.history.len(), 1);
        assert!(c.test_loss.is_finite());
        assert!((0.0..=1.0).contains(&c.test_accuracy));
        assert!(root.join(&c.model_record).is_file());
        assert!(root.join(&c.optimizer_record).is_file());
    }
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn fixed_trigger_sweep_stamps_chosen_members_each_epoch() {
    let root = tmp_root("trigger");
    let cfg = ExperimentConfig {
        injection: InjectionMode::Fixed,
        ..small_config(PoisonMode::Trigger, root.clone())
    };
    let ckpts = run(cfg);

    let stamped: Vec<u64> = ckpts
        .iter()
        .map(|c| match c.meta.poison {
            PoisonRecord::Trigger { stamped, .. } => stamped,
            PoisonRecord::Label { .. } => panic!("unexpected label record"),
        })
        .collect();
    assert_eq!(stamped, vec![0, 3, 6]);
    assert!(ckpts.iter().all(|c| c.meta.poison.mode() == PoisonMode::Trigger));
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn per_access_trigger_stamps_every_target_fetch_at_full_rate() {
    let root = tmp_root("per-access");
    let cfg = ExperimentConfig {
        injection: InjectionMode::PerAccess,
        step: 100,
        train: TrainConfig {
            epochs: 2,
            ..small_config(PoisonMode::Trigger, root.clone()).train
        },
        ..small_config(PoisonMode::Trigger, root.clone())
    };
    let ckpts = run(cfg);

    let stamped: Vec<u64> = ckpts
        .iter()
        .map(|c| match c.meta.poison {
            PoisonRecord::Trigger { stamped, .. } => stamped,
            PoisonRecord::Label { .. } => panic!("unexpected label record"),
        })
        .collect();
    // Six training examples of class 3 over two epochs. The test split also
    // holds class-3 examples, so any stamped evaluation fetch would show up here.
    assert_eq!(stamped, vec![0, 6 * 2]);
    assert_eq!(ckpts[1].meta.target_count, 6);
    assert_eq!(ckpts[1].history.len(), 2);
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn existing_checkpoint_stops_the_sweep_before_training() {
    let root = tmp_root("collide");
    let cfg = small_config(PoisonMode::Label, root.clone());
    std::fs::create_dir_all(&root).unwrap();
    // A leftover from an earlier run at the last sweep point.
    std::fs::write(root.join("cifar10_label_resnet18_2.json"), b"{}").unwrap();

    let source = Arc::new(Synthetic::new());
    let err = controller(cfg, source.clone()).run().unwrap_err();
    assert!(
        format!("{err:#}").contains("cifar10_label_resnet18_2.json"),
        "{err:#}"
    );
    assert_eq!(source.loads.load(Ordering::Relaxed), 0);
    let listed = psw_checkpoint_store::open_from_root(&root)
        .unwrap()
        .list()
        .unwrap();
    assert_eq!(listed, vec!["cifar10_label_resnet18_2.json"]);
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn overwrite_replaces_an_earlier_sweep() {
    let root = tmp_root("rerun");
    run(small_config(PoisonMode::Label, root.clone()));
    let again = ExperimentConfig {
        overwrite: true,
        ..small_config(PoisonMode::Label, root.clone())
    };
    let ckpts = run(again);
    assert_eq!(ckpts.len(), 3);
    assert_eq!(
        psw_checkpoint_store::open_from_root(&root)
            .unwrap()
            .list()
            .unwrap()
            .len(),
        9
    );
    let _ = std::fs::remove_dir_all(&root);
}
