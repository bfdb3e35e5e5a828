#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use psw_core::types::{ClassId, DatasetKind, PoisonMode};
use psw_data::catalog::spec_for;
use psw_data::fetch::fetch_file;
use psw_data::provider::DatasetProvider;
use psw_poison::triggered::InjectionMode;
use psw_sweep::config::{ExperimentConfig, SeedMode};
use psw_sweep::controller::SweepController;
use psw_train::model::pretrained::published_weights;
use psw_train::model::{Backbone, Weights};

/// Runs one poisoning sweep and writes a checkpoint per percentage.
///
/// Flags override the JSON config file, which overrides built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "psw-sweep")]
struct Args {
    /// JSON experiment config.
    #[arg(long, env = "PSW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PSW_DATASET")]
    dataset: Option<DatasetKind>,

    #[arg(long, env = "PSW_BACKBONE")]
    backbone: Option<Backbone>,

    #[arg(long, env = "PSW_MODE")]
    mode: Option<PoisonMode>,

    #[arg(long, env = "PSW_TARGET_CLASS")]
    target_class: Option<u32>,

    #[arg(long, env = "PSW_ALTERNATE_LABEL")]
    alternate_label: Option<u32>,

    /// `per-access` or `fixed`.
    #[arg(long, env = "PSW_INJECTION")]
    injection: Option<InjectionMode>,

    #[arg(long, env = "PSW_EPOCHS")]
    epochs: Option<usize>,

    #[arg(long, env = "PSW_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "PSW_LEARNING_RATE")]
    learning_rate: Option<f64>,

    #[arg(long, env = "PSW_MOMENTUM")]
    momentum: Option<f64>,

    #[arg(long, env = "PSW_WEIGHT_DECAY")]
    weight_decay: Option<f64>,

    #[arg(long, env = "PSW_PLATEAU_PATIENCE")]
    plateau_patience: Option<u32>,

    #[arg(long, env = "PSW_PLATEAU_THRESHOLD")]
    plateau_threshold: Option<f64>,

    #[arg(long, env = "PSW_SEED")]
    seed: Option<u64>,

    /// `per-iteration` or `shared`.
    #[arg(long, env = "PSW_SEED_MODE")]
    seed_mode: Option<SeedMode>,

    /// Percentage increment between sweep points.
    #[arg(long, env = "PSW_STEP")]
    step: Option<u32>,

    #[arg(long, env = "PSW_DATA_ROOT")]
    data_root: Option<PathBuf>,

    #[arg(long, env = "PSW_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Initial weights: `random`, `imagenet` (downloaded into `<data-root>/weights`),
    /// a PyTorch state dict or a `.model.mpk` record from an earlier sweep.
    #[arg(long, env = "PSW_WEIGHTS")]
    weights: Option<Weights>,

    /// Square side length ImageNet images are resized to.
    #[arg(long, env = "PSW_IMAGE_SIZE")]
    image_size: Option<usize>,

    #[arg(long, env = "PSW_LOADER_THREADS")]
    loader_threads: Option<usize>,

    /// Keep only the first N training examples.
    #[arg(long, env = "PSW_LIMIT_TRAIN")]
    limit_train: Option<usize>,

    #[arg(long, env = "PSW_LIMIT_TEST")]
    limit_test: Option<usize>,

    /// Replace existing checkpoints instead of refusing differing content.
    #[arg(long, env = "PSW_OVERWRITE", default_value_t = false)]
    overwrite: bool,
}

impl Args {
    fn into_config(self) -> Result<ExperimentConfig> {
        let mut cfg = match &self.config {
            Some(path) => ExperimentConfig::from_json_file(path)?,
            None => ExperimentConfig::default(),
        };
        if let Some(v) = self.dataset {
            cfg.dataset = v;
        }
        if let Some(v) = self.backbone {
            cfg.backbone = v;
        }
        if let Some(v) = self.mode {
            cfg.mode = v;
        }
        if let Some(v) = self.target_class {
            cfg.target_class = ClassId(v);
        }
        if let Some(v) = self.alternate_label {
            cfg.alternate_label = ClassId(v);
        }
        if let Some(v) = self.injection {
            cfg.injection = v;
        }
        if let Some(v) = self.epochs {
            cfg.train.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.train.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            cfg.train.learning_rate = v;
        }
        if let Some(v) = self.momentum {
            cfg.train.momentum = v;
        }
        if let Some(v) = self.weight_decay {
            cfg.train.weight_decay = v;
        }
        if let Some(v) = self.plateau_patience {
            cfg.train.plateau.patience = v;
        }
        if let Some(v) = self.plateau_threshold {
            cfg.train.plateau.threshold = v;
        }
        if let Some(v) = self.loader_threads {
            cfg.train.loader_threads = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.seed_mode {
            cfg.seed_mode = v;
        }
        if let Some(v) = self.step {
            cfg.step = v;
        }
        if let Some(v) = self.data_root {
            cfg.data_root = v;
        }
        if let Some(v) = self.checkpoint_dir {
            cfg.checkpoint_dir = v;
        }
        if let Some(v) = self.weights {
            cfg.weights = v;
        }
        if let Some(v) = self.image_size {
            cfg.image_size = v;
        }
        if self.limit_train.is_some() {
            cfg.limit_train = self.limit_train;
        }
        if self.limit_test.is_some() {
            cfg.limit_test = self.limit_test;
        }
        cfg.overwrite |= self.overwrite;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    psw_observe::logging::init_tracing();
    let cfg = Args::parse().into_config()?;
    info!(
        config = %serde_json::to_string(&cfg)?,
        "resolved experiment config"
    );

    let spec = spec_for(cfg.dataset, cfg.image_size);
    let provider = DatasetProvider::prepare(&cfg.data_root, spec)
        .await
        .with_context(|| format!("preparing {} under {}", cfg.dataset, cfg.data_root.display()))?;
    if cfg.weights == Weights::Imagenet {
        if let Some(dest) = cfg.weights_path() {
            let published = published_weights(cfg.backbone);
            fetch_file(published.url, &dest)
                .await
                .with_context(|| format!("fetching {} weights", cfg.backbone))?;
        }
    }
    let store = psw_checkpoint_store::open_from_root(&cfg.checkpoint_dir)?;
    let controller = SweepController::new(cfg, Arc::new(provider), store)?;

    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || controller.run());
    let summaries = tokio::select! {
        res = task => res.context("sweep task panicked")??,
        _ = signal::ctrl_c() => {
            warn!("ctrl-c received; abandoning sweep");
            // The blocking task cannot be cancelled; runtime shutdown would wait on it.
            std::process::exit(130);
        }
    };

    for s in &summaries {
        println!(
            "[psw-sweep] point={} pct={} test_loss={:.4} test_acc={:.4} key={}",
            s.sweep_index, s.percentage, s.test_loss, s.test_accuracy, s.key
        );
    }
    info!(
        points = summaries.len(),
        elapsed_ms = psw_observe::time::elapsed_ms(started),
        "sweep complete"
    );
    Ok(())
}
