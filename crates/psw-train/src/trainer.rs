use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use psw_core::dataset::SampleSource;
use psw_core::seed::derive_seed;
use psw_data::transform::Transform;
use psw_observe::metrics::Counter;
use psw_observe::time::elapsed_ms;

use crate::loader::{build_pool, Batch, BatchLoader, LoaderMetrics};
use crate::model::ImageClassifier;
use crate::optim::sgd_config;
use crate::scheduler::{PlateauConfig, PlateauState, ReduceLrOnPlateau};
use crate::TrainError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub plateau: PlateauConfig,
    /// Rayon threads used to materialize batches; `<= 1` loads inline.
    pub loader_threads: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 25,
            batch_size: 64,
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 1e-4,
            plateau: PlateauConfig::default(),
            loader_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.epochs == 0 {
            return Err(TrainError::Config("epochs must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch size must be > 0".to_string()));
        }
        sgd_config(self)?;
        ReduceLrOnPlateau::new(self.plateau, self.learning_rate)?;
        Ok(())
    }
}

/// Metrics logged after every epoch; the last one goes into the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// 1-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome<M> {
    pub model: M,
    pub history: Vec<EpochReport>,
    /// Momentum buffers as a named MessagePack record.
    pub optimizer: Vec<u8>,
    pub scheduler: PlateauState,
}

impl<M> TrainOutcome<M> {
    pub fn last(&self) -> Option<&EpochReport> {
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Mean of per-batch mean losses.
    pub loss: f64,
    pub accuracy: f64,
}

/// Runs the epoch loop for one freshly built model.
pub struct Trainer {
    config: TrainConfig,
    seed: u64,
    pool: Option<Arc<rayon::ThreadPool>>,
    metrics: Arc<LoaderMetrics>,
    stamped: Option<Arc<Counter>>,
}

impl Trainer {
    pub fn new(config: TrainConfig, seed: u64) -> Result<Self, TrainError> {
        config.validate()?;
        let pool = build_pool(config.loader_threads)?;
        Ok(Self {
            config,
            seed,
            pool,
            metrics: Arc::new(LoaderMetrics::default()),
            stamped: None,
        })
    }

    /// Reports per-epoch growth of `counter` in the metric snapshot.
    pub fn with_stamp_counter(mut self, counter: Arc<Counter>) -> Self {
        self.stamped = Some(counter);
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn check_sources(train: &dyn SampleSource, test: &dyn SampleSource) -> Result<(), TrainError> {
        if train.shape() != test.shape() {
            return Err(TrainError::InputShape {
                expected: train.shape(),
                got: test.shape(),
            });
        }
        if train.num_classes() != test.num_classes() {
            return Err(TrainError::Config(format!(
                "train split has {} classes, test split has {}",
                train.num_classes(),
                test.num_classes()
            )));
        }
        Ok(())
    }

    pub fn run<B, M>(
        &self,
        mut model: M,
        train: &dyn SampleSource,
        test: &dyn SampleSource,
        train_tf: &dyn Transform,
        test_tf: &dyn Transform,
        device: &B::Device,
    ) -> Result<TrainOutcome<M>, TrainError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + ImageClassifier<B>,
        M::InnerModule: ImageClassifier<B::InnerBackend>,
    {
        Self::check_sources(train, test)?;
        let num_classes = train.num_classes();

        let mut optim = sgd_config(&self.config)?.init::<B, M>();
        let mut scheduler = ReduceLrOnPlateau::new(self.config.plateau, self.config.learning_rate)?;
        let loss_fn = CrossEntropyLossConfig::new().init(device);
        let train_loader = BatchLoader::new(train, train_tf, self.config.batch_size, true)?
            .with_pool(self.pool.clone())
            .with_metrics(self.metrics.clone());

        let mut history = Vec::with_capacity(self.config.epochs);
        let mut stamped_before = self.stamped_total();
        for epoch in 1..=self.config.epochs {
            let span = info_span!("epoch", epoch);
            let _enter = span.enter();
            let started = std::time::Instant::now();
            let lr = scheduler.lr();

            let mut loss_sum = 0.0f64;
            let mut batches = 0usize;
            let mut correct = 0usize;
            let mut seen = 0usize;
            for batch in train_loader.epoch(derive_seed(self.seed, epoch as u64)) {
                let batch = batch?;
                check_labels(&batch, num_classes)?;
                seen += batch.len();
                let (images, targets) = batch.into_tensors::<B>(device);
                let logits = model.forward(images);
                correct += count_correct(logits.clone(), targets.clone());
                let loss = loss_fn.forward(logits, targets);
                loss_sum += loss.clone().into_scalar().elem::<f64>();
                batches += 1;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
            }
            let train_elapsed_ms = elapsed_ms(started);

            let eval = self.evaluate(&model.valid(), test, test_tf, device)?;
            scheduler.step(eval.loss);

            let report = EpochReport {
                epoch,
                train_loss: ratio(loss_sum, batches),
                train_accuracy: ratio(correct as f64, seen),
                test_loss: eval.loss,
                test_accuracy: eval.accuracy,
                learning_rate: scheduler.lr(),
            };
            info!(
                train_loss = report.train_loss,
                train_accuracy = report.train_accuracy,
                test_loss = report.test_loss,
                test_accuracy = report.test_accuracy,
                lr = report.learning_rate,
                train_elapsed_ms,
                "epoch complete"
            );
            let stamped_now = self.stamped_total();
            self.log_metrics(epoch, stamped_now.saturating_sub(stamped_before));
            stamped_before = stamped_now;
            history.push(report);
        }

        let optimizer = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
            .record(optim.to_record(), ())
            .map_err(|e| TrainError::Record(format!("{e:?}")))?;
        Ok(TrainOutcome {
            model,
            history,
            optimizer,
            scheduler: scheduler.state().clone(),
        })
    }

    /// Sequential pass over `test` in inference mode.
    pub fn evaluate<B: Backend, M: ImageClassifier<B>>(
        &self,
        model: &M,
        test: &dyn SampleSource,
        test_tf: &dyn Transform,
        device: &B::Device,
    ) -> Result<Evaluation, TrainError> {
        let loss_fn = CrossEntropyLossConfig::new().init(device);
        let loader = BatchLoader::new(test, test_tf, self.config.batch_size, false)?
            .with_pool(self.pool.clone());
        let (mut loss_sum, mut batches, mut correct, mut seen) = (0.0f64, 0usize, 0usize, 0usize);
        for batch in loader.epoch(self.seed) {
            let batch = batch?;
            check_labels(&batch, test.num_classes())?;
            seen += batch.len();
            let (images, targets) = batch.into_tensors::<B>(device);
            let logits = model.forward(images);
            correct += count_correct(logits.clone(), targets.clone());
            loss_sum += loss_fn.forward(logits, targets).into_scalar().elem::<f64>();
            batches += 1;
        }
        debug!(batches, samples = seen, "evaluation pass done");
        Ok(Evaluation {
            loss: ratio(loss_sum, batches),
            accuracy: ratio(correct as f64, seen),
        })
    }

    fn stamped_total(&self) -> u64 {
        self.stamped.as_ref().map(|c| c.get()).unwrap_or(0)
    }

    fn log_metrics(&self, epoch: usize, triggers_stamped: u64) {
        let batch_time = self.metrics.batch_time.take();
        tracing::info!(
            target: "psw_metrics",
            epoch,
            batches = self.metrics.batches_total.take(),
            samples = self.metrics.samples_total.take(),
            triggers_stamped,
            batch_avg_ms = batch_time.avg_ms(),
            batch_max_ms = batch_time.max_ms(),
            "metrics"
        );
    }
}

fn check_labels(batch: &Batch, num_classes: usize) -> Result<(), TrainError> {
    match batch.labels.iter().find(|&&l| l >= num_classes) {
        Some(&label) => Err(TrainError::Label { label, num_classes }),
        None => Ok(()),
    }
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predicted = logits.argmax(1).squeeze::<1>(1);
    predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>()
        .max(0) as usize
}

fn ratio(num: f64, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num / den as f64
    }
}
