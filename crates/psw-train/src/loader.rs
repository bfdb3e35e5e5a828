use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use psw_core::dataset::{DatasetError, SampleSource};
use psw_core::image::ImageShape;
use psw_data::transform::Transform;
use psw_observe::metrics::{Counter, DurationAgg, ScopedTimer};

use crate::TrainError;

/// One materialized mini-batch: `len x numel(shape)` CHW floats plus labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub labels: Vec<usize>,
    pub shape: ImageShape,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `[n, c, h, w]` images and `[n]` class ids on `device`.
    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
        let n = self.len();
        let ImageShape {
            channels,
            height,
            width,
        } = self.shape;
        let images = Tensor::from_data(
            TensorData::new(self.inputs, [n, channels, height, width]),
            device,
        );
        let labels: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();
        let labels = Tensor::from_data(TensorData::new(labels, [n]), device);
        (images, labels)
    }
}

#[derive(Debug, Default)]
pub struct LoaderMetrics {
    pub batches_total: Counter,
    pub samples_total: Counter,
    pub batch_time: DurationAgg,
}

/// RNG for the sample at `position` of an epoch's order. Stream 0 is the
/// epoch shuffle, so samples start at stream 1.
pub fn sample_rng(epoch_seed: u64, position: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed);
    rng.set_stream(position as u64 + 1);
    rng
}

pub fn build_pool(threads: usize) -> Result<Option<Arc<rayon::ThreadPool>>, TrainError> {
    if threads <= 1 {
        return Ok(None);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("psw-loader-{i}"))
        .build()
        .map_err(|e| TrainError::Pool(e.to_string()))?;
    Ok(Some(Arc::new(pool)))
}

/// Batches a [`SampleSource`] through a transform, fetching samples in parallel.
pub struct BatchLoader<'a> {
    source: &'a dyn SampleSource,
    transform: &'a dyn Transform,
    batch_size: usize,
    shuffle: bool,
    pool: Option<Arc<rayon::ThreadPool>>,
    metrics: Arc<LoaderMetrics>,
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        source: &'a dyn SampleSource,
        transform: &'a dyn Transform,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, TrainError> {
        if batch_size == 0 {
            return Err(TrainError::Config("batch size must be > 0".to_string()));
        }
        Ok(Self {
            source,
            transform,
            batch_size,
            shuffle,
            pool: None,
            metrics: Arc::new(LoaderMetrics::default()),
        })
    }

    pub fn with_pool(mut self, pool: Option<Arc<rayon::ThreadPool>>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LoaderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn num_batches(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    /// Batches for one epoch. The order and every per-sample draw depend only
    /// on `epoch_seed`, never on thread scheduling.
    pub fn epoch(&self, epoch_seed: u64) -> EpochBatches<'_, 'a> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(epoch_seed));
        }
        EpochBatches {
            loader: self,
            order,
            next: 0,
            epoch_seed,
        }
    }

    fn materialize(
        &self,
        positions: std::ops::Range<usize>,
        order: &[usize],
        seed: u64,
    ) -> Result<Batch, TrainError> {
        let _timer = ScopedTimer::new(&self.metrics.batch_time);
        let shape = self.source.shape();
        let load_at = |pos: usize| -> Result<(Vec<f32>, usize), DatasetError> {
            let mut rng = sample_rng(seed, pos);
            let sample = self.source.fetch(order[pos], &mut rng)?;
            let image = self.transform.apply(sample.image, &mut rng);
            Ok((image.into_vec(), sample.label.index()))
        };

        let loaded: Vec<Result<(Vec<f32>, usize), DatasetError>> = match &self.pool {
            Some(pool) if positions.len() > 1 => {
                pool.install(|| positions.clone().into_par_iter().map(load_at).collect())
            }
            _ => positions.clone().map(load_at).collect(),
        };

        let mut inputs = Vec::with_capacity(positions.len() * shape.numel());
        let mut labels = Vec::with_capacity(positions.len());
        for item in loaded {
            let (pixels, label) = item?;
            if pixels.len() != shape.numel() {
                return Err(TrainError::BatchSize {
                    expected: shape.numel(),
                    got: pixels.len(),
                });
            }
            inputs.extend_from_slice(&pixels);
            labels.push(label);
        }

        self.metrics.batches_total.inc();
        self.metrics.samples_total.inc_by(labels.len() as u64);
        Ok(Batch {
            inputs,
            labels,
            shape,
        })
    }
}

pub struct EpochBatches<'l, 'a> {
    loader: &'l BatchLoader<'a>,
    order: Vec<usize>,
    next: usize,
    epoch_seed: u64,
}

impl Iterator for EpochBatches<'_, '_> {
    type Item = Result<Batch, TrainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.order.len() {
            return None;
        }
        let end = (self.next + self.loader.batch_size).min(self.order.len());
        let positions = self.next..end;
        self.next = end;
        Some(
            self.loader
                .materialize(positions, &self.order, self.epoch_seed),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.next).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}
