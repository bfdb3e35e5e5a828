#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Classifier training for one sweep point: convolutional backbones on burn,
//! SGD with plateau scheduling, parallel batch loading and the epoch loop.

pub mod checkpoint;
pub mod loader;
pub mod model;
pub mod optim;
pub mod scheduler;
pub mod trainer;

use std::path::PathBuf;

use psw_checkpoint_store::CheckpointStoreError;
use psw_core::dataset::DatasetError;
use psw_core::image::ImageShape;
use thiserror::Error;

/// CPU backend with reverse-mode autodiff; evaluation runs on its inner backend.
pub type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("input shape {got:?} does not match {expected:?}")]
    InputShape {
        expected: ImageShape,
        got: ImageShape,
    },
    #[error("{backbone} cannot be fitted to {input:?}: {reason}")]
    Architecture {
        backbone: &'static str,
        input: ImageShape,
        reason: String,
    },
    #[error("batch holds {got} values, expected {expected}")]
    BatchSize { expected: usize, got: usize },
    #[error("label {label} out of range for {num_classes} classes")]
    Label { label: usize, num_classes: usize },
    #[error("pretrained weights {path}: {detail}")]
    Pretrained { path: PathBuf, detail: String },
    #[error("model record: {0}")]
    Record(String),
    #[error("invalid training config: {0}")]
    Config(String),
    #[error("failed to build loader pool: {0}")]
    Pool(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Store(#[from] CheckpointStoreError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
