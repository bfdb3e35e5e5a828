//! Initial weights: published ImageNet state dicts and records from earlier sweeps.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, NamedMpkFileRecorder, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::info;

use super::{Backbone, BackboneModel};
use crate::TrainError;

/// Download location of a backbone's published ImageNet weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedWeights {
    pub url: &'static str,
    pub file_name: &'static str,
}

pub fn published_weights(backbone: Backbone) -> PublishedWeights {
    match backbone {
        Backbone::Resnet18 => PublishedWeights {
            url: "https://download.pytorch.org/models/resnet18-f37072fd.pth",
            file_name: "resnet18-f37072fd.pth",
        },
        Backbone::EfficientnetV2B0 => PublishedWeights {
            url: "https://github.com/rwightman/pytorch-image-models/releases/download/v0.1-effv2-weights/tf_efficientnetv2_b0-c7cc451f.pth",
            file_name: "tf_efficientnetv2_b0-c7cc451f.pth",
        },
        Backbone::Vgg16 => PublishedWeights {
            url: "https://download.pytorch.org/models/vgg16-397923af.pth",
            file_name: "vgg16-397923af.pth",
        },
    }
}

/// Cache path of the published weights under `weights_dir`.
pub fn published_path(weights_dir: &Path, backbone: Backbone) -> PathBuf {
    weights_dir.join(published_weights(backbone).file_name)
}

/// Records written by [`model_to_bytes`] use the `.mpk` extension.
pub fn is_model_record(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "mpk")
}

/// Loads a PyTorch state dict onto the published layout of `M`.
///
/// BatchNorm `weight`/`bias` become `gamma`/`beta` and linear weights are
/// transposed by the importer; backbone-specific renames come from
/// [`BackboneModel::torch_key_remap`].
pub fn load_torch<B: Backend, M: BackboneModel<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, TrainError> {
    let args = M::torch_key_remap()
        .into_iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });
    let record: M::Record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|e| TrainError::Pretrained {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;
    info!(backbone = %M::BACKBONE, path = %path.display(), "loaded published weights");
    Ok(model.load_record(record))
}

/// Loads a record written by a previous sweep onto an already adapted model.
pub fn load_model_record<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, TrainError> {
    let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
        .load(path.to_path_buf(), device)
        .map_err(|e| TrainError::Pretrained {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;
    info!(path = %path.display(), "loaded model record");
    Ok(model.load_record(record))
}

pub fn model_to_bytes<B: Backend, M: Module<B>>(model: M) -> Result<Vec<u8>, TrainError> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| TrainError::Record(format!("{e:?}")))
}

pub fn model_from_bytes<B: Backend, M: Module<B>>(
    model: M,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<M, TrainError> {
    let record = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
        .load(bytes, device)
        .map_err(|e| TrainError::Record(format!("{e:?}")))?;
    Ok(model.load_record(record))
}
