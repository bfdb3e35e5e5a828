#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod archive;
pub mod catalog;
pub mod cifar;
pub mod fetch;
pub mod imagefolder;
pub mod provider;
pub mod transform;

use std::path::PathBuf;

use psw_core::dataset::DatasetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset file missing: {0}")]
    Missing(PathBuf),
    #[error("{path}: truncated record (len {len} is not a multiple of {record})")]
    Truncated {
        path: PathBuf,
        len: usize,
        record: usize,
    },
    #[error("{path}: label {label} out of range for {num_classes} classes")]
    BadLabel {
        path: PathBuf,
        label: u8,
        num_classes: usize,
    },
    #[error("tar archive: {0}")]
    Tar(String),
    #[error("image folder: {0}")]
    ImageFolder(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
