#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;

use std::fmt;
use std::path::Path;

use psw_core::types::{DatasetKind, PoisonMode};
use psw_observe::time::unix_time_ms;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("invalid checkpoint key {0:?}")]
    InvalidKey(String),
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("checkpoint bytes do not match existing content for key {key}")]
    Collision { key: String },
    #[error("checkpoint {key} already exists and overwrite is disabled")]
    Exists { key: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// File name of one sweep point's checkpoint: `<dataset>_<mode>_<backbone>_<index>.json`.
///
/// Model and optimizer records of the same point share the stem with their own suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub dataset: DatasetKind,
    pub mode: PoisonMode,
    pub backbone: String,
    pub sweep_index: usize,
}

impl CheckpointKey {
    pub fn stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.dataset, self.mode, self.backbone, self.sweep_index
        )
    }

    /// Key of a companion file, e.g. `artifact("model.mpk")`.
    pub fn artifact(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.stem())
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.json", self.stem())
    }
}

/// Storage for serialized sweep checkpoints.
///
/// - Keys are flat file names; no path separators.
/// - Without `overwrite`, a key is write-once: identical bytes are accepted, different bytes collide.
pub trait CheckpointStore: Send + Sync + 'static {
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), CheckpointStoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointStoreError>;

    fn list(&self) -> Result<Vec<String>, CheckpointStoreError>;

    fn contains(&self, key: &str) -> Result<bool, CheckpointStoreError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(CheckpointStoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Fails with [`CheckpointStoreError::Exists`] on the first key already
    /// present, so callers can refuse work whose result could not be stored.
    fn ensure_absent(&self, keys: &[String]) -> Result<(), CheckpointStoreError> {
        for key in keys {
            if self.contains(key)? {
                return Err(CheckpointStoreError::Exists { key: key.clone() });
            }
        }
        Ok(())
    }
}

pub fn open_from_root(root: impl AsRef<Path>) -> Result<Box<dyn CheckpointStore>, CheckpointStoreError> {
    let root = root.as_ref();
    std::fs::create_dir_all(root)?;
    Ok(Box::new(fs::FsCheckpointStore::new(root)))
}

fn validate_key(key: &str) -> Result<(), CheckpointStoreError> {
    let bad = key.trim().is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.starts_with('.');
    if bad {
        return Err(CheckpointStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    let tmp = parent.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        unix_time_ms()
    ));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_name() {
        let key = CheckpointKey {
            dataset: DatasetKind::Cifar100,
            mode: PoisonMode::Label,
            backbone: "resnet18".to_string(),
            sweep_index: 4,
        };
        assert_eq!(key.to_string(), "cifar100_label_resnet18_4.json");
        assert_eq!(key.artifact("model.mpk"), "cifar100_label_resnet18_4.model.mpk");
        assert!(validate_key(&key.artifact("optim.mpk")).is_ok());
    }

    #[test]
    fn rejects_path_like_keys() {
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("  ").is_err());
        assert!(validate_key("cifar10_trigger_vgg16_0.json").is_ok());
    }
}
