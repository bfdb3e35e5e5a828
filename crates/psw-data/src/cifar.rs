//! CIFAR binary batch format.
//!
//! CIFAR-10 records are `<label u8><3072 pixel bytes>`; CIFAR-100 records are
//! `<coarse u8><fine u8><3072 pixel bytes>`. Pixels are planar RGB, 32x32.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use psw_core::dataset::{Dataset, U8ImageStore};
use psw_core::types::{ClassId, DatasetKind};
use tracing::debug;

use crate::catalog::{DatasetSpec, Split};
use crate::DataError;

fn label_bytes(kind: DatasetKind) -> usize {
    match kind {
        DatasetKind::Cifar100 => 2,
        _ => 1,
    }
}

pub fn batch_files(kind: DatasetKind, split: Split) -> Vec<&'static str> {
    match (kind, split) {
        (DatasetKind::Cifar100, Split::Train) => vec!["train.bin"],
        (DatasetKind::Cifar100, Split::Test) => vec!["test.bin"],
        (_, Split::Train) => vec![
            "data_batch_1.bin",
            "data_batch_2.bin",
            "data_batch_3.bin",
            "data_batch_4.bin",
            "data_batch_5.bin",
        ],
        (_, Split::Test) => vec!["test_batch.bin"],
    }
}

/// Appends every record in `bytes` to `pixels` / `labels`.
pub fn parse_records(
    bytes: &[u8],
    spec: &DatasetSpec,
    path: &Path,
    pixels: &mut Vec<u8>,
    labels: &mut Vec<ClassId>,
) -> Result<usize, DataError> {
    let prefix = label_bytes(spec.kind);
    let record = prefix + spec.shape.numel();
    if bytes.len() % record != 0 {
        return Err(DataError::Truncated {
            path: path.to_path_buf(),
            len: bytes.len(),
            record,
        });
    }

    let count = bytes.len() / record;
    pixels.reserve(count * spec.shape.numel());
    labels.reserve(count);
    for rec in bytes.chunks_exact(record) {
        // CIFAR-100 keeps the fine label in the second byte.
        let label = rec[prefix - 1];
        if usize::from(label) >= spec.num_classes {
            return Err(DataError::BadLabel {
                path: path.to_path_buf(),
                label,
                num_classes: spec.num_classes,
            });
        }
        labels.push(ClassId(u32::from(label)));
        pixels.extend_from_slice(&rec[prefix..]);
    }
    Ok(count)
}

/// Reads one split from an extracted `cifar-*-bin` directory.
pub fn load_cifar(batches: &Path, spec: &DatasetSpec, split: Split) -> Result<Dataset, DataError> {
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for name in batch_files(spec.kind, split) {
        let path: PathBuf = batches.join(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DataError::Missing(path))
            }
            Err(err) => return Err(DataError::Io(err)),
        };
        let n = parse_records(&bytes, spec, &path, &mut pixels, &mut labels)?;
        debug!(file = %path.display(), records = n, "parsed cifar batch");
    }

    let store = U8ImageStore::new(spec.shape, pixels)?;
    Ok(Dataset::new(
        format!("{}-{}", spec.kind, split.name()),
        spec.num_classes,
        Arc::new(store),
        labels,
    )?)
}
