use std::path::{Path, PathBuf};

use psw_core::dataset::Dataset;
use tracing::info;

use crate::catalog::{DatasetSpec, Split};
use crate::cifar::load_cifar;
use crate::fetch::ensure_dataset;
use crate::imagefolder::{load_image_folder, scan_classes};
use crate::DataError;

/// Source of fresh train/test datasets for a sweep point.
pub trait SplitLoader: Send + Sync {
    fn spec(&self) -> &DatasetSpec;

    /// Loads `split` from scratch; labels are never shared between calls.
    fn load(&self, split: Split) -> Result<Dataset, DataError>;
}

/// Hands out fresh copies of a cached dataset, one per call.
#[derive(Debug, Clone)]
pub struct DatasetProvider {
    spec: DatasetSpec,
    location: PathBuf,
    /// ImageFolder class names, fixed by the train split.
    classes: Option<Vec<String>>,
}

impl DatasetProvider {
    /// Fetches (if needed) and indexes the dataset under `root`.
    pub async fn prepare(root: &Path, spec: DatasetSpec) -> Result<Self, DataError> {
        let location = ensure_dataset(root, &spec).await?;
        let classes = if spec.archive.is_none() {
            let classes = scan_classes(&location.join(split_dir(Split::Train)))?;
            if classes.len() != spec.num_classes {
                info!(
                    dataset = %spec.kind,
                    found = classes.len(),
                    expected = spec.num_classes,
                    "class directory count differs from catalog; using directories"
                );
            }
            Some(classes)
        } else {
            None
        };
        Ok(Self {
            spec,
            location,
            classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classes
            .as_ref()
            .map(Vec::len)
            .unwrap_or(self.spec.num_classes)
    }
}

impl SplitLoader for DatasetProvider {
    fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    fn load(&self, split: Split) -> Result<Dataset, DataError> {
        match &self.classes {
            None => load_cifar(&self.location, &self.spec, split),
            Some(classes) => load_image_folder(
                &self.location.join(split_dir(split)),
                classes,
                self.spec.shape,
            ),
        }
    }
}

fn split_dir(split: Split) -> &'static str {
    match split {
        Split::Train => "train",
        Split::Test => "val",
    }
}
