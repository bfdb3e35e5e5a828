use psw_core::image::ImageShape;
use psw_core::types::DatasetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Where a dataset's canonical archive lives and what it unpacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Archive {
    pub url: &'static str,
    pub file_name: &'static str,
    /// Directory inside the archive holding the binary batches.
    pub dir_name: &'static str,
}

/// Static facts about a supported dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub kind: DatasetKind,
    pub num_classes: usize,
    pub shape: ImageShape,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// `None` for datasets that must be provided locally.
    pub archive: Option<Archive>,
}

pub const CIFAR_SHAPE: ImageShape = ImageShape::new(3, 32, 32);
pub const DEFAULT_IMAGENET_SIZE: usize = 224;

pub fn spec_for(kind: DatasetKind, image_size: usize) -> DatasetSpec {
    match kind {
        DatasetKind::Cifar10 => DatasetSpec {
            kind,
            num_classes: 10,
            shape: CIFAR_SHAPE,
            mean: [0.4914, 0.4822, 0.4465],
            std: [0.2023, 0.1994, 0.2010],
            archive: Some(Archive {
                url: "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz",
                file_name: "cifar-10-binary.tar.gz",
                dir_name: "cifar-10-batches-bin",
            }),
        },
        DatasetKind::Cifar100 => DatasetSpec {
            kind,
            num_classes: 100,
            shape: CIFAR_SHAPE,
            mean: [0.507_362_07, 0.486_689_6, 0.441_088_62],
            std: [0.267_488_15, 0.256_593_1, 0.276_308_5],
            archive: Some(Archive {
                url: "https://www.cs.toronto.edu/~kriz/cifar-100-binary.tar.gz",
                file_name: "cifar-100-binary.tar.gz",
                dir_name: "cifar-100-binary",
            }),
        },
        DatasetKind::Imagenet => DatasetSpec {
            kind,
            num_classes: 1000,
            shape: ImageShape::new(3, image_size, image_size),
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            archive: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifar_shapes_ignore_image_size() {
        assert_eq!(spec_for(DatasetKind::Cifar10, 224).shape, CIFAR_SHAPE);
        assert_eq!(spec_for(DatasetKind::Cifar100, 64).num_classes, 100);
        assert_eq!(
            spec_for(DatasetKind::Imagenet, 64).shape,
            ImageShape::new(3, 64, 64)
        );
    }
}
