#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Training-set corruption: choosing which examples to poison, relabeling
//! them, and stamping a backdoor trigger at load time.

pub mod relabel;
pub mod select;
pub mod trigger;
pub mod triggered;

use psw_core::dataset::DatasetError;
use psw_core::types::ClassId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoisonError {
    #[error("index {index} out of range for {len} labels")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("{role} class {class} out of range for {num_classes} classes")]
    ClassOutOfRange {
        role: &'static str,
        class: ClassId,
        num_classes: usize,
    },
    #[error("trigger square_size and pattern_size must be > 0")]
    EmptyTrigger,
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

pub(crate) fn check_class(
    role: &'static str,
    class: ClassId,
    num_classes: usize,
) -> Result<(), PoisonError> {
    if class.index() >= num_classes {
        return Err(PoisonError::ClassOutOfRange {
            role,
            class,
            num_classes,
        });
    }
    Ok(())
}
