use rand::Rng;
use tracing::debug;

use psw_core::dataset::Dataset;
use psw_core::types::{ClassId, Percentage};

use crate::select::select_for_corruption;
use crate::{check_class, PoisonError};

/// Overwrites `labels[i]` with `alternate` for every selected index.
///
/// All indices are validated first; on error no label is written.
pub fn relabel(
    labels: &mut [ClassId],
    indices: &[usize],
    alternate: ClassId,
) -> Result<usize, PoisonError> {
    if let Some(&index) = indices.iter().find(|&&i| i >= labels.len()) {
        return Err(PoisonError::IndexOutOfRange {
            index,
            len: labels.len(),
        });
    }
    for &i in indices {
        labels[i] = alternate;
    }
    Ok(indices.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPoisonReport {
    pub target_count: usize,
    pub relabeled: Vec<usize>,
}

/// Selects and relabels a fraction of `target` in place.
pub fn poison_labels<R: Rng + ?Sized>(
    dataset: &mut Dataset,
    target: ClassId,
    alternate: ClassId,
    percentage: Percentage,
    rng: &mut R,
) -> Result<LabelPoisonReport, PoisonError> {
    check_class("target", target, dataset.num_classes())?;
    check_class("alternate", alternate, dataset.num_classes())?;

    let target_count = dataset.class_count(target);
    let selected = select_for_corruption(dataset.labels(), target, percentage, rng);
    relabel(dataset.labels_mut(), &selected, alternate)?;
    debug!(
        target = %target,
        alternate = %alternate,
        percentage = percentage.get(),
        target_count,
        relabeled = selected.len(),
        "label poisoning applied"
    );
    Ok(LabelPoisonReport {
        target_count,
        relabeled: selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relabel_touches_only_selected() {
        let mut labels = vec![ClassId(3); 6];
        let n = relabel(&mut labels, &[1, 4], ClassId(5)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            labels,
            vec![
                ClassId(3),
                ClassId(5),
                ClassId(3),
                ClassId(3),
                ClassId(5),
                ClassId(3)
            ]
        );
    }

    #[test]
    fn relabel_out_of_range_writes_nothing() {
        let mut labels = vec![ClassId(1); 3];
        let err = relabel(&mut labels, &[0, 3], ClassId(2)).unwrap_err();
        assert!(matches!(err, PoisonError::IndexOutOfRange { index: 3, len: 3 }));
        assert_eq!(labels, vec![ClassId(1); 3]);
    }
}
