use rand::Rng;

use psw_core::types::{ClassId, Percentage};

/// Positions of every example labeled `target`, in dataset order.
pub fn target_indices(labels: &[ClassId], target: ClassId) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter_map(|(i, &l)| (l == target).then_some(i))
        .collect()
}

/// Picks `floor(percentage/100 * N)` of the `N` target-class examples,
/// uniformly and without replacement. The result is sorted ascending.
pub fn select_for_corruption<R: Rng + ?Sized>(
    labels: &[ClassId],
    target: ClassId,
    percentage: Percentage,
    rng: &mut R,
) -> Vec<usize> {
    let candidates = target_indices(labels, target);
    let count = percentage.count_of(candidates.len());
    if count == 0 {
        return Vec::new();
    }
    if count == candidates.len() {
        return candidates;
    }

    let mut picked: Vec<usize> = rand::seq::index::sample(rng, candidates.len(), count)
        .into_iter()
        .map(|i| candidates[i])
        .collect();
    picked.sort_unstable();
    picked
}
