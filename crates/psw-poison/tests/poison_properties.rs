use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use psw_core::dataset::{Dataset, SampleSource, U8ImageStore};
use psw_core::image::ImageShape;
use psw_core::types::{ClassId, Percentage};
use psw_poison::relabel::poison_labels;
use psw_poison::trigger::TriggerPattern;
use psw_poison::triggered::{InjectionMode, TriggeredSource};
use psw_poison::PoisonError;

const SHAPE: ImageShape = ImageShape::new(3, 8, 8);

/// `per_class` examples for each of `classes` classes, pixels at mid-gray.
fn balanced_dataset(classes: u32, per_class: usize) -> Dataset {
    let n = classes as usize * per_class;
    let store = U8ImageStore::new(SHAPE, vec![128; n * SHAPE.numel()]).unwrap();
    let labels = (0..n).map(|i| ClassId((i % classes as usize) as u32)).collect();
    Dataset::new("synthetic", classes as usize, Arc::new(store), labels).unwrap()
}

#[test]
fn fifty_percent_of_class_three_becomes_five() {
    let mut ds = balanced_dataset(10, 500);
    let original = ds.labels().to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let report = poison_labels(
        &mut ds,
        ClassId(3),
        ClassId(5),
        Percentage::new(50).unwrap(),
        &mut rng,
    )
    .unwrap();

    assert_eq!(report.target_count, 500);
    assert_eq!(report.relabeled.len(), 250);
    assert_eq!(ds.class_count(ClassId(3)), 250);
    assert_eq!(ds.class_count(ClassId(5)), 750);

    for (i, (&before, &after)) in original.iter().zip(ds.labels()).enumerate() {
        if before == ClassId(3) {
            assert!(after == ClassId(3) || after == ClassId(5));
        } else {
            assert_eq!(before, after, "non-target label changed at {i}");
        }
    }
}

#[test]
fn zero_percent_is_identity_and_full_relabels_all() {
    let mut ds = balanced_dataset(4, 20);
    let original = ds.labels().to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    poison_labels(&mut ds, ClassId(3), ClassId(1), Percentage::ZERO, &mut rng).unwrap();
    assert_eq!(ds.labels(), original.as_slice());

    poison_labels(&mut ds, ClassId(3), ClassId(1), Percentage::FULL, &mut rng).unwrap();
    assert_eq!(ds.class_count(ClassId(3)), 0);
    assert_eq!(ds.class_count(ClassId(1)), 40);
}

#[test]
fn alternate_label_must_exist() {
    let mut ds = balanced_dataset(4, 2);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let err = poison_labels(&mut ds, ClassId(3), ClassId(9), Percentage::FULL, &mut rng)
        .unwrap_err();
    assert!(matches!(
        err,
        PoisonError::ClassOutOfRange {
            role: "alternate",
            ..
        }
    ));
}

#[test]
fn trigger_only_touches_target_class_inside_region() {
    let ds = balanced_dataset(5, 10);
    let pattern = TriggerPattern {
        square_size: 2,
        pattern_size: 2,
        offset: (1, 3),
    };
    let mut build_rng = ChaCha8Rng::seed_from_u64(7);
    let source = TriggeredSource::new(
        ds.clone(),
        pattern,
        ClassId(3),
        Percentage::FULL,
        InjectionMode::PerAccess,
        &mut build_rng,
    )
    .unwrap();
    let (y0, x0, y1, x1) = pattern.region();

    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for i in 0..SampleSource::len(&source) {
        let clean = ds.fetch(i, &mut rng).unwrap();
        let got = source.fetch(i, &mut rng).unwrap();
        assert_eq!(got.label, clean.label);
        for c in 0..SHAPE.channels {
            for y in 0..SHAPE.height {
                for x in 0..SHAPE.width {
                    let inside = (y0..y1).contains(&y) && (x0..x1).contains(&x);
                    if clean.label != ClassId(3) || !inside {
                        assert_eq!(got.image.get(c, y, x), clean.image.get(c, y, x));
                    } else {
                        assert_ne!(got.image.get(c, y, x), clean.image.get(c, y, x));
                    }
                }
            }
        }
    }
    assert_eq!(source.stamped_counter().get(), 10);
}

#[test]
fn per_access_rate_converges() {
    let ds = balanced_dataset(2, 1);
    let target_index = 1;
    let mut build_rng = ChaCha8Rng::seed_from_u64(0);
    let source = TriggeredSource::new(
        ds,
        TriggerPattern::default(),
        ClassId(1),
        Percentage::new(30).unwrap(),
        InjectionMode::PerAccess,
        &mut build_rng,
    )
    .unwrap();

    let accesses = 20_000;
    let mut rng = ChaCha8Rng::seed_from_u64(123);
    let mut fired = 0usize;
    for _ in 0..accesses {
        let s = source.fetch(target_index, &mut rng).unwrap();
        if s.image.get(0, 0, 0) == 1.0 {
            fired += 1;
        }
    }
    let observed = fired as f64 / accesses as f64;
    assert!((observed - 0.3).abs() < 0.02, "observed rate {observed}");
    assert_eq!(source.stamped_counter().get(), fired as u64);
}

#[test]
fn fixed_mode_stamps_exact_member_set_every_time() {
    let ds = balanced_dataset(4, 50);
    let mut build_rng = ChaCha8Rng::seed_from_u64(5);
    let source = TriggeredSource::new(
        ds,
        TriggerPattern::default(),
        ClassId(3),
        Percentage::new(20).unwrap(),
        InjectionMode::Fixed,
        &mut build_rng,
    )
    .unwrap();
    assert_eq!(source.fixed_members(), Some(10));

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    for _epoch in 0..3 {
        for i in 0..SampleSource::len(&source) {
            source.fetch(i, &mut rng).unwrap();
        }
    }
    assert_eq!(source.stamped_counter().get(), 30);
}
