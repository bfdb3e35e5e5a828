use serde::{Deserialize, Serialize};

use psw_core::image::Image;

use crate::PoisonError;

/// Checkerboard backdoor: a `pattern_size × pattern_size` grid of
/// `square_size × square_size` blocks anchored at `offset` (row, col).
/// Cell `(i, j)` is white when `i + j` is even, black otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPattern {
    pub square_size: usize,
    pub pattern_size: usize,
    pub offset: (usize, usize),
}

impl Default for TriggerPattern {
    fn default() -> Self {
        Self {
            square_size: 2,
            pattern_size: 1,
            offset: (0, 0),
        }
    }
}

impl TriggerPattern {
    pub fn validate(&self) -> Result<(), PoisonError> {
        if self.square_size == 0 || self.pattern_size == 0 {
            return Err(PoisonError::EmptyTrigger);
        }
        Ok(())
    }

    /// Unclipped bounding box `(y0, x0, y1, x1)` of every pixel the pattern may write.
    pub fn region(&self) -> (usize, usize, usize, usize) {
        let extent = self.square_size * self.pattern_size;
        (
            self.offset.0,
            self.offset.1,
            self.offset.0 + extent,
            self.offset.1 + extent,
        )
    }

    /// Writes the pattern into `img` on every channel. Blocks past the image edge are clipped.
    pub fn stamp(&self, img: &mut Image) {
        for i in 0..self.pattern_size {
            for j in 0..self.pattern_size {
                let value = if (i + j) % 2 == 0 { 1.0 } else { 0.0 };
                let y0 = self.offset.0 + i * self.square_size;
                let x0 = self.offset.1 + j * self.square_size;
                img.fill_rect(
                    y0,
                    x0,
                    y0 + self.square_size,
                    x0 + self.square_size,
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psw_core::image::ImageShape;

    #[test]
    fn default_is_single_white_square() {
        let mut img = Image::zeros(ImageShape::new(3, 4, 4));
        TriggerPattern::default().stamp(&mut img);
        for c in 0..3 {
            assert_eq!(img.get(c, 0, 0), 1.0);
            assert_eq!(img.get(c, 1, 1), 1.0);
            assert_eq!(img.get(c, 2, 2), 0.0);
        }
    }

    #[test]
    fn checkerboard_alternates() {
        let pattern = TriggerPattern {
            square_size: 1,
            pattern_size: 2,
            offset: (1, 1),
        };
        let mut img = Image::from_vec(ImageShape::new(1, 4, 4), vec![0.5; 16]).unwrap();
        pattern.stamp(&mut img);
        assert_eq!(img.get(0, 1, 1), 1.0);
        assert_eq!(img.get(0, 1, 2), 0.0);
        assert_eq!(img.get(0, 2, 1), 0.0);
        assert_eq!(img.get(0, 2, 2), 1.0);
        assert_eq!(img.get(0, 0, 0), 0.5);
        assert_eq!(img.get(0, 3, 3), 0.5);
    }

    #[test]
    fn clips_at_border() {
        let pattern = TriggerPattern {
            square_size: 4,
            pattern_size: 2,
            offset: (2, 2),
        };
        let mut img = Image::zeros(ImageShape::new(1, 3, 3));
        pattern.stamp(&mut img);
        assert_eq!(img.get(0, 2, 2), 1.0);
        assert_eq!(img.get(0, 1, 1), 0.0);
    }

    #[test]
    fn rejects_empty_pattern() {
        let pattern = TriggerPattern {
            square_size: 0,
            ..TriggerPattern::default()
        };
        assert!(matches!(pattern.validate(), Err(PoisonError::EmptyTrigger)));
    }
}
