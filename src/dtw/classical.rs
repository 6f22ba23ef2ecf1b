//! Full-matrix dynamic time warping for offline alignment.
use crate::dtw::{cost, DirectionWeights};
use crate::{ExtractedFeature, SegnoError, SegnoResult};
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Diag,
    Left,
    Down,
}

/// Offline aligner over fully materialised feature sequences.
///
/// The whole `|S| × |P|` cost matrix is filled, then the optimal path is
/// read back from the far corner. The diagonal contribution is doubled
/// so a diagonal step competes fairly against the pair of single steps
/// it replaces; each contribution is scaled by its direction weight, and
/// the diagonal is preferred on cost ties.
pub struct ClassicalDtw<'a> {
    performance: &'a [ExtractedFeature],
    score: &'a [ExtractedFeature],
    weights: DirectionWeights,
}

impl<'a> ClassicalDtw<'a> {
    pub fn new(
        performance: &'a [ExtractedFeature],
        score: &'a [ExtractedFeature],
        weights: DirectionWeights,
    ) -> SegnoResult<ClassicalDtw<'a>> {
        if performance.is_empty() {
            return Err(SegnoError::FollowerError(
                "empty performance feature sequence".to_string(),
            ));
        }
        if score.is_empty() {
            return Err(SegnoError::FollowerError(
                "empty score feature sequence".to_string(),
            ));
        }
        Ok(ClassicalDtw {
            performance,
            score,
            weights,
        })
    }

    /// The optimal alignment path, front to back, as
    /// `(performance_index, score_index)` pairs from `(0, 0)` to the two
    /// final indices.
    pub fn path(&self) -> Vec<(usize, usize)> {
        let rows = self.score.len();
        let cols = self.performance.len();
        let mut costs: Array2<f64> = Array2::from_elem((rows, cols), f64::INFINITY);
        let mut directions: Array2<Direction> = Array2::from_elem((rows, cols), Direction::Diag);

        for r in 0..rows {
            for c in 0..cols {
                let d = cost(&self.score[r], &self.performance[c]);
                if (r, c) == (0, 0) {
                    costs[[0, 0]] = d;
                    continue;
                }
                // A step down advances the score index, a step left the
                // performance index.
                let diag = if r > 0 && c > 0 {
                    self.weights.w_c * 2. * costs[[r - 1, c - 1]]
                } else {
                    f64::INFINITY
                };
                let down = if r > 0 {
                    self.weights.w_b * costs[[r - 1, c]]
                } else {
                    f64::INFINITY
                };
                let left = if c > 0 {
                    self.weights.w_a * costs[[r, c - 1]]
                } else {
                    f64::INFINITY
                };

                let (min_cost, direction) = if diag <= down && diag <= left {
                    (diag, Direction::Diag)
                } else if down <= left {
                    (down, Direction::Down)
                } else {
                    (left, Direction::Left)
                };
                costs[[r, c]] = d + min_cost;
                directions[[r, c]] = direction;
            }
        }

        let mut path = Vec::new();
        let (mut r, mut c) = (rows as isize - 1, cols as isize - 1);
        while r >= 0 && c >= 0 {
            path.push((c as usize, r as usize));
            match directions[[r as usize, c as usize]] {
                Direction::Diag => {
                    r -= 1;
                    c -= 1;
                }
                Direction::Down => r -= 1,
                Direction::Left => c -= 1,
            }
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use pretty_assertions::assert_eq;

    fn features(values: &[f64]) -> Vec<ExtractedFeature> {
        values.iter().map(|&v| arr1(&[v])).collect()
    }

    #[test]
    fn test_identical_sequences_walk_the_diagonal() {
        let sequence = features(&[1., 5., 9.]);
        let dtw = ClassicalDtw::new(&sequence, &sequence, DirectionWeights::default()).unwrap();
        assert_eq!(dtw.path(), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_single_score_frame_absorbs_the_performance() {
        let performance = features(&[3., 3., 3.]);
        let score = features(&[3.]);
        let dtw = ClassicalDtw::new(&performance, &score, DirectionWeights::default()).unwrap();
        assert_eq!(dtw.path(), vec![(0, 0), (1, 0), (2, 0)]);
    }

    #[test]
    fn test_stretched_performance_repeats_score_frames() {
        // The performance holds the first score frame twice as long.
        let performance = features(&[1., 1., 5., 9.]);
        let score = features(&[1., 5., 9.]);
        let dtw = ClassicalDtw::new(&performance, &score, DirectionWeights::default()).unwrap();
        let path = dtw.path();
        assert_eq!(path.first(), Some(&(0, 0)));
        assert_eq!(path.last(), Some(&(3, 2)));
        assert!(path.contains(&(1, 0)));
        // Path indices never decrease.
        for pair in path.windows(2) {
            assert!(pair[1].0 >= pair[0].0 && pair[1].1 >= pair[0].1);
        }
    }

    #[test]
    fn test_diagonal_weight_steers_the_path() {
        // d(r, c): [[1, 2], [4, 1]]. With unit weights the corner is
        // reached diagonally; pricing the diagonal up forces the path
        // through (1, 0) instead.
        let performance = features(&[0., 3.]);
        let score = features(&[1., 4.]);

        let unit = ClassicalDtw::new(&performance, &score, DirectionWeights::default()).unwrap();
        assert_eq!(unit.path(), vec![(0, 0), (1, 1)]);

        let expensive_diagonal = DirectionWeights {
            w_a: 1.,
            w_b: 1.,
            w_c: 10.,
        };
        let steered = ClassicalDtw::new(&performance, &score, expensive_diagonal).unwrap();
        assert_eq!(steered.path(), vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        let sequence = features(&[1.]);
        assert!(ClassicalDtw::new(&[], &sequence, DirectionWeights::default()).is_err());
        assert!(ClassicalDtw::new(&sequence, &[], DirectionWeights::default()).is_err());
    }
}
