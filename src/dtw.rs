//! Dynamic-time-warping alignment between score and performance
//! feature sequences.
//!
//! [oltw] holds the streaming follower, the heart of the crate;
//! [classical] the full-matrix offline alignment.
pub mod classical;
pub mod oltw;

use crate::ExtractedFeature;

#[derive(Debug, Clone, Copy, PartialEq)]
/// Scaling applied to each path direction when accumulating cost:
/// `w_a` for a performance advance, `w_b` for a score advance, `w_c`
/// for the diagonal.
pub struct DirectionWeights {
    pub w_a: f64,
    pub w_b: f64,
    pub w_c: f64,
}

impl Default for DirectionWeights {
    fn default() -> Self {
        DirectionWeights {
            w_a: 1.,
            w_b: 1.,
            w_c: 1.,
        }
    }
}

/// L1 distance between two feature vectors.
pub(crate) fn cost(a: &ExtractedFeature, b: &ExtractedFeature) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_cost_is_l1() {
        let a = arr1(&[1., 2., 3.]);
        let b = arr1(&[2., 0., 3.]);
        assert_eq!(cost(&a, &b), 3.);
        assert_eq!(cost(&a, &a), 0.);
    }
}
