//! The streaming follower: incremental, bounded-memory online time
//! warping.
//!
//! Performance features arrive one at a time over a channel; after every
//! consumed step the follower emits its best current estimate of the
//! alignment as a `(performance_index, score_index)` pair. Memory is
//! bounded: the cost grid keeps `search_window + 1` rows, the rows the
//! best-recent scan can reach plus the predecessor row the recurrence
//! reads.
use crate::dtw::{cost, DirectionWeights};
use crate::{ExtractedFeature, SegnoError, SegnoResult};
use log::debug;
use noisy_float::prelude::*;
use std::sync::mpsc::{Receiver, SyncSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Advance the performance index only.
    I,
    /// Advance the score index only.
    J,
    /// Advance both.
    Both,
}

/// Ring buffer over recent rows of the accumulated-cost matrix. Row
/// slots are recycled as the performance index advances; cells that were
/// never written in the live band read as +∞.
///
/// `window + 1` slots are kept, not `window`: the recurrence for a fresh
/// row always reads row `i − 1`, which with a window of one cell lies
/// outside the cells the best-recent scan can reach.
struct CostGrid {
    slots: usize,
    cols: usize,
    cells: Vec<f64>,
}

impl CostGrid {
    fn new(window: usize, cols: usize) -> CostGrid {
        let slots = window + 1;
        CostGrid {
            slots,
            cols,
            cells: vec![f64::INFINITY; slots * cols],
        }
    }

    /// Claim the slot for row `i`, wiping whatever older row lived there.
    fn reset_row(&mut self, i: usize) {
        let start = (i % self.slots) * self.cols;
        self.cells[start..start + self.cols].fill(f64::INFINITY);
    }

    fn get(&self, i: isize, j: isize) -> f64 {
        if i < 0 || j < 0 || j >= self.cols as isize {
            return f64::INFINITY;
        }
        self.cells[(i as usize % self.slots) * self.cols + j as usize]
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        self.cells[(i % self.slots) * self.cols + j] = value;
    }
}

/// The online-time-warping follower.
///
/// Reads `Option<ExtractedFeature>` records from its input channel
/// (`None` meaning the performance ended) and writes one
/// `Some((p_idx, s_idx))` estimate per iteration, then a final `None`,
/// to its output channel.
pub struct Oltw {
    score: Vec<ExtractedFeature>,
    input: Receiver<Option<ExtractedFeature>>,
    output: SyncSender<Option<(usize, usize)>>,
    search_window: usize,
    max_run_count: usize,
    weights: DirectionWeights,
}

impl Oltw {
    pub fn new(
        score: Vec<ExtractedFeature>,
        input: Receiver<Option<ExtractedFeature>>,
        output: SyncSender<Option<(usize, usize)>>,
        search_window: usize,
        max_run_count: usize,
        weights: DirectionWeights,
    ) -> SegnoResult<Oltw> {
        if score.is_empty() {
            return Err(SegnoError::FollowerError(
                "empty score feature sequence".to_string(),
            ));
        }
        if search_window == 0 {
            return Err(SegnoError::FollowerError(
                "search_window must be at least 1".to_string(),
            ));
        }
        if max_run_count == 0 {
            return Err(SegnoError::FollowerError(
                "max_run_count must be at least 1".to_string(),
            ));
        }
        Ok(Oltw {
            score,
            input,
            output,
            search_window,
            max_run_count,
            weights,
        })
    }

    /// Run until the score end is reached or the performance stops.
    pub fn start(self) -> SegnoResult<()> {
        let cols = self.score.len();
        let window = self.search_window;
        let mut grid = CostGrid::new(window, cols);
        // Last `search_window` performance features, same slot scheme as
        // the grid rows.
        let mut recent: Vec<Option<ExtractedFeature>> = (0..window).map(|_| None).collect();

        let Some(first) = self.next_feature() else {
            self.emit_end();
            return Ok(());
        };
        grid.set(0, 0, cost(&first, &self.score[0]));
        recent[0] = Some(first);

        let (mut i, mut j) = (0_usize, 0_usize);
        let (mut best_i, mut best_j) = (0_usize, 0_usize);
        let mut previous: Option<Step> = None;
        let mut run_count: usize = 1;

        if self.emit(best_i, best_j).is_err() {
            return Ok(());
        }

        loop {
            if j == cols - 1 {
                debug!("reached the last score frame at performance frame {i}");
                self.emit_end();
                return Ok(());
            }

            let current = self.choose_step(i, j, best_i, best_j, run_count, previous)?;

            if current != Step::J {
                let Some(feature) = self.next_feature() else {
                    self.emit_end();
                    return Ok(());
                };
                i += 1;
                grid.reset_row(i);
                recent[i % window] = Some(feature);
                for col in j.saturating_sub(window - 1)..=j {
                    let value = self.cell_value(&grid, &recent, i, col);
                    grid.set(i, col, value);
                }
            }
            if current != Step::I {
                j += 1;
                for row in i.saturating_sub(window - 1)..=i {
                    let value = self.cell_value(&grid, &recent, row, j);
                    grid.set(row, j, value);
                }
            }

            run_count = match previous {
                Some(prev) if prev == current && prev != Step::Both => run_count + 1,
                _ => 1,
            };
            previous = Some(current);

            (best_i, best_j) = self.best_recent(&grid, i, j);
            if self.emit(best_i, best_j).is_err() {
                return Ok(());
            }
        }
    }

    /// Pick the direction(s) for this iteration: unconstrained during
    /// warm-up, forced to the complementary direction when a
    /// single-direction run exceeds `max_run_count`, otherwise towards
    /// the best recent cell.
    fn choose_step(
        &self,
        i: usize,
        j: usize,
        best_i: usize,
        best_j: usize,
        run_count: usize,
        previous: Option<Step>,
    ) -> SegnoResult<Step> {
        if i < self.search_window {
            return Ok(Step::Both);
        }
        if run_count > self.max_run_count {
            return match previous {
                Some(Step::I) => Ok(Step::J),
                Some(_) => Ok(Step::I),
                None => Err(SegnoError::FollowerError(
                    "run count exceeded before the first step".to_string(),
                )),
            };
        }
        if best_i < i {
            Ok(Step::J)
        } else if best_j < j {
            Ok(Step::I)
        } else {
            Ok(Step::Both)
        }
    }

    /// Accumulated cost for a freshly visited cell.
    fn cell_value(
        &self,
        grid: &CostGrid,
        recent: &[Option<ExtractedFeature>],
        row: usize,
        col: usize,
    ) -> f64 {
        let feature = recent[row % self.search_window]
            .as_ref()
            .expect("performance feature missing inside the search window");
        let d = cost(feature, &self.score[col]);
        if row == 0 && col == 0 {
            return d;
        }
        let (row, col) = (row as isize, col as isize);
        let candidates = [
            (self.weights.w_c, grid.get(row - 1, col - 1)),
            (self.weights.w_a, grid.get(row - 1, col)),
            (self.weights.w_b, grid.get(row, col - 1)),
        ];
        let mut best = n64(f64::INFINITY);
        for (weight, value) in candidates {
            // An out-of-range or unvisited neighbour contributes +∞
            // regardless of its weight.
            let candidate = if value.is_finite() {
                n64(weight * value)
            } else {
                n64(f64::INFINITY)
            };
            if candidate < best {
                best = candidate;
            }
        }
        d + best.raw()
    }

    /// Cheapest cell among the last `search_window` cells of column `j`
    /// and of row `i`. The column is scanned before the row, head first,
    /// and the earliest scanned cell wins ties.
    fn best_recent(&self, grid: &CostGrid, i: usize, j: usize) -> (usize, usize) {
        let window = self.search_window;
        let mut best_cost = n64(f64::INFINITY);
        let mut best = (i, j);
        for row in (i.saturating_sub(window - 1)..=i).rev() {
            let value = n64(grid.get(row as isize, j as isize));
            if value < best_cost {
                best_cost = value;
                best = (row, j);
            }
        }
        for col in (j.saturating_sub(window - 1)..=j).rev() {
            let value = n64(grid.get(i as isize, col as isize));
            if value < best_cost {
                best_cost = value;
                best = (i, col);
            }
        }
        best
    }

    /// Next performance feature; a closed channel counts as end-of-stream.
    fn next_feature(&self) -> Option<ExtractedFeature> {
        self.input.recv().ok().flatten()
    }

    fn emit(&self, i: usize, j: usize) -> Result<(), ()> {
        self.output.send(Some((i, j))).map_err(|_| ())
    }

    fn emit_end(&self) {
        let _ = self.output.send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc::sync_channel;
    use std::thread;

    fn features(values: &[[f64; 2]]) -> Vec<ExtractedFeature> {
        values.iter().map(|pair| arr1(pair)).collect()
    }

    /// Feed `performance` through a follower and collect every emission
    /// up to (excluding) the end-of-stream marker.
    fn run_follower(
        performance: Vec<ExtractedFeature>,
        score: Vec<ExtractedFeature>,
        search_window: usize,
        max_run_count: usize,
    ) -> Vec<(usize, usize)> {
        let (feature_tx, feature_rx) = sync_channel(4);
        let (out_tx, out_rx) = sync_channel(4);
        let follower = Oltw::new(
            score,
            feature_rx,
            out_tx,
            search_window,
            max_run_count,
            DirectionWeights::default(),
        )
        .unwrap();
        let feeder = thread::spawn(move || {
            for feature in performance {
                if feature_tx.send(Some(feature)).is_err() {
                    return;
                }
            }
            let _ = feature_tx.send(None);
        });
        let handle = thread::spawn(move || follower.start());

        let mut emissions = Vec::new();
        while let Ok(Some(pair)) = out_rx.recv() {
            emissions.push(pair);
        }
        feeder.join().unwrap();
        handle.join().unwrap().unwrap();
        emissions
    }

    #[test]
    fn test_minimal_alignment() {
        let emissions = run_follower(
            vec![arr1(&[2.0])],
            vec![arr1(&[1.0])],
            3,
            3,
        );
        assert_eq!(emissions, vec![(0, 0)]);
    }

    #[test]
    fn test_diagonal_alignment() {
        let performance = features(&[[1., 2.], [3., 3.], [2., 2.], [2., 3.], [6., 6.]]);
        let score = features(&[[1., 2.], [3., 3.], [2., 2.], [4., 3.], [2., 2.]]);
        let emissions = run_follower(performance, score, 3, 999);
        assert_eq!(
            emissions,
            vec![(0, 0), (1, 1), (2, 2), (3, 2), (3, 3), (3, 4)]
        );
    }

    #[test]
    fn test_performance_index_is_monotone() {
        let performance = features(&[[1., 0.], [0., 1.], [1., 1.], [2., 0.], [0., 2.], [3., 1.]]);
        let score = features(&[[0., 1.], [1., 0.], [2., 2.], [1., 3.]]);
        let emissions = run_follower(performance, score, 2, 2);
        for pair in emissions.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn test_identical_sequences_terminate_without_stalling() {
        let v = [0.5, 0.5];
        let emissions = run_follower(features(&[v; 5]), features(&[v; 5]), 2, 2);
        // The follower has to reach the final score frame before running
        // out of performance frames.
        assert_eq!(emissions.last().unwrap().1, 4);
    }

    #[test]
    fn test_performance_end_stops_the_follower() {
        let performance = features(&[[1., 1.], [1., 1.]]);
        let score = features(&[[0., 0.]; 100]);
        let emissions = run_follower(performance, score, 3, 3);
        // Two frames consumed during warm-up, nothing more to read.
        assert!(emissions.len() <= 3);
    }

    #[test]
    fn test_empty_performance_emits_only_end() {
        let emissions = run_follower(vec![], features(&[[1., 1.], [2., 2.]]), 3, 3);
        assert_eq!(emissions, vec![]);
    }

    #[test]
    fn test_empty_score_is_rejected() {
        let (_feature_tx, feature_rx) = sync_channel::<Option<ExtractedFeature>>(1);
        let (out_tx, _out_rx) = sync_channel(1);
        assert!(Oltw::new(vec![], feature_rx, out_tx, 3, 3, DirectionWeights::default()).is_err());
    }

    #[test]
    fn test_cost_grid_keeps_the_predecessor_row_with_a_unit_window() {
        let mut grid = CostGrid::new(1, 3);
        grid.set(0, 0, 1.5);
        grid.reset_row(1);
        // Claiming row 1 must not wipe row 0, which the recurrence for
        // row 1 still reads.
        assert_eq!(grid.get(0, 0), 1.5);
        grid.set(1, 1, 2.5);
        grid.reset_row(2);
        assert_eq!(grid.get(1, 1), 2.5);
        assert!(grid.get(2, 0).is_infinite());
    }

    #[test]
    fn test_unit_search_window_follows_the_diagonal() {
        // The smallest legal window: the recurrence still has to see the
        // previous performance row's costs.
        let score = features(&[[0., 0.], [1., 0.], [2., 0.], [3., 0.]]);
        let emissions = run_follower(score.clone(), score, 1, 2);
        assert_eq!(emissions, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_warm_up_consumes_one_frame_per_score_frame() {
        // During warm-up every iteration advances both indices, so with
        // C ≥ |S| the emissions walk the diagonal of an identity pair.
        let score = features(&[[1., 0.], [2., 0.], [3., 0.], [4., 0.]]);
        let emissions = run_follower(score.clone(), score, 10, 3);
        assert_eq!(emissions, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_anti_stall_forces_the_complementary_direction() {
        let (_feature_tx, feature_rx) = sync_channel::<Option<ExtractedFeature>>(1);
        let (out_tx, _out_rx) = sync_channel(1);
        let follower = Oltw::new(
            features(&[[0., 0.]; 8]),
            feature_rx,
            out_tx,
            2,
            3,
            DirectionWeights::default(),
        )
        .unwrap();

        // A run of `I`s longer than max_run_count forces a `J`, and vice
        // versa.
        assert_eq!(follower.choose_step(5, 5, 5, 5, 4, Some(Step::I)).unwrap(), Step::J);
        assert_eq!(follower.choose_step(5, 5, 5, 5, 4, Some(Step::J)).unwrap(), Step::I);
        // Below the bound the best-recent cell decides.
        assert_eq!(follower.choose_step(5, 5, 4, 5, 3, Some(Step::I)).unwrap(), Step::J);
        assert_eq!(follower.choose_step(5, 5, 5, 4, 3, Some(Step::I)).unwrap(), Step::I);
        assert_eq!(follower.choose_step(5, 5, 5, 5, 3, Some(Step::I)).unwrap(), Step::Both);
        // Warm-up ignores everything else.
        assert_eq!(follower.choose_step(1, 5, 0, 0, 99, Some(Step::I)).unwrap(), Step::Both);
    }

    #[test]
    fn test_recurrence_on_a_small_grid() {
        // 2×2 hand-checked costs: P = [(0), (1)], S = [(0), (2)].
        let performance = features(&[[0., 0.], [1., 0.]]);
        let score = features(&[[0., 0.], [2., 0.]]);
        let emissions = run_follower(performance, score, 3, 3);
        // D[0,0] = 0, D[1,1] = d((1),(2)) + min(D[0,0], D[0,1], D[1,0])
        //         = 1 + 0 = 1, which beats D[0,1] = 2 and D[1,0] = 1 on
        // the scan order, so the second emission is the diagonal cell.
        assert_eq!(emissions, vec![(0, 0), (1, 1)]);
    }
}
