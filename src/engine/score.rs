// # Scoring
//
// Path-length scoring over the trained trees with three threshold modes
// (raw, scaled, percentile), the lazy per-forest scoring aids, and the
// cluster-based per-dimension attribution scores.

use crate::config::ScoreMode;
use crate::engine::forest::{Forest, Sample};
use crate::engine::tree::Tree;
use crate::engine::Engine;
use crate::math;

/// Lower bound for the relative nearest-sample distance at a leaf.
pub const MIN_REL_DIST: f64 = 0.05;

/// Extreme coordinate used when probing for a forest's maximum score.
pub const MAX_DIM_VALUE: f64 = 1e100;

/// Number of dimensions enumerated by the maximum-score grid.
pub const LIMIT_DIM: usize = 8;

/// Safety factor applied to the estimated maximum score.
pub const MAX_SCORE_ADJUST: f64 = 1.01;

impl Engine {
    /// Depth reached by a point descending one tree, including the
    /// expected-depth correction at leaves. When nearest-distance
    /// refinement is active the leaf's effective sample count shrinks or
    /// grows with the distance to the closest leaf sample.
    fn path_length(&self, forest: &Forest, tree: &Tree, x: &[f64]) -> f64 {
        let mut idx = match tree.root {
            Some(root) => root,
            None => return 0.0,
        };
        let mut height = 0usize;

        loop {
            let node = &tree.nodes[idx];
            if node.is_leaf() {
                if self.settings.nearest
                    && forest.avg_sample_dist > 0.0
                    && !node.leaf_samples.is_empty()
                {
                    let nearest = node
                        .leaf_samples
                        .iter()
                        .map(|&s| math::dist_squared(x, forest.samples[s].effective()))
                        .fold(f64::INFINITY, f64::min);
                    let rel = nearest.sqrt() / forest.avg_sample_dist + MIN_REL_DIST;
                    return height as f64
                        + self.depth.expected_depth(node.sample_count as f64 / rel);
                }
                return height as f64 + self.depth.expected_depth(node.sample_count as f64);
            }

            let next = if math::dot(x, &node.split) < node.pdotn {
                node.left
            } else {
                node.right
            };
            match next {
                Some(n) => {
                    idx = n;
                    height += 1;
                }
                None => return height as f64,
            }
        }
    }

    /// Raw anomaly score `2^(-avg_path / c)` for a point already expressed
    /// in the forest's effective (possibly scaled) space.
    pub fn raw_score(&self, forest: &Forest, x: &[f64]) -> f64 {
        if forest.trees.is_empty() || forest.c <= 0.0 {
            return 1.0;
        }
        let total: f64 = forest
            .trees
            .iter()
            .map(|t| self.path_length(forest, t, x))
            .sum();
        let avg_path = total / forest.trees.len() as f64;
        2f64.powf(-avg_path / forest.c)
    }

    /// Raw score mapped into `[0,1]` with the forest's cached score range.
    pub fn scaled_score(&self, forest: &Forest, x: &[f64]) -> f64 {
        let raw = self.raw_score(forest, x);
        math::scale_value(raw, 1.0, 0.0, forest.min_score, forest.max_score).clamp(0.0, 1.0)
    }

    /// Score a raw record vector against a forest: autoscale it into the
    /// forest's space, then apply the configured scoring mode.
    pub fn calculate_score(&self, forest: &Forest, point: &[f64]) -> f64 {
        let x = if self.settings.auto_scale {
            forest.scale_point(point)
        } else {
            point.to_vec()
        };
        match self.settings.score_mode {
            ScoreMode::Scaled => self.scaled_score(forest, &x),
            _ => self.raw_score(forest, &x),
        }
    }

    /// Raw score of a training sample.
    pub fn sample_score(&self, forest: &Forest, sample: &Sample) -> f64 {
        self.raw_score(forest, sample.effective())
    }

    /// Mode-aware score of a training sample.
    pub fn sample_score_scaled(&self, forest: &Forest, sample: &Sample) -> f64 {
        match self.settings.score_mode {
            ScoreMode::Scaled => self.scaled_score(forest, sample.effective()),
            _ => self.raw_score(forest, sample.effective()),
        }
    }

    /// The outlier threshold of a forest under the configured mode.
    pub fn forest_score(&self, forest: &Forest) -> f64 {
        if self.settings.score_mode == ScoreMode::Percentile {
            forest.percentage_score
        } else {
            self.settings.outlier_score
        }
    }

    /// Compute whichever scoring aid the configured mode needs, once per
    /// forest.
    pub fn ensure_forest_score(&mut self, idx: usize) {
        match self.settings.score_mode {
            ScoreMode::Scaled => self.ensure_score_range(idx),
            ScoreMode::Percentile => self.ensure_percentile(idx),
            ScoreMode::Raw => {}
        }
    }

    /// Cache the forest's score range for scaling. The minimum is the
    /// smallest raw sample score; the maximum comes from probing extreme
    /// coordinate combinations, bumped by a safety factor and capped at 1.
    pub fn ensure_score_range(&mut self, idx: usize) {
        {
            let f = &self.forests[idx];
            if f.filter || f.min_score < 1.0 {
                return;
            }
        }

        let min_score = {
            let f = &self.forests[idx];
            f.samples
                .iter()
                .map(|s| self.sample_score(f, s))
                .fold(1.0f64, f64::min)
        };
        let max_score = (self.max_score_grid(&self.forests[idx]) * MAX_SCORE_ADJUST).min(1.0);

        let f = &mut self.forests[idx];
        f.min_score = min_score;
        f.max_score = max_score;
        tracing::debug!(
            category = %f.category,
            min_score,
            max_score,
            "score range cached"
        );
    }

    /// Largest raw score over every combination of `{0, +MAX, -MAX}`
    /// across the first `LIMIT_DIM` dimensions, remaining dimensions fixed
    /// at `+MAX`. A pure function of the sample set and the trees.
    fn max_score_grid(&self, forest: &Forest) -> f64 {
        let dimensions = self.dims.dimensions;
        let lim = dimensions.min(LIMIT_DIM);
        let mut dim = vec![MAX_DIM_VALUE; dimensions];
        let mut max_score = 0.0f64;

        for i in 0..(1u32 << lim) {
            for j in 0..(1u32 << lim) {
                if i & j != 0 {
                    continue;
                }
                let mut b1 = i;
                let mut b2 = j;
                for k in 0..lim {
                    let state = ((b1 & 1) << 1) | (b2 & 1);
                    dim[k] = match state {
                        0 => 0.0,
                        1 => MAX_DIM_VALUE,
                        _ => -MAX_DIM_VALUE,
                    };
                    b1 >>= 1;
                    b2 >>= 1;
                }
                let score = self.raw_score(forest, &dim);
                if score > max_score {
                    max_score = score;
                }
            }
        }
        max_score
    }

    /// Cache the percentile threshold: the score at the configured rank of
    /// the ascending sample-score distribution.
    pub fn ensure_percentile(&mut self, idx: usize) {
        {
            let f = &self.forests[idx];
            if f.filter || f.percentage_score != 0.0 || f.samples.is_empty() {
                return;
            }
        }
        let mut scores: Vec<f64> = {
            let f = &self.forests[idx];
            f.samples.iter().map(|s| self.sample_score(f, s)).collect()
        };
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((scores.len() - 1) as f64 * self.settings.outlier_score / 100.0).ceil();
        self.forests[idx].percentage_score = scores[rank as usize];
    }

    /// Per-dimension attribution: for every dimension, substitute the
    /// record's coordinate into each cluster center and take the smallest
    /// resulting score. High values across all centers point at the
    /// dimension as the outlier driver.
    pub fn dimension_scores(&self, forest: &Forest, point: &[f64]) -> Vec<f64> {
        let dimensions = self.dims.dimensions;
        (0..dimensions)
            .map(|d| {
                let mut min = 1.0f64;
                for &center in &forest.cluster_centers {
                    let mut test = forest.samples[center].values.clone();
                    test[d] = point[d];
                    let score = self.calculate_score(forest, &test);
                    if score < min {
                        min = score;
                    }
                }
                min
            })
            .collect()
    }

    /// Combined score of the gated dimension subset, or `2.0` when no
    /// gate is configured so that the outlier check always passes.
    pub fn attribution_gate(&self, forest: &Forest, point: &[f64]) -> f64 {
        let mut min = 2.0f64;
        if self.dims.score_idx.is_empty() || self.settings.cluster_relative_size <= 0.0 {
            return min;
        }
        for &center in &forest.cluster_centers {
            let mut test = forest.samples[center].values.clone();
            for &d in &self.dims.score_idx {
                if d < test.len() {
                    test[d] = point[d];
                }
            }
            let score = self.calculate_score(forest, &test);
            if score < min {
                min = score;
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn trained_engine() -> Engine {
        let mut settings = Settings::default();
        settings.trees = 10;
        settings.samples_per_tree = 16;
        settings.seed = Some(1234);
        let mut engine = Engine::new(settings).unwrap();
        // 40 one-dimensional records cycling -1, 0, 1
        let rows: Vec<String> = (0..40).map(|i| format!("{}", (i % 3) as f64 - 1.0)).collect();
        let data = rows.join("\n");
        engine
            .train(Some(std::io::Cursor::new(data)), true, true)
            .unwrap();
        engine
    }

    #[test]
    fn test_inlier_scores_low_outlier_high() {
        let engine = trained_engine();
        let f = &engine.forests[0];

        let inlier = engine.raw_score(f, &f.scale_point(&[0.0]));
        let outlier = engine.raw_score(f, &f.scale_point(&[1000.0]));
        assert!(inlier < 0.5, "inlier score {} not below 0.5", inlier);
        assert!(outlier > 0.7, "outlier score {} not above 0.7", outlier);
        assert!(outlier - inlier > 0.25);
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let engine = trained_engine();
        let f = &engine.forests[0];
        for x in [-1000.0, -1.0, 0.0, 0.5, 1.0, 1000.0] {
            let s = engine.raw_score(f, &f.scale_point(&[x]));
            assert!(s > 0.0 && s <= 1.0, "raw score {} out of range", s);
        }
    }

    #[test]
    fn test_scaled_scores() {
        let mut engine = trained_engine();
        engine.ensure_score_range(0);
        let f = &engine.forests[0];
        assert!(f.min_score < 1.0);
        assert!(f.max_score <= 1.0 && f.max_score > f.min_score);

        let low = engine.calculate_score(f, &[0.0]);
        let high = engine.calculate_score(f, &[1000.0]);
        assert!(low < 0.2, "scaled inlier score {} not near zero", low);
        assert!(high > 0.7, "scaled outlier score {} not near one", high);
        assert!((0.0..=1.0).contains(&high));
    }

    #[test]
    fn test_score_range_is_lazy_and_stable() {
        let mut engine = trained_engine();
        engine.ensure_score_range(0);
        let min1 = engine.forests[0].min_score;
        let max1 = engine.forests[0].max_score;
        engine.ensure_score_range(0);
        assert_eq!(engine.forests[0].min_score, min1);
        assert_eq!(engine.forests[0].max_score, max1);
    }

    #[test]
    fn test_percentile_threshold() {
        let mut settings = Settings::default();
        settings.trees = 10;
        settings.samples_per_tree = 32;
        settings.seed = Some(99);
        settings.set_score("95%").unwrap();
        let mut engine = Engine::new(settings).unwrap();

        // deterministic pseudo-gaussian cloud in two dimensions
        let rows: Vec<String> = (0..100)
            .map(|i| {
                let a = (i as f64 * 0.7).sin() + (i as f64 * 1.3).sin() * 0.5;
                let b = (i as f64 * 0.9).cos() + (i as f64 * 1.7).cos() * 0.5;
                format!("{:.6},{:.6}", a, b)
            })
            .collect();
        let data = rows.join("\n");
        engine
            .train(Some(std::io::Cursor::new(data)), true, true)
            .unwrap();

        engine.ensure_percentile(0);
        let threshold = engine.forests[0].percentage_score;
        assert!(threshold > 0.0);

        let f = &engine.forests[0];
        let above = f
            .samples
            .iter()
            .filter(|s| engine.sample_score(f, s) > threshold)
            .count();
        // about 5% of 100 samples re-score above the 95% threshold
        assert!(above <= 8, "{} samples above threshold", above);
        assert!(above >= 1);
    }

    #[test]
    fn test_attribution_gate_defaults_open() {
        let engine = trained_engine();
        let f = &engine.forests[0];
        // no score dims configured: the gate must always pass
        assert_eq!(engine.attribution_gate(f, &[1000.0]), 2.0);
    }
}
