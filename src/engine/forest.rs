// # Forest State
//
// One forest per category key: a bounded sample set, per-dimension
// statistics, the trained trees and the cached scoring aids derived from
// them. Samples are owned exclusively by their forest.

use crate::engine::tree::Tree;
use crate::math;

/// Minimum number of samples a forest needs to be scorable.
pub const SAMPLES_MIN: usize = 24;

/// One training sample: raw coordinates plus an optional autoscaled copy
/// and the cluster center it was assigned to.
#[derive(Debug, Clone)]
pub struct Sample {
    pub values: Vec<f64>,
    pub scaled: Option<Vec<f64>>,
    pub cluster: Option<usize>,
}

impl Sample {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            scaled: None,
            cluster: None,
        }
    }

    /// The coordinates used by split and distance calculations: the scaled
    /// copy when autoscaling produced one, the raw values otherwise.
    pub fn effective(&self) -> &[f64] {
        self.scaled.as_deref().unwrap_or(&self.values)
    }
}

#[derive(Debug)]
pub struct Forest {
    /// Category key this forest is responsible for.
    pub category: String,
    /// Excluded from training, analysis and categorization.
    pub filter: bool,
    pub samples: Vec<Sample>,
    /// Ring cursor over the sample array for per-tree slices.
    pub cursor: usize,
    /// Summary row used by aggregate-mode training.
    pub summary_idx: Option<usize>,
    /// Rows seen from the training stream, drives reservoir acceptance.
    pub trained_rows: usize,
    /// Rows seen after the sample array filled up.
    pub extra_rows: usize,
    /// Average path length constant for score normalization.
    pub c: f64,
    pub height_limit: usize,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub avg: Vec<f64>,
    /// Average per-dimension sample spacing, never zero.
    pub density: Vec<f64>,
    /// Estimated average nearest-sample distance in the sample hypercube.
    pub avg_sample_dist: f64,
    /// Dimension whose range anchors autoscaling, `None` when inactive.
    pub scale_range_idx: Option<usize>,
    pub trees: Vec<Tree>,
    /// Unix timestamp of the last training touch.
    pub last_updated: i64,
    /// Threshold cache for percentile mode, 0 = not yet computed.
    pub percentage_score: f64,
    /// Smallest raw sample score; 1.0 marks the range as not yet computed.
    pub min_score: f64,
    pub max_score: f64,
    pub test_average_score: f64,
    pub total_rows: usize,
    pub analyzed_rows: usize,
    pub high_analyzed_rows: usize,
    /// Saw at least one analyzed row.
    pub analyzed: bool,
    /// Aggregate-mode accumulator for analysis and categorization.
    pub summary: Option<Vec<f64>>,
    /// Sample indices acting as cluster centers.
    pub cluster_centers: Vec<usize>,
    pub cluster_radius: f64,
    pub cluster_coverage: f64,
}

impl Forest {
    pub fn new(category: String, now: i64) -> Self {
        Self {
            category,
            filter: false,
            samples: Vec::new(),
            cursor: 0,
            summary_idx: None,
            trained_rows: 0,
            extra_rows: 0,
            c: 0.0,
            height_limit: 0,
            min: Vec::new(),
            max: Vec::new(),
            avg: Vec::new(),
            density: Vec::new(),
            avg_sample_dist: 0.0,
            scale_range_idx: None,
            trees: Vec::new(),
            last_updated: now,
            percentage_score: 0.0,
            min_score: 1.0,
            max_score: 0.0,
            test_average_score: 0.0,
            total_rows: 0,
            analyzed_rows: 0,
            high_analyzed_rows: 0,
            analyzed: false,
            summary: None,
            cluster_centers: Vec::new(),
            cluster_radius: 0.0,
            cluster_coverage: 0.0,
        }
    }

    /// Map a raw point into the autoscaled space of this forest. Returns
    /// the point unchanged when autoscaling is inactive.
    pub fn scale_point(&self, point: &[f64]) -> Vec<f64> {
        match self.scale_range_idx {
            Some(ref_idx) if !self.min.is_empty() => {
                let range = self.max[ref_idx] - self.min[ref_idx];
                let scale_min = self.min[ref_idx];
                point
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| math::scale_value(v, range, scale_min, self.min[i], self.max[i]))
                    .collect()
            }
            _ => point.to_vec(),
        }
    }

    /// Refresh the scaled copy of every sample, or drop the copies when
    /// autoscaling is inactive.
    pub fn apply_autoscale(&mut self) {
        let Some(ref_idx) = self.scale_range_idx else {
            for sample in &mut self.samples {
                sample.scaled = None;
            }
            return;
        };
        let range = self.max[ref_idx] - self.min[ref_idx];
        let scale_min = self.min[ref_idx];
        let min = self.min.clone();
        let max = self.max.clone();
        for sample in &mut self.samples {
            sample.scaled = Some(
                sample
                    .values
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| math::scale_value(v, range, scale_min, min[i], max[i]))
                    .collect(),
            );
        }
    }

    /// Recompute per-dimension min, max and average from the current
    /// sample set.
    pub fn recompute_stats(&mut self, dimensions: usize) {
        if self.samples.is_empty() {
            return;
        }
        self.min = self.samples[0].values.clone();
        self.max = self.samples[0].values.clone();
        let mut sums = self.samples[0].values.clone();

        for sample in &self.samples[1..] {
            for d in 0..dimensions {
                let v = sample.values[d];
                if v < self.min[d] {
                    self.min[d] = v;
                }
                if v > self.max[d] {
                    self.max[d] = v;
                }
                sums[d] += v;
            }
        }

        let count = self.samples.len() as f64;
        self.avg = sums.into_iter().map(|s| s / count).collect();

        self.density = (0..dimensions)
            .map(|d| {
                let spread = (self.max[d] - self.min[d]) / count;
                if spread == 0.0 {
                    1.0 / count
                } else {
                    spread
                }
            })
            .collect();
    }

    /// Drop all samples and every structure derived from them.
    pub fn reset_samples(&mut self) {
        self.samples.clear();
        self.cursor = 0;
        self.summary_idx = None;
        self.trained_rows = 0;
        self.extra_rows = 0;
        self.trees.clear();
        self.cluster_centers.clear();
        self.min_score = 1.0;
        self.max_score = 0.0;
        self.percentage_score = 0.0;
    }
}
