// # Cluster Center Discovery
//
// Locates up to `CLUSTER_MAX` sample cluster centers per forest. Centers
// anchor the per-dimension attribution scores: a record coordinate that
// scores high against every center is the dimension driving the outlier.

use crate::engine::Engine;
use crate::math;

/// Maximum number of cluster centers for a forest.
pub const CLUSTER_MAX: usize = 256;

/// Share of samples (lowest scores first) eligible as cluster candidates.
const CLUSTER_SAMPLE_DIV: f64 = 0.975;

impl Engine {
    /// Find the cluster centers of one forest.
    ///
    /// Candidates are the lowest-scoring samples. The lowest of all seeds
    /// the first cluster; every candidate within the relative cluster
    /// radius of the current center is absorbed, and the next uncovered
    /// candidate becomes a new center provided it keeps at least two radii
    /// of distance to every existing center. Clusters that end up with
    /// fewer than half the average coverage are dropped.
    pub fn find_cluster_centers(&mut self, idx: usize) {
        self.forests[idx].cluster_centers.clear();
        self.forests[idx].cluster_coverage = 0.0;

        let relative_size = self.settings.cluster_relative_size;
        if self.forests[idx].filter || relative_size <= 0.0 {
            return;
        }

        let count = self.forests[idx].samples.len();
        let candidates = (CLUSTER_SAMPLE_DIV * count as f64) as usize;
        if candidates == 0 {
            return;
        }

        // samples ordered by score, best (lowest) first
        let mut ordered: Vec<(usize, f64)> = {
            let f = &self.forests[idx];
            f.samples
                .iter()
                .enumerate()
                .map(|(i, s)| (i, self.sample_score(f, s)))
                .collect()
        };
        ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        // cluster geometry is measured in raw coordinates across the
        // candidate bounding box
        let (diameter_sq, radius) = {
            let f = &self.forests[idx];
            let dims = self.dims.dimensions;
            let mut min = f.samples[ordered[0].0].values.clone();
            let mut max = min.clone();
            for &(s, _) in ordered.iter().take(candidates).skip(1) {
                for d in 0..dims {
                    let v = f.samples[s].values[d];
                    if v < min[d] {
                        min[d] = v;
                    }
                    if v > max[d] {
                        max[d] = v;
                    }
                }
            }
            let diameter_sq = math::dist_squared(&max, &min);
            (diameter_sq, relative_size * diameter_sq.sqrt())
        };

        let same_cluster_dist = relative_size * relative_size * diameter_sq;
        let mut centers = vec![ordered[0].0];
        let mut done = vec![false; candidates];
        let mut counts = vec![0usize; CLUSTER_MAX];
        let mut covered = 0usize;
        let mut current = 0usize;
        done[0] = true;

        while centers.len() < CLUSTER_MAX {
            let mut next: Option<usize> = None;

            for i in 0..candidates {
                if done[i] {
                    continue;
                }
                let dist = {
                    let f = &self.forests[idx];
                    math::dist_squared(
                        &f.samples[ordered[current].0].values,
                        &f.samples[ordered[i].0].values,
                    )
                };
                if dist <= same_cluster_dist {
                    done[i] = true;
                    counts[centers.len() - 1] += 1;
                    covered += 1;
                    let center = *centers.last().unwrap();
                    self.forests[idx].samples[ordered[i].0].cluster = Some(center);
                } else if next.is_none() {
                    // candidate for a new center, unless it crowds an
                    // existing one
                    let f = &self.forests[idx];
                    let crowded = centers.iter().any(|&c| {
                        math::dist_squared(&f.samples[c].values, &f.samples[ordered[i].0].values)
                            < (2.0 * radius) * (2.0 * radius)
                    });
                    if !crowded {
                        next = Some(i);
                        done[i] = true;
                    }
                }
            }

            match next {
                Some(i) => {
                    current = i;
                    centers.push(ordered[i].0);
                }
                None => break,
            }
        }

        let coverage = covered as f64 / candidates as f64;

        // drop clusters whose coverage falls below half the per-cluster
        // average
        let min_count = if centers.is_empty() {
            0
        } else {
            (covered / centers.len()) / 2
        };
        let mut kept = Vec::with_capacity(centers.len());
        for (i, &center) in centers.iter().enumerate() {
            if counts[i] >= min_count {
                kept.push(center);
            }
        }

        let f = &mut self.forests[idx];
        f.cluster_centers = kept;
        f.cluster_radius = radius;
        f.cluster_coverage = coverage;

        tracing::debug!(
            category = %f.category,
            clusters = f.cluster_centers.len(),
            coverage = f.cluster_coverage,
            "cluster centers located"
        );
    }

    /// Make sure cluster centers exist for a forest before attribution
    /// scores are requested.
    pub fn ensure_clusters(&mut self, idx: usize) {
        if self.forests[idx].cluster_centers.is_empty() {
            self.find_cluster_centers(idx);
        }
    }
}
