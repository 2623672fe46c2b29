// # Tree Construction
//
// Recursive binary-space partitioning with oriented random hyperplanes.
// Nodes live in an arena vector addressed by index; child links use
// `Option<usize>` and trees never share nodes. Once built, a tree is
// read-only.

use crate::engine::forest::Forest;
use crate::math::{self, RandomPool};

/// Nodes with fewer samples are not split further.
pub const NODE_MIN_SAMPLE: usize = 3;

/// Depth ratio above which the split point is a jittered random sample;
/// below it the centroid of the reaching samples is used.
pub const CENTROID_THRESHOLD: f64 = 0.45;

#[derive(Debug)]
pub struct Node {
    /// Number of samples that reached this node during the build.
    pub sample_count: usize,
    /// Split normal with one standard-normal coordinate per dimension.
    pub split: Vec<f64>,
    /// Precomputed `dot(p, n)` of the split point and the normal.
    pub pdotn: f64,
    pub left: Option<usize>,
    pub right: Option<usize>,
    /// Sample indices stored at leaves for nearest-distance refinement.
    pub leaf_samples: Vec<usize>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Tree {
    pub nodes: Vec<Node>,
    pub root: Option<usize>,
    /// Samples fed into this tree's build.
    pub sample_count: usize,
}

/// Build parameters shared by every node of one tree.
pub(crate) struct TreeBuilder<'a> {
    pub forest: &'a Forest,
    pub dimensions: usize,
    pub height_limit: usize,
    pub auto_scale: bool,
    /// Store leaf sample lists for nearest-distance refinement.
    pub keep_leaf_samples: bool,
}

impl<'a> TreeBuilder<'a> {
    pub fn build(&self, sample_idx: &[usize], rng: &mut RandomPool) -> Tree {
        let mut tree = Tree {
            nodes: Vec::new(),
            root: None,
            sample_count: sample_idx.len(),
        };
        tree.root = self.add_node(&mut tree, sample_idx, 0, rng);
        tree
    }

    fn add_node(
        &self,
        tree: &mut Tree,
        sample_idx: &[usize],
        height: usize,
        rng: &mut RandomPool,
    ) -> Option<usize> {
        if height >= self.height_limit || sample_idx.len() < NODE_MIN_SAMPLE {
            return None;
        }

        let split = rng.normal_vector(self.dimensions);
        let p = self.split_point(sample_idx, height, rng);
        let p = if self.auto_scale {
            self.forest.scale_point(&p)
        } else {
            p
        };
        let pdotn = math::dot(&p, &split);

        let mut left_samples = Vec::new();
        let mut right_samples = Vec::new();
        for &s in sample_idx {
            if math::dot(self.forest.samples[s].effective(), &split) < pdotn {
                left_samples.push(s);
            } else {
                right_samples.push(s);
            }
        }

        let node_index = tree.nodes.len();
        tree.nodes.push(Node {
            sample_count: sample_idx.len(),
            split,
            pdotn,
            left: None,
            right: None,
            leaf_samples: Vec::new(),
        });

        let left = if left_samples.len() > 1 {
            self.add_node(tree, &left_samples, height + 1, rng)
        } else {
            None
        };
        let right = if right_samples.len() > 1 {
            self.add_node(tree, &right_samples, height + 1, rng)
        } else {
            None
        };

        let node = &mut tree.nodes[node_index];
        node.left = left;
        node.right = right;
        if node.is_leaf() && self.keep_leaf_samples {
            node.leaf_samples = sample_idx.to_vec();
        }

        Some(node_index)
    }

    /// Choose the split point for a node at the given height.
    ///
    /// In the upper part of the tree a uniformly random reaching sample is
    /// jittered by a fresh normal vector scaled with the dimension ranges
    /// and the remaining depth; deeper down the centroid of every other
    /// reaching sample is used.
    fn split_point(&self, sample_idx: &[usize], height: usize, rng: &mut RandomPool) -> Vec<f64> {
        let height_ratio = 1.0 - height as f64 / self.height_limit as f64;

        if height_ratio >= CENTROID_THRESHOLD {
            let pick = sample_idx[rng.below(sample_idx.len())];
            let jitter = rng.normal_vector(self.dimensions);
            let mut p = self.forest.samples[pick].values.clone();
            for d in 0..self.dimensions {
                let spread = self.forest.max[d] - self.forest.min[d];
                let half = if spread > 0.0 { spread / 2.0 } else { 0.5 };
                p[d] += jitter[d] * height_ratio * half;
            }
            p
        } else {
            let mut p = vec![0.0; self.dimensions];
            let mut used = 0usize;
            for (pos, &s) in sample_idx.iter().enumerate() {
                if pos % 2 == 0 {
                    for d in 0..self.dimensions {
                        p[d] += self.forest.samples[s].values[d];
                    }
                    used += 1;
                }
            }
            if used > 0 {
                for v in &mut p {
                    *v /= used as f64;
                }
            }
            p
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::forest::Sample;

    fn forest_with_samples(rows: Vec<Vec<f64>>) -> Forest {
        let dims = rows[0].len();
        let mut f = Forest::new("t".to_string(), 0);
        for row in rows {
            f.samples.push(Sample::new(row));
        }
        f.recompute_stats(dims);
        f
    }

    fn build(f: &Forest, keep_leaves: bool, seed: u64) -> Tree {
        let idx: Vec<usize> = (0..f.samples.len()).collect();
        let height_limit = (idx.len() as f64).log2().ceil() as usize + 1;
        let builder = TreeBuilder {
            forest: f,
            dimensions: f.samples[0].values.len(),
            height_limit,
            auto_scale: false,
            keep_leaf_samples: keep_leaves,
        };
        builder.build(&idx, &mut RandomPool::seeded(seed))
    }

    #[test]
    fn test_tree_has_root_and_consistent_counts() {
        let rows: Vec<Vec<f64>> = (0..32).map(|i| vec![i as f64, (i % 7) as f64]).collect();
        let f = forest_with_samples(rows);
        let tree = build(&f, false, 3);

        let root = tree.root.expect("root node");
        assert_eq!(tree.nodes[root].sample_count, 32);

        // every non-leaf has at least one child and child counts never
        // exceed the parent count
        for node in &tree.nodes {
            if let Some(l) = node.left {
                assert!(tree.nodes[l].sample_count <= node.sample_count);
            }
            if let Some(r) = node.right {
                assert!(tree.nodes[r].sample_count <= node.sample_count);
            }
            if !node.is_leaf() {
                assert!(node.sample_count >= NODE_MIN_SAMPLE);
            }
        }
    }

    #[test]
    fn test_leaf_samples_partition_tree_samples() {
        let rows: Vec<Vec<f64>> = (0..64)
            .map(|i| vec![(i as f64).sin() * 10.0, (i as f64).cos() * 10.0])
            .collect();
        let f = forest_with_samples(rows);
        let tree = build(&f, true, 11);

        // walk the tree: samples stored at leaves must cover exactly the
        // samples that reached them
        fn leaf_total(tree: &Tree, idx: usize) -> usize {
            let node = &tree.nodes[idx];
            if node.is_leaf() {
                return node.leaf_samples.len();
            }
            let mut sum = 0;
            if let Some(l) = node.left {
                sum += leaf_total(tree, l);
            }
            if let Some(r) = node.right {
                sum += leaf_total(tree, r);
            }
            // a one-sided node loses the short side's samples at routing
            sum
        }
        let root = tree.root.unwrap();
        assert!(leaf_total(&tree, root) <= tree.nodes[root].sample_count);
        for node in &tree.nodes {
            if node.is_leaf() {
                assert_eq!(node.leaf_samples.len(), node.sample_count);
            } else {
                assert!(node.leaf_samples.is_empty());
            }
        }
    }

    #[test]
    fn test_routing_matches_pdotn() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, -(i as f64)]).collect();
        let f = forest_with_samples(rows);
        let tree = build(&f, true, 5);

        // re-route every sample from the root and confirm it lands on a
        // leaf whose stored set contains it
        for s in 0..f.samples.len() {
            let x = f.samples[s].effective();
            let mut idx = tree.root.unwrap();
            loop {
                let node = &tree.nodes[idx];
                if node.is_leaf() {
                    assert!(node.leaf_samples.contains(&s));
                    break;
                }
                let next = if crate::math::dot(x, &node.split) < node.pdotn {
                    node.left
                } else {
                    node.right
                };
                match next {
                    Some(n) => idx = n,
                    None => break, // sample isolated before a stored leaf
                }
            }
        }
    }

    #[test]
    fn test_build_is_deterministic_per_seed() {
        let rows: Vec<Vec<f64>> = (0..48).map(|i| vec![i as f64 * 0.5, i as f64 * 2.0]).collect();
        let f = forest_with_samples(rows);
        let a = build(&f, false, 99);
        let b = build(&f, false, 99);
        assert_eq!(a.nodes.len(), b.nodes.len());
        for (x, y) in a.nodes.iter().zip(b.nodes.iter()) {
            assert_eq!(x.pdotn, y.pdotn);
            assert_eq!(x.sample_count, y.sample_count);
        }
    }
}
