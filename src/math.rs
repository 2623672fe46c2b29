// # Numeric Primitives
//
// Vector arithmetic, value scaling and the two precomputed caches the
// forest engine draws from: a pool of standard-normal values and a table of
// expected binary-search-tree depths.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Number of cached standard-normal values.
pub const NORMAL_POOL: usize = 32771;

/// Number of cached expected-depth values.
pub const DEPTH_CACHE: usize = 2048;

/// Euler-Mascheroni constant used by the expected-depth formula.
const EULER_GAMMA: f64 = 0.5772156649;

/// Dot product over equally sized slices.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Squared euclidean distance between two points.
pub fn dist_squared(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Euclidean distance between two points.
pub fn dist(a: &[f64], b: &[f64]) -> f64 {
    dist_squared(a, b).sqrt()
}

/// Scale `value` from the `min..max` range into a range of width `range`
/// starting at `scale_min`. A degenerate source range returns the value
/// unchanged.
pub fn scale_value(value: f64, range: f64, scale_min: f64, min: f64, max: f64) -> f64 {
    if max == min {
        return value;
    }
    range * (value - min) / (max - min) + scale_min
}

/// Expected depth of an unsuccessful search in a binary search tree over
/// `n` keys. Zero for fewer than two keys, exactly one for two.
fn harmonic_depth(n: usize) -> f64 {
    if n < 2 {
        return 0.0;
    }
    if n == 2 {
        return 1.0;
    }
    2.0 * (((n - 1) as f64).ln() + EULER_GAMMA) - 2.0 * (n - 1) as f64 / n as f64
}

/// Cache of expected tree depths, indexed by sample count.
pub struct DepthCache {
    table: Vec<f64>,
}

impl DepthCache {
    pub fn new() -> Self {
        Self {
            table: (0..DEPTH_CACHE).map(harmonic_depth).collect(),
        }
    }

    /// Expected depth for a (possibly distance-adjusted) sample count.
    /// Fractional counts are truncated, matching the integer formula.
    pub fn expected_depth(&self, n: f64) -> f64 {
        if !n.is_finite() || n < 0.0 {
            return 0.0;
        }
        let n = n as usize;
        if n < DEPTH_CACHE {
            self.table[n]
        } else {
            harmonic_depth(n)
        }
    }
}

impl Default for DepthCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Seedable random source with a cycled pool of standard-normal values.
///
/// Split vectors must draw from the pool rather than sampling fresh values
/// so that a single seed reproduces a whole training run.
pub struct RandomPool {
    rng: StdRng,
    normals: Vec<f64>,
    cursor: usize,
}

impl RandomPool {
    pub fn seeded(seed: u64) -> Self {
        Self::init(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::init(StdRng::from_os_rng())
    }

    fn init(mut rng: StdRng) -> Self {
        let normals = (0..NORMAL_POOL)
            .map(|_| rng.sample(StandardNormal))
            .collect();
        Self {
            rng,
            normals,
            cursor: 0,
        }
    }

    /// Next standard-normal value from the pool.
    pub fn normal(&mut self) -> f64 {
        let v = self.normals[self.cursor];
        self.cursor += 1;
        if self.cursor == NORMAL_POOL {
            self.cursor = 0;
        }
        v
    }

    /// A vector of `dims` pooled standard-normal coordinates.
    pub fn normal_vector(&mut self, dims: usize) -> Vec<f64> {
        (0..dims).map(|_| self.normal()).collect()
    }

    /// Uniform integer in `0..n`.
    pub fn below(&mut self, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        self.rng.random_range(0..n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_depth_anchors() {
        let cache = DepthCache::new();
        assert_eq!(cache.expected_depth(0.0), 0.0);
        assert_eq!(cache.expected_depth(1.0), 0.0);
        assert_eq!(cache.expected_depth(2.0), 1.0);
    }

    #[test]
    fn test_expected_depth_increasing() {
        let cache = DepthCache::new();
        let mut prev = cache.expected_depth(2.0);
        for n in 3..5000 {
            let d = cache.expected_depth(n as f64);
            assert!(d > prev, "depth not increasing at n={}", n);
            prev = d;
        }
    }

    #[test]
    fn test_expected_depth_beyond_cache() {
        let cache = DepthCache::new();
        // values past the cache boundary come from the formula directly
        let below = cache.expected_depth((DEPTH_CACHE - 1) as f64);
        let above = cache.expected_depth(DEPTH_CACHE as f64);
        assert!(above > below);
    }

    #[test]
    fn test_dot_and_distance() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        assert_eq!(dot(&a, &b), 32.0);
        assert_eq!(dist_squared(&a, &a), 0.0);
        assert_eq!(dist_squared(&a, &b), 27.0);
        assert!((dist(&a, &b) - 27.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_scale_value() {
        // map 5 from 0..10 onto 100..200
        assert_eq!(scale_value(5.0, 100.0, 100.0, 0.0, 10.0), 150.0);
        // degenerate source range passes through
        assert_eq!(scale_value(7.0, 100.0, 0.0, 3.0, 3.0), 7.0);
    }

    #[test]
    fn test_normal_pool_cycles_and_reproduces() {
        let mut a = RandomPool::seeded(42);
        let mut b = RandomPool::seeded(42);
        for _ in 0..(NORMAL_POOL + 10) {
            assert_eq!(a.normal(), b.normal());
        }
        // pool wraps around to the first value
        let mut c = RandomPool::seeded(7);
        let first = c.normal();
        for _ in 0..(NORMAL_POOL - 1) {
            c.normal();
        }
        assert_eq!(c.normal(), first);
    }

    #[test]
    fn test_below_bounds() {
        let mut pool = RandomPool::seeded(1);
        for _ in 0..1000 {
            assert!(pool.below(10) < 10);
        }
        assert_eq!(pool.below(0), 0);
        assert_eq!(pool.below(1), 0);
    }
}
