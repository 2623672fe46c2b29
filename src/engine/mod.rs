// # Forest Engine
//
// The engine owns all process state: the per-category forests, the hashed
// category index, the configuration record, the random source and the
// depth cache. Forests are created in first-seen order and that order is
// stable across persistence.

use crate::config::Settings;
use crate::error::Result;
use crate::expr::FormulaSet;
use crate::input::{self, DIM_MAX};
use crate::math::{DepthCache, RandomPool};
use regex::Regex;
use std::io::BufRead;

pub mod cluster;
pub mod forest;
pub mod ingest;
pub mod score;
pub mod tree;

pub use forest::{Forest, Sample, SAMPLES_MIN};
pub use tree::{Node, Tree};

use tree::TreeBuilder;

/// Number of buckets in the category hash index.
pub const HASH_MAX: usize = 32771;

/// Maximum number of category filter expressions.
pub const FILTER_MAX: usize = 100;

/// DJB2 string hash, also used to map text attributes to numeric values.
pub fn djb2_hash(s: &str) -> u64 {
    let mut h: u64 = 5381;
    for b in s.bytes() {
        h = h.wrapping_mul(33).wrapping_add(b as u64);
    }
    h
}

fn bucket_of(key: &str) -> usize {
    (djb2_hash(key) % HASH_MAX as u64) as usize
}

/// Mapping from input record fields to analyzed dimensions and the special
/// column roles (category, label, text, attribution).
#[derive(Debug, Default)]
pub struct DimMap {
    /// Input field index of each analyzed dimension.
    pub dim_idx: Vec<usize>,
    /// Input field indices forming the category key.
    pub category_idx: Vec<usize>,
    /// Input field indices forming the label string.
    pub label_idx: Vec<usize>,
    /// Input field indices holding text values, hashed to numbers.
    pub text_idx: Vec<usize>,
    /// Dimension indices gated by the attribution score check.
    pub score_idx: Vec<usize>,
    pub ignore_idx: Vec<usize>,
    pub include_idx: Vec<usize>,
    /// Number of analyzed dimensions, fixed once training begins.
    pub dimensions: usize,
}

impl DimMap {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            dim_idx: Vec::new(),
            category_idx: input::parse_dim_list(&settings.category_dims)?,
            label_idx: input::parse_dim_list(&settings.label_dims)?,
            text_idx: input::parse_dim_list(&settings.text_dims)?,
            score_idx: input::parse_dim_list(&settings.score_dims)?,
            ignore_idx: input::parse_dim_list(&settings.ignore_dims)?,
            include_idx: input::parse_dim_list(&settings.include_dims)?,
            dimensions: 0,
        })
    }

    /// Populate the dimension table from the first record of a stream.
    /// Category and label fields never become dimensions; ignored fields
    /// are skipped unless explicitly included. The dimension count locks
    /// on first use and later streams only refresh the field mapping.
    pub fn init_from_record(&mut self, value_count: usize) {
        self.dim_idx.clear();
        for i in 0..value_count {
            let ignored = self.ignore_idx.contains(&i) && !self.include_idx.contains(&i);
            if !ignored
                && !self.category_idx.contains(&i)
                && !self.label_idx.contains(&i)
                && self.dim_idx.len() < DIM_MAX
            {
                self.dim_idx.push(i);
            }
        }
        if self.dimensions == 0 {
            self.dimensions = self.dim_idx.len();
        }
    }

    pub fn is_text_field(&self, field_idx: usize) -> bool {
        self.text_idx.contains(&field_idx)
    }

    /// Build the category key for a record: selected column values joined
    /// by the category separator.
    pub fn category_key(&self, values: &[String], separator: u8) -> String {
        let parts: Vec<&str> = self
            .category_idx
            .iter()
            .filter(|&&i| i < values.len())
            .map(|&i| values[i].as_str())
            .collect();
        parts.join(&(separator as char).to_string())
    }

    /// Build the label string for a record.
    pub fn label_key(&self, values: &[String], separator: u8) -> String {
        let parts: Vec<&str> = self
            .label_idx
            .iter()
            .filter(|&&i| i < values.len())
            .map(|&i| values[i].as_str())
            .collect();
        parts.join(&(separator as char).to_string())
    }

    /// Convert record fields into a dimension vector. In saved mode the
    /// fields map one-to-one onto dimensions; otherwise `dim_idx` selects
    /// and text fields hash. Missing fields pad with zero.
    pub fn parse_values(&self, values: &[String], saved: bool) -> Vec<f64> {
        (0..self.dimensions)
            .map(|d| {
                let src = if saved {
                    d
                } else {
                    match self.dim_idx.get(d) {
                        Some(&i) => i,
                        None => return 0.0,
                    }
                };
                if src >= values.len() {
                    return 0.0;
                }
                if !saved && self.is_text_field(src) {
                    (djb2_hash(&values[src]) % HASH_MAX as u64) as f64
                } else {
                    parse_attribute(&values[src])
                }
            })
            .collect()
    }
}

/// Lenient numeric field parse: the longest leading float prefix counts,
/// anything else is zero.
pub fn parse_attribute(s: &str) -> f64 {
    let s = s.trim_start();
    if let Ok(v) = s.parse::<f64>() {
        return v;
    }
    let mut end = 0;
    let bytes = s.as_bytes();
    let mut seen_dot = false;
    let mut seen_digit = false;
    while end < bytes.len() {
        match bytes[end] {
            b'+' | b'-' if end == 0 => {}
            b'.' if !seen_dot => seen_dot = true,
            b'0'..=b'9' => seen_digit = true,
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return 0.0;
    }
    s[..end].parse().unwrap_or(0.0)
}

pub struct Engine {
    pub settings: Settings,
    pub dims: DimMap,
    pub forests: Vec<Forest>,
    pub formulas: FormulaSet,
    buckets: Vec<Vec<usize>>,
    pub(crate) rng: RandomPool,
    pub(crate) depth: DepthCache,
    /// Timestamp stamped onto forests touched by the current run.
    now: i64,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        let dims = DimMap::from_settings(&settings)?;
        let rng = match settings.seed {
            Some(seed) => RandomPool::seeded(seed),
            None => RandomPool::from_entropy(),
        };
        let ignore_errors = settings.ignore_expression_errors;
        let mut formulas = FormulaSet::default();
        formulas.ignore_errors = ignore_errors;
        Ok(Self {
            settings,
            dims,
            forests: Vec::new(),
            formulas,
            buckets: vec![Vec::new(); HASH_MAX],
            rng,
            depth: DepthCache::new(),
            now: chrono::Utc::now().timestamp(),
        })
    }

    /// Rebuild the dimension mapping after settings changed, keeping a
    /// dimension count that is already locked.
    pub fn rebuild_dims(&mut self) -> Result<()> {
        let locked = self.dims.dimensions;
        self.dims = DimMap::from_settings(&self.settings)?;
        self.dims.dimensions = locked;
        self.formulas.ignore_errors = self.settings.ignore_expression_errors;
        Ok(())
    }

    /// Replace the random source, used when a seed arrives via options.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = RandomPool::seeded(seed);
    }

    pub fn has_forests(&self) -> bool {
        !self.forests.is_empty()
    }

    /// Look up a forest by category key.
    pub fn find_forest(&self, key: &str) -> Option<usize> {
        self.buckets[bucket_of(key)]
            .iter()
            .copied()
            .find(|&i| self.forests[i].category == key)
    }

    /// Look up a forest, allocating a new one on first observation of the
    /// key. Existing forests get their update stamp touched.
    pub fn select_forest(&mut self, key: &str) -> usize {
        if let Some(i) = self.find_forest(key) {
            if self.forests[i].last_updated != self.now {
                self.forests[i].last_updated = self.now;
            }
            return i;
        }
        self.insert_forest(Forest::new(key.to_string(), self.now))
    }

    /// Append a forest and index it, preserving creation order.
    pub fn insert_forest(&mut self, forest: Forest) -> usize {
        let idx = self.forests.len();
        self.buckets[bucket_of(&forest.category)].push(idx);
        self.forests.push(forest);
        idx
    }

    /// Mark forests filtered by the configured regular expressions. A
    /// `-v ` prefix inverts the match.
    pub fn apply_filters(&mut self) -> Result<()> {
        for filter in self.settings.filters.iter().take(FILTER_MAX) {
            let (pattern, invert) = match filter.strip_prefix("-v ") {
                Some(rest) => (rest, true),
                None => (filter.as_str(), false),
            };
            let re = Regex::new(pattern)?;
            for forest in &mut self.forests {
                if forest.category.is_empty() {
                    continue;
                }
                if re.is_match(&forest.category) != invert {
                    forest.filter = true;
                }
            }
        }
        Ok(())
    }

    /// Feed a training stream into the engine. With `input == None` the
    /// samples already in memory (for example from a loaded snapshot) are
    /// used as-is. Filters always apply; trees and forest constants are
    /// only rebuilt when both `fresh` and `build_trees` are set.
    pub fn train<R: BufRead>(
        &mut self,
        input: Option<R>,
        fresh: bool,
        build_trees: bool,
    ) -> Result<()> {
        self.now = chrono::Utc::now().timestamp();

        if let Some(reader) = input {
            let mut lines = 0usize;
            let mut first = true;
            for line in reader.lines() {
                let line = line?;
                lines += 1;
                if self.settings.header && lines == 1 {
                    continue;
                }
                let mut values = input::split_record(&line, self.settings.input_separator);
                if values.is_empty() {
                    continue;
                }
                self.formulas.rewrite(&mut values)?;
                if first {
                    self.dims.init_from_record(values.len());
                    first = false;
                }
                let key = self
                    .dims
                    .category_key(&values, self.settings.category_separator);
                let idx = self.select_forest(&key);
                if self.settings.aggregate {
                    self.add_aggregate_fields(idx, &values);
                } else {
                    self.add_sample_fields(idx, &values);
                }
            }
        }

        self.apply_filters()?;

        if fresh && build_trees {
            for idx in 0..self.forests.len() {
                self.train_one_forest(idx);
            }
        }
        Ok(())
    }

    /// Train a single forest from its collected samples: statistics,
    /// autoscaling, the tree set and the derived forest constants.
    pub fn train_one_forest(&mut self, idx: usize) {
        let dimensions = self.dims.dimensions;
        let trees = self.settings.trees;
        let samples_per_tree = self.settings.samples_per_tree;
        let auto_scale = self.settings.auto_scale;
        let keep_leaf_samples = self.settings.nearest;

        let count = self.forests[idx].samples.len();
        if trees == 0 || count < SAMPLES_MIN {
            self.forests[idx].filter = true;
        }
        if count == 0 {
            return;
        }

        {
            let f = &mut self.forests[idx];
            f.recompute_stats(dimensions);
        }
        if self.forests[idx].filter {
            return;
        }

        {
            let f = &mut self.forests[idx];
            f.scale_range_idx = if auto_scale {
                find_scale_range(&f.min, &f.max)
            } else {
                None
            };
            f.apply_autoscale();
            f.avg_sample_dist = estimate_sample_distance(f, dimensions);
            f.trees.clear();
            f.min_score = 1.0;
            f.max_score = 0.0;
            f.percentage_score = 0.0;
        }

        tracing::debug!(
            category = %self.forests[idx].category,
            samples = count,
            "training forest"
        );

        // each tree takes a rotating slice of the sample ring, starting at
        // a random point
        let cursor = self.rng.below(count);
        self.forests[idx].cursor = cursor;

        let mut total_samples = 0usize;
        let mut built = Vec::with_capacity(trees);
        for _ in 0..trees {
            let n = count.min(samples_per_tree);
            let mut slice = Vec::with_capacity(n);
            {
                let f = &mut self.forests[idx];
                for _ in 0..n {
                    slice.push(f.cursor);
                    f.cursor += 1;
                    if f.cursor == count {
                        f.cursor = 0;
                    }
                }
            }
            total_samples += n;

            let height_limit = (n as f64).log2().ceil() as usize + 1;
            let forest = &self.forests[idx];
            let builder = TreeBuilder {
                forest,
                dimensions,
                height_limit,
                auto_scale,
                keep_leaf_samples: keep_leaf_samples && forest.avg_sample_dist > 0.0,
            };
            built.push(builder.build(&slice, &mut self.rng));
        }

        let per_tree = total_samples / trees;
        let f = &mut self.forests[idx];
        f.trees = built;
        f.c = self.depth.expected_depth(per_tree as f64);
        f.height_limit = (per_tree as f64).log2().ceil() as usize + 2;
    }

    /// Drop every sample of the forest with the given category key.
    pub fn remove_samples(&mut self, key: &str) -> Result<()> {
        match self.find_forest(key) {
            Some(idx) => {
                self.forests[idx].reset_samples();
                Ok(())
            }
            None => Err(crate::error::GroveError::NotFound(format!(
                "no forest having string: {}",
                key
            ))),
        }
    }

    /// Remove the highest-scoring sample from every scorable forest.
    /// Forests at the minimum sample count are left alone.
    pub fn remove_outlier(&mut self) {
        for idx in 0..self.forests.len() {
            let f = &self.forests[idx];
            if f.filter || f.samples.len() <= SAMPLES_MIN {
                continue;
            }
            let mut outlier: Option<(usize, f64)> = None;
            for (i, sample) in f.samples.iter().enumerate() {
                let score = self.raw_score(f, sample.effective());
                if outlier.map_or(true, |(_, best)| score > best) {
                    outlier = Some((i, score));
                }
            }
            if let Some((i, _)) = outlier {
                self.forests[idx].samples.remove(i);
            }
        }
    }
}

/// Dimension index with the widest value range, `None` when every
/// dimension is constant.
fn find_scale_range(min: &[f64], max: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut best_range = 0.0;
    for i in 0..min.len() {
        let range = max[i] - min[i];
        if range > best_range {
            best_range = range;
            best = Some(i);
        }
    }
    best
}

/// Analytic estimate of the average nearest-sample distance inside the
/// sample hypercube. Under autoscaling the cube side is the reference
/// dimension's range.
fn estimate_sample_distance(forest: &Forest, dimensions: usize) -> f64 {
    let n = forest.samples.len();
    if n == 0 || dimensions == 0 {
        return 0.0;
    }
    let d = dimensions as f64;
    let factor = (d / 1.5 + 1.0 / (2.4 * d) - 1.0 / 12.0).sqrt();

    let volume = match forest.scale_range_idx {
        Some(ref_idx) => {
            let side = forest.max[ref_idx] - forest.min[ref_idx];
            side.powi(dimensions as i32)
        }
        None => (0..dimensions)
            .map(|i| {
                let range = forest.max[i] - forest.min[i];
                if range > 0.0 {
                    range
                } else {
                    1.0
                }
            })
            .product(),
    };

    factor * (volume / n as f64).powf(1.0 / d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn engine_with(settings: Settings) -> Engine {
        let mut settings = settings;
        settings.seed = Some(4242);
        Engine::new(settings).unwrap()
    }

    fn feed(engine: &mut Engine, rows: &[&str]) {
        let data = rows.join("\n");
        engine
            .train(Some(std::io::Cursor::new(data)), true, true)
            .unwrap();
    }

    #[test]
    fn test_category_routing_creates_forests_in_seen_order() {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        settings.trees = 10;
        settings.samples_per_tree = 16;
        let mut engine = engine_with(settings);

        let mut rows = Vec::new();
        for i in 0..30 {
            rows.push(format!("b,{},{}", i, i * 2));
            rows.push(format!("a,{},{}", i, i * 2));
        }
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);

        assert_eq!(engine.forests.len(), 2);
        assert_eq!(engine.forests[0].category, "b");
        assert_eq!(engine.forests[1].category, "a");
        assert_eq!(engine.find_forest("a"), Some(1));
        assert_eq!(engine.find_forest("missing"), None);
    }

    #[test]
    fn test_small_forest_is_filtered() {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        let mut engine = engine_with(settings);
        let rows: Vec<String> = (0..5).map(|i| format!("x,{}", i)).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);

        assert!(engine.forests[0].filter);
        assert!(engine.forests[0].trees.is_empty());
    }

    #[test]
    fn test_trained_forest_constants() {
        let mut settings = Settings::default();
        settings.trees = 10;
        settings.samples_per_tree = 16;
        let mut engine = engine_with(settings);
        let rows: Vec<String> = (0..40).map(|i| format!("{},{}", i % 7, i % 5)).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);

        let f = &engine.forests[0];
        assert!(!f.filter);
        assert_eq!(f.trees.len(), 10);
        assert_eq!(f.samples.len(), 40);
        // 16 samples per tree: height limit log2(16)+2, c = c(16)
        assert_eq!(f.height_limit, 6);
        assert!(f.c > 0.0);
        assert!(f.avg_sample_dist > 0.0);
        for d in 0..engine.dims.dimensions {
            assert!(f.min[d] <= f.avg[d] && f.avg[d] <= f.max[d]);
        }
    }

    #[test]
    fn test_retrain_is_idempotent() {
        let mut settings = Settings::default();
        settings.trees = 10;
        settings.samples_per_tree = 16;
        settings.auto_scale = false;
        let mut engine = engine_with(settings);
        let rows: Vec<String> = (0..40).map(|i| format!("{},{}", i, 40 - i)).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);

        let c = engine.forests[0].c;
        let height = engine.forests[0].height_limit;
        let avg = engine.forests[0].avg.clone();
        let dist = engine.forests[0].avg_sample_dist;

        engine
            .train(None::<std::io::Cursor<Vec<u8>>>, true, true)
            .unwrap();
        let f = &engine.forests[0];
        assert_eq!(f.c, c);
        assert_eq!(f.height_limit, height);
        assert_eq!(f.avg, avg);
        assert_eq!(f.avg_sample_dist, dist);
    }

    #[test]
    fn test_filter_regex_and_inversion() {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        settings.filters = vec!["^b$".to_string()];
        let mut engine = engine_with(settings.clone());
        let mut rows = Vec::new();
        for i in 0..30 {
            for cat in ["a", "b", "c"] {
                rows.push(format!("{},{}", cat, i));
            }
        }
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);
        assert!(!engine.forests[0].filter);
        assert!(engine.forests[1].filter);
        assert!(!engine.forests[2].filter);

        settings.filters = vec!["-v ^b$".to_string()];
        let mut engine = engine_with(settings);
        feed(&mut engine, &refs);
        assert!(engine.forests[0].filter);
        assert!(!engine.forests[1].filter);
        assert!(engine.forests[2].filter);
    }

    #[test]
    fn test_text_dimension_hashing() {
        let mut settings = Settings::default();
        settings.text_dims = "1".to_string();
        let engine = engine_with(settings);
        let mut dims = engine.dims;
        dims.init_from_record(2);
        let v1 = dims.parse_values(&["yes".to_string(), "1".to_string()], false);
        let v2 = dims.parse_values(&["yes".to_string(), "2".to_string()], false);
        let v3 = dims.parse_values(&["no".to_string(), "1".to_string()], false);
        assert_eq!(v1[0], v2[0]);
        assert_ne!(v1[0], v3[0]);
    }

    #[test]
    fn test_parse_attribute_is_lenient() {
        assert_eq!(parse_attribute("1.5"), 1.5);
        assert_eq!(parse_attribute("  -2"), -2.0);
        assert_eq!(parse_attribute("3x"), 3.0);
        assert_eq!(parse_attribute("abc"), 0.0);
        assert_eq!(parse_attribute(""), 0.0);
    }

    #[test]
    fn test_remove_samples() {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        let mut engine = engine_with(settings);
        let rows: Vec<String> = (0..30).map(|i| format!("a,{}", i)).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        feed(&mut engine, &refs);

        engine.remove_samples("a").unwrap();
        assert!(engine.forests[0].samples.is_empty());
        assert!(engine.remove_samples("zzz").is_err());
    }
}
