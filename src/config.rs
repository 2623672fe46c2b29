// # Engine Configuration
//
// All tunables live in a single `Settings` record with a fixed lifecycle:
// built from defaults, overlaid by the rc file, overlaid by command line
// options, then frozen before training starts.

use crate::error::{GroveError, Result};
use std::fs;
use std::path::Path;

/// Default rc file, searched in the user's home directory.
pub const DEFAULT_RC_FILE: &str = "~/.groverc";

/// How a record score is compared against the outlier threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    /// Raw score `2^(-avg_path/c)`.
    Raw,
    /// Raw score mapped into `[0,1]` with the forest's own score range.
    Scaled,
    /// Threshold taken from the score distribution of the training samples.
    Percentile,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Trees per forest.
    pub trees: usize,
    /// Samples per tree.
    pub samples_per_tree: usize,
    /// Hard cap for samples per forest, 0 = `trees * samples_per_tree`.
    pub max_total_samples: usize,
    /// Decimals used when printing and saving dimension values.
    pub decimals: usize,
    /// Scale every dimension to the widest dimension's range.
    pub auto_scale: bool,
    pub input_separator: u8,
    pub category_separator: u8,
    pub label_separator: u8,
    pub list_separator: u8,
    /// Input data has a header row to skip.
    pub header: bool,
    pub outlier_score: f64,
    pub score_mode: ScoreMode,
    /// Retained in snapshots for score tuning; not consulted by the scorer.
    pub score_factor: f64,
    /// Percentage of samples checked for uniqueness, 0 = accept all.
    pub unique_samples: u32,
    /// User printf-style format for dimension and average values.
    pub printf_format: String,
    pub n_vector_adjust: bool,
    /// Accumulate one summary row per category instead of raw samples.
    pub aggregate: bool,
    /// Refine leaf path lengths with the nearest-sample distance.
    pub nearest: bool,
    /// Reservoir size for analyzed rows, 0 = analyze everything.
    pub analyze_sampling: usize,
    pub debug: u32,
    /// Relative cluster radius in `[0,1]`, 0 disables cluster analysis.
    pub cluster_relative_size: f64,
    /// Column width for the forest info report.
    pub dimension_print_width: usize,
    /// Demote expression evaluation failures to zero.
    pub ignore_expression_errors: bool,
    /// RNG seed for reproducible runs.
    pub seed: Option<u64>,
    /// Outlier line template.
    pub template: String,
    /// Sub-template for the `%m` directive.
    pub dimension_template: Option<String>,
    /// 1-based dimension list strings, kept verbatim for persistence.
    pub ignore_dims: String,
    pub include_dims: String,
    pub category_dims: String,
    pub label_dims: String,
    pub text_dims: String,
    pub score_dims: String,
    /// Category filter regular expressions, `-v ` prefix inverts a match.
    pub filters: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trees: 100,
            samples_per_tree: 256,
            max_total_samples: 0,
            decimals: 6,
            auto_scale: true,
            input_separator: b',',
            category_separator: b';',
            label_separator: b'-',
            list_separator: b',',
            header: false,
            outlier_score: 0.5,
            score_mode: ScoreMode::Scaled,
            score_factor: 1.0,
            unique_samples: 0,
            printf_format: String::new(),
            n_vector_adjust: false,
            aggregate: false,
            nearest: true,
            analyze_sampling: 0,
            debug: 0,
            cluster_relative_size: 0.125,
            dimension_print_width: 25,
            ignore_expression_errors: false,
            seed: None,
            template: "%s %v".to_string(),
            dimension_template: None,
            ignore_dims: String::new(),
            include_dims: String::new(),
            category_dims: String::new(),
            label_dims: String::new(),
            text_dims: String::new(),
            score_dims: String::new(),
            filters: Vec::new(),
        }
    }
}

impl Settings {
    /// Per-forest sample bound: the configured hard cap, or one full
    /// rotation of tree slices.
    pub fn samples_total(&self) -> usize {
        if self.max_total_samples > 0 {
            self.max_total_samples
        } else {
            self.trees * self.samples_per_tree
        }
    }

    /// Parse an outlier score spec: plain value in `[0,1]`, value with `s`
    /// suffix for scaled mode, or a percentage in `[0,100]` with `%` suffix.
    pub fn set_score(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim();
        let (number, mode) = if let Some(v) = spec.strip_suffix('s') {
            (v, ScoreMode::Scaled)
        } else if let Some(v) = spec.strip_suffix('%') {
            (v, ScoreMode::Percentile)
        } else {
            (spec, ScoreMode::Raw)
        };

        let value: f64 = number.parse().map_err(|_| {
            GroveError::InvalidOption(format!(
                "give outlier score between 0 and 1 (suffix 's' for scaling) \
                 or between 0 and 100 with suffix '%': {}",
                spec
            ))
        })?;

        let valid = match mode {
            ScoreMode::Percentile => (0.0..=100.0).contains(&value),
            _ => (0.0..=1.0).contains(&value),
        };
        if !valid {
            return Err(GroveError::InvalidOption(format!(
                "outlier score out of range: {}",
                spec
            )));
        }

        self.outlier_score = value;
        self.score_mode = mode;
        Ok(())
    }

    /// Render the score back into its spec form for persistence.
    pub fn score_spec(&self) -> String {
        match self.score_mode {
            ScoreMode::Raw => format!("{:.6}", self.outlier_score),
            ScoreMode::Scaled => format!("{:.6}s", self.outlier_score),
            ScoreMode::Percentile => format!("{:.6}%", self.outlier_score),
        }
    }

    /// Overlay settings from an rc file. A missing file is an error only
    /// when the user named it explicitly.
    pub fn load_rc_file(&mut self, path: &str, required: bool) -> Result<()> {
        let expanded = expand_home(path);
        let path = Path::new(&expanded);
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if required {
                    return Err(GroveError::File {
                        path: expanded,
                        source: e,
                    });
                }
                return Ok(());
            }
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) = split_config_line(line).ok_or_else(|| {
                GroveError::Config(format!("unknown option in config file: {}", line))
            })?;
            self.apply_config(&name, &value)
                .map_err(|e| GroveError::Config(format!("{} ({})", e, line)))?;
        }
        Ok(())
    }

    fn apply_config(&mut self, name: &str, value: &str) -> Result<()> {
        match name.to_ascii_uppercase().as_str() {
            "SAMPLES" => self.samples_per_tree = parse_number(value)?,
            "TREES" => self.trees = parse_number(value)?,
            "DECIMALS" => self.decimals = parse_number(value)?,
            "AUTO_WEIGTH" | "AUTO_SCALE" => self.auto_scale = parse_number::<u32>(value)? != 0,
            "CATEGORY_SEPARATOR" => self.category_separator = first_byte(value)?,
            "LABEL_SEPARATOR" => self.label_separator = first_byte(value)?,
            "MAX_SAMPLES" => self.max_total_samples = parse_number(value)?,
            "OUTLIER_SCORE" => self.set_score(value)?,
            "NEAREST" => self.nearest = parse_number::<u32>(value)? != 0,
            "ANALYZE_SAMPLING" => self.analyze_sampling = parse_number(value)?,
            "DEBUG" => self.debug = parse_number(value)?,
            "CLUSTER_SIZE" => {
                let v: f64 = value
                    .parse()
                    .map_err(|_| GroveError::Config(format!("bad cluster size: {}", value)))?;
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(GroveError::Config(format!(
                        "cluster size must be between 0 and 1: {}",
                        value
                    )));
                }
                self.cluster_relative_size = v;
            }
            "PRINT_DIMENSION" => self.dimension_template = Some(value.to_string()),
            "DIM_PRINT_WIDTH" => {
                let v: usize = parse_number(value)?;
                self.dimension_print_width = if v == 0 { 25 } else { v };
            }
            "SEED" => self.seed = Some(parse_number(value)?),
            "IGNORE_EXPRESSION_ERRORS" => {
                self.ignore_expression_errors = parse_number::<u32>(value)? != 0
            }
            other => {
                return Err(GroveError::Config(format!(
                    "unknown option in config file: {}",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| GroveError::Config(format!("bad numeric value: {}", value)))
}

fn first_byte(value: &str) -> Result<u8> {
    value
        .bytes()
        .next()
        .ok_or_else(|| GroveError::Config("empty separator value".to_string()))
}

/// Split a `NAME VALUE` config line. The value may be double-quoted to
/// preserve whitespace.
fn split_config_line(line: &str) -> Option<(String, String)> {
    let pos = line.find(char::is_whitespace)?;
    let name = line[..pos].to_string();
    let mut value = line[pos..].trim().to_string();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = value[1..value.len() - 1].to_string();
    }
    if value.is_empty() {
        return None;
    }
    Some((name, value))
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, rest);
        }
    }
    path.to_string()
}
