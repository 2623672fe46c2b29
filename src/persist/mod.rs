// # Snapshot Persistence
//
// Serializes the globals and every forest's samples and derived constants
// to disk, and replays them back. Two equivalent formats exist: a tagged
// line format and a JSON object format. Files ending in `.json` are
// written as objects; on read the format is sniffed from the content.
// Forest creation order is preserved and the category index is rebuilt as
// forests are replayed.

use crate::engine::{Engine, Forest};
use crate::error::{GroveError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};

pub mod line;
pub mod object;

/// Globals parsed from a snapshot, common to both formats.
pub(crate) struct LoadedGlobals {
    pub dimensions: usize,
    pub label_dims: String,
    pub template: String,
    pub trees: usize,
    pub samples_max: usize,
    pub category_dims: String,
    pub input_separator: u8,
    pub header: bool,
    pub score_spec: String,
    pub score_factor: f64,
    pub ignore_dims: String,
    pub include_dims: String,
    pub filters: Vec<String>,
    pub decimals: usize,
    pub unique_samples: u32,
    pub printf_format: String,
    pub list_separator: u8,
    pub n_vector_adjust: bool,
    pub aggregate: bool,
    pub text_dims: String,
    pub score_dims: String,
}

impl LoadedGlobals {
    /// Overlay the snapshot globals onto the engine settings and refresh
    /// the dimension mapping. Options given after the snapshot load still
    /// override these values.
    pub fn apply(self, engine: &mut Engine) -> Result<()> {
        let s = &mut engine.settings;
        s.label_dims = self.label_dims;
        s.template = self.template;
        s.trees = self.trees;
        s.samples_per_tree = self.samples_max;
        s.category_dims = self.category_dims;
        s.input_separator = self.input_separator;
        s.header = self.header;
        s.set_score(&self.score_spec)?;
        s.score_factor = self.score_factor;
        s.ignore_dims = self.ignore_dims;
        s.include_dims = self.include_dims;
        s.filters = self.filters;
        s.decimals = self.decimals;
        s.unique_samples = self.unique_samples;
        s.printf_format = self.printf_format;
        s.list_separator = self.list_separator;
        s.n_vector_adjust = self.n_vector_adjust;
        s.aggregate = self.aggregate;
        s.text_dims = self.text_dims;
        s.score_dims = self.score_dims;

        engine.rebuild_dims()?;
        engine.dims.dimensions = self.dimensions;
        Ok(())
    }
}

/// Replay one loaded forest: create it in order, then feed the sample
/// rows through saved-mode ingestion.
pub(crate) fn replay_forest(
    engine: &mut Engine,
    category: String,
    last_updated: i64,
    samples: Vec<Vec<f64>>,
) -> usize {
    let idx = engine.insert_forest(Forest::new(category, last_updated));
    for row in samples {
        let mut row = row;
        row.resize(engine.dims.dimensions, 0.0);
        engine.add_sample_row(idx, row, true);
    }
    idx
}

/// True when the forest survives the delete-older-than check.
pub(crate) fn keep_forest(forest: &Forest, now: i64, delete_older: Option<i64>) -> bool {
    match delete_older {
        Some(interval) if interval > 0 => forest.last_updated >= now - interval,
        _ => true,
    }
}

/// Round a value to the configured number of decimals for serialization.
pub(crate) fn round_to(v: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (v * factor).round() / factor
}

/// Write a snapshot, choosing the format by file extension.
pub fn save(engine: &Engine, path: &str, delete_older: Option<i64>) -> Result<()> {
    let file = File::create(path).map_err(|e| GroveError::File {
        path: path.to_string(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    if path.ends_with(".json") {
        object::write_snapshot(engine, &mut writer, delete_older)
    } else {
        line::write_snapshot(engine, &mut writer, delete_older)
    }
}

/// Load a snapshot, sniffing the format from the first byte. With
/// `tolerate_missing` a nonexistent file is not an error; the return value
/// tells whether anything was loaded.
pub fn load(engine: &mut Engine, path: &str, tolerate_missing: bool) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            if tolerate_missing && e.kind() == std::io::ErrorKind::NotFound {
                return Ok(false);
            }
            return Err(GroveError::File {
                path: path.to_string(),
                source: e,
            });
        }
    };

    let mut probe = [0u8; 64];
    let n = file.read(&mut probe)?;
    let looks_like_json = probe[..n]
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|&b| b == b'{')
        .unwrap_or(false);
    file.seek(SeekFrom::Start(0))?;

    let mut reader = BufReader::new(file);
    if looks_like_json {
        object::read_snapshot(engine, &mut reader)?;
    } else {
        line::read_snapshot(engine, &mut reader)?;
    }
    Ok(true)
}
