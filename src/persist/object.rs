// # Object Snapshot Format
//
// The JSON rendition of a snapshot: a `globals` object and a `forests`
// array, each forest carrying its category, sample count, update stamp and
// the raw sample rows. Semantically identical to the line format.

use super::{keep_forest, round_to, LoadedGlobals};
use crate::engine::Engine;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

#[derive(Serialize, Deserialize)]
struct SnapshotDoc {
    globals: GlobalsDoc,
    forests: Vec<ForestDoc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalsDoc {
    dimensions: usize,
    forest_count: usize,
    print_string: String,
    printf_format: String,
    tree_count: usize,
    samples_max: usize,
    input_separator: String,
    list_separator: String,
    header: u32,
    outlier_score: String,
    category_dims: String,
    label_dims: String,
    include_dims: String,
    ignore_dims: String,
    text_dims: String,
    score_dims: String,
    filter: String,
    decimals: usize,
    unique_samples: u32,
    aggregate: u32,
    #[serde(default)]
    score_factor: f64,
    #[serde(default)]
    n_vector_adjust: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForestDoc {
    category: String,
    sample_count: usize,
    last_updated: i64,
    samples: Vec<Vec<f64>>,
}

pub fn write_snapshot<W: Write>(
    engine: &Engine,
    out: &mut W,
    delete_older: Option<i64>,
) -> Result<()> {
    let s = &engine.settings;
    let now = chrono::Utc::now().timestamp();

    let globals = GlobalsDoc {
        dimensions: engine.dims.dimensions,
        forest_count: engine.forests.len(),
        print_string: s.template.clone(),
        printf_format: s.printf_format.clone(),
        tree_count: s.trees,
        samples_max: s.samples_per_tree,
        input_separator: (s.input_separator as char).to_string(),
        list_separator: (s.list_separator as char).to_string(),
        header: s.header as u32,
        outlier_score: s.score_spec(),
        category_dims: s.category_dims.clone(),
        label_dims: s.label_dims.clone(),
        include_dims: s.include_dims.clone(),
        ignore_dims: s.ignore_dims.clone(),
        text_dims: s.text_dims.clone(),
        score_dims: s.score_dims.clone(),
        filter: s.filters.join(";"),
        decimals: s.decimals,
        unique_samples: s.unique_samples,
        aggregate: s.aggregate as u32,
        score_factor: s.score_factor,
        n_vector_adjust: s.n_vector_adjust as u32,
    };

    let forests = engine
        .forests
        .iter()
        .filter(|f| keep_forest(f, now, delete_older))
        .map(|f| ForestDoc {
            category: f.category.clone(),
            sample_count: f.samples.len(),
            last_updated: f.last_updated,
            samples: f
                .samples
                .iter()
                .map(|sample| {
                    sample
                        .values
                        .iter()
                        .map(|&v| round_to(v, s.decimals))
                        .collect()
                })
                .collect(),
        })
        .collect();

    let doc = SnapshotDoc { globals, forests };
    serde_json::to_writer(out, &doc)?;
    Ok(())
}

pub fn read_snapshot<R: BufRead>(engine: &mut Engine, input: R) -> Result<()> {
    let doc: SnapshotDoc = serde_json::from_reader(input)?;
    let g = doc.globals;

    LoadedGlobals {
        dimensions: g.dimensions,
        label_dims: g.label_dims,
        template: g.print_string,
        trees: g.tree_count,
        samples_max: g.samples_max,
        category_dims: g.category_dims,
        input_separator: g.input_separator.bytes().next().unwrap_or(b','),
        header: g.header != 0,
        score_spec: g.outlier_score,
        score_factor: g.score_factor,
        ignore_dims: g.ignore_dims,
        include_dims: g.include_dims,
        filters: if g.filter.is_empty() {
            Vec::new()
        } else {
            g.filter.split(';').map(str::to_string).collect()
        },
        decimals: g.decimals,
        unique_samples: g.unique_samples,
        printf_format: g.printf_format,
        list_separator: g.list_separator.bytes().next().unwrap_or(b','),
        n_vector_adjust: g.n_vector_adjust != 0,
        aggregate: g.aggregate != 0,
        text_dims: g.text_dims,
        score_dims: g.score_dims,
    }
    .apply(engine)?;

    for forest in doc.forests {
        super::replay_forest(engine, forest.category, forest.last_updated, forest.samples);
    }
    Ok(())
}
