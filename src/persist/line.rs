// # Line Snapshot Format
//
// One record per line, tagged by the first field: `G` for globals, `F`
// for a forest header, `S` for a sample. Fields separate with `;` and
// string fields are double-quoted; sample coordinates join with `|`.

use super::{keep_forest, LoadedGlobals};
use crate::engine::{parse_attribute, Engine};
use crate::error::{GroveError, Result};
use crate::input::split_record;
use std::io::{BufRead, Write};

pub fn write_snapshot<W: Write>(
    engine: &Engine,
    out: &mut W,
    delete_older: Option<i64>,
) -> Result<()> {
    let s = &engine.settings;
    let now = chrono::Utc::now().timestamp();

    writeln!(
        out,
        "G;{};\"{}\";\"{}\";{};{};\"{}\";\"{}\";{};{};{:.6};\"{}\";\"{}\";{};\"{}\";{};{};\"{}\";\"{}\";{};{};\"{}\";\"{}\"",
        engine.dims.dimensions,
        s.label_dims,
        s.template,
        s.trees,
        s.samples_per_tree,
        s.category_dims,
        s.input_separator as char,
        s.header as u32,
        s.score_spec(),
        s.score_factor,
        s.ignore_dims,
        s.include_dims,
        engine.forests.len(),
        s.filters.join(";"),
        s.decimals,
        s.unique_samples,
        s.printf_format,
        s.list_separator as char,
        s.n_vector_adjust as u32,
        s.aggregate as u32,
        s.text_dims,
        s.score_dims,
    )?;

    for forest in &engine.forests {
        if !keep_forest(forest, now, delete_older) {
            continue;
        }
        writeln!(
            out,
            "F;\"{}\";{:.6};{};{};{}",
            forest.category,
            forest.c,
            forest.height_limit,
            forest.samples.len(),
            forest.last_updated,
        )?;
        for sample in &forest.samples {
            let coords: Vec<String> = sample
                .values
                .iter()
                .map(|v| format!("{:.*}", s.decimals, v))
                .collect();
            writeln!(out, "S;{}", coords.join("|"))?;
        }
    }
    Ok(())
}

fn snapshot_error(line: usize, reason: &str) -> GroveError {
    GroveError::Snapshot {
        line,
        reason: reason.to_string(),
    }
}

pub fn read_snapshot<R: BufRead>(engine: &mut Engine, input: R) -> Result<()> {
    let mut lines = input.lines();
    let mut ln = 0usize;

    // skip anything before the globals record
    loop {
        let line = match lines.next() {
            Some(line) => line?,
            None => return Err(snapshot_error(ln, "missing globals record")),
        };
        ln += 1;
        if line.starts_with('G') {
            parse_globals(&line, ln)?.apply(engine)?;
            break;
        }
    }

    let mut pending: Option<String> = None;
    loop {
        let line = match pending.take() {
            Some(line) => line,
            None => match lines.next() {
                Some(line) => {
                    ln += 1;
                    line?
                }
                None => return Ok(()),
            },
        };

        if !line.starts_with('F') {
            return Err(snapshot_error(ln, "expected forest record"));
        }

        let fields = split_record(&line, b';');
        if fields.len() != 6 {
            return Err(snapshot_error(ln, "wrong field count in forest record"));
        }
        let category = fields[1].clone();
        let c: f64 = fields[2]
            .parse()
            .map_err(|_| snapshot_error(ln, "bad forest constant"))?;
        let height_limit: usize = parse_attribute(&fields[3]) as usize;
        let last_updated: i64 = fields[5]
            .parse()
            .map_err(|_| snapshot_error(ln, "bad forest timestamp"))?;

        let idx = super::replay_forest(engine, category, last_updated, Vec::new());
        engine.forests[idx].c = c;
        engine.forests[idx].height_limit = height_limit;

        // sample lines follow until the next forest record or end of file
        loop {
            let line = match lines.next() {
                Some(line) => {
                    ln += 1;
                    line?
                }
                None => return Ok(()),
            };
            if line.starts_with('S') && line.len() > 2 {
                let dims = engine.dims.dimensions;
                let row: Vec<f64> = line[2..]
                    .split('|')
                    .take(dims)
                    .map(parse_attribute)
                    .collect();
                let mut row = row;
                row.resize(dims, 0.0);
                engine.add_sample_row(idx, row, true);
            } else {
                pending = Some(line);
                break;
            }
        }
    }
}

fn parse_globals(line: &str, ln: usize) -> Result<LoadedGlobals> {
    let fields = split_record(line, b';');
    if fields.len() != 23 {
        return Err(snapshot_error(ln, "wrong field count in globals record"));
    }

    let number = |i: usize| -> Result<usize> {
        fields[i]
            .parse()
            .map_err(|_| snapshot_error(ln, "bad numeric value in globals record"))
    };
    let byte = |i: usize| -> u8 { fields[i].bytes().next().unwrap_or(b',') };

    let filters: Vec<String> = if fields[14].is_empty() {
        Vec::new()
    } else {
        fields[14].split(';').map(str::to_string).collect()
    };

    Ok(LoadedGlobals {
        dimensions: number(1)?,
        label_dims: fields[2].clone(),
        template: fields[3].clone(),
        trees: number(4)?,
        samples_max: number(5)?,
        category_dims: fields[6].clone(),
        input_separator: byte(7),
        header: number(8)? != 0,
        score_spec: fields[9].clone(),
        score_factor: fields[10]
            .parse()
            .map_err(|_| snapshot_error(ln, "bad score factor"))?,
        ignore_dims: fields[11].clone(),
        include_dims: fields[12].clone(),
        filters,
        decimals: number(15)?,
        unique_samples: number(16)? as u32,
        printf_format: fields[17].clone(),
        list_separator: byte(18),
        n_vector_adjust: number(19)? != 0,
        aggregate: number(20)? != 0,
        text_dims: fields[21].clone(),
        score_dims: fields[22].clone(),
    })
}
