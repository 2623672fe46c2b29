// # Analysis and Categorization
//
// Streams input records against the trained forests: the analyzer prints
// records whose score clears the owning forest's threshold, the
// categorizer assigns each record to the best-matching forest, and both
// have aggregate variants that score one accumulated summary row per
// forest at end of stream. The test-grid command walks each forest's
// sample space and prints the high-scoring lattice points.

use crate::config::ScoreMode;
use crate::engine::Engine;
use crate::error::Result;
use crate::input;
use crate::output::{Printer, RecordView};
use std::io::{BufRead, Write};

/// Samples echoed back by the test grid for plotting.
pub const TEST_SAMPLES: usize = 10240;

/// Optional report formats attached to an analysis run.
#[derive(Default)]
pub struct ReportFormats<'a> {
    /// Emitted for records whose category matches no forest.
    pub not_found: Option<&'a str>,
    /// Per-forest summary line printed after the stream.
    pub average: Option<&'a str>,
}

/// Analyze a stream: route each record to its forest, score it, and print
/// it when both the overall score and the attribution gate clear the
/// forest threshold.
pub fn analyze<R: BufRead, W: Write>(
    engine: &mut Engine,
    input_stream: R,
    out: &mut W,
    formats: &ReportFormats,
) -> Result<()> {
    let mut lines = 0usize;
    let mut first = true;

    tracing::debug!("starting analysis");

    for line in input_stream.lines() {
        let line = line?;
        lines += 1;
        if engine.settings.header && lines == 1 {
            continue;
        }
        let mut values = input::split_record(&line, engine.settings.input_separator);
        if values.is_empty() {
            continue;
        }
        engine.formulas.rewrite(&mut values)?;
        if first {
            engine.dims.init_from_record(values.len());
            first = false;
        }

        let dimension = engine.dims.parse_values(&values, false);
        let key = engine
            .dims
            .category_key(&values, engine.settings.category_separator);

        let Some(idx) = engine.find_forest(&key).filter(|&i| !engine.forests[i].filter) else {
            if formats.not_found.is_some() && engine.find_forest(&key).is_none() {
                let printer = Printer {
                    settings: &engine.settings,
                    dims: &engine.dims,
                };
                let view = RecordView {
                    score: 0.0,
                    line_no: lines,
                    forest: None,
                    values: Some(&values),
                    dimension: Some(&dimension),
                };
                printer.print_line(
                    out,
                    &view,
                    formats.not_found.unwrap(),
                    "dvclm",
                    &mut || None,
                )?;
            }
            continue;
        };

        engine.forests[idx].analyzed = true;
        if engine.forests[idx].total_rows == 0 {
            engine.ensure_forest_score(idx);
            if engine.settings.cluster_relative_size > 0.0 {
                engine.ensure_clusters(idx);
            }
        }
        engine.forests[idx].total_rows += 1;

        if engine.settings.aggregate {
            accumulate_summary(engine, idx, &dimension);
            continue;
        }

        if !take_this_row(engine, idx) {
            continue;
        }
        engine.forests[idx].analyzed_rows += 1;

        let score = engine.calculate_score(&engine.forests[idx], &dimension);
        if formats.average.is_some() {
            engine.forests[idx].test_average_score += score;
        }

        let threshold = engine.forest_score(&engine.forests[idx]);
        let gate = engine.attribution_gate(&engine.forests[idx], &dimension);
        if score > threshold && gate > threshold {
            engine.forests[idx].high_analyzed_rows += 1;
            print_outlier(
                engine,
                out,
                idx,
                score,
                lines,
                Some(&values),
                &dimension,
                "rscldavxCtnohem",
            )?;
        }
    }

    if engine.settings.aggregate {
        analyze_summaries(engine, out, formats)?;
    }

    if let Some(average_format) = formats.average {
        print_average_report(engine, out, average_format, lines)?;
    }

    Ok(())
}

/// Aggregate-mode end-of-stream pass: score each forest's summary row.
fn analyze_summaries<W: Write>(
    engine: &mut Engine,
    out: &mut W,
    formats: &ReportFormats,
) -> Result<()> {
    for idx in 0..engine.forests.len() {
        if engine.forests[idx].filter || engine.forests[idx].summary.is_none() {
            continue;
        }
        engine.forests[idx].analyzed_rows = 1;
        let summary = engine.forests[idx].summary.clone().unwrap();

        let score = engine.calculate_score(&engine.forests[idx], &summary);
        if formats.average.is_some() {
            engine.forests[idx].test_average_score = score;
        }

        let threshold = engine.forest_score(&engine.forests[idx]);
        let gate = engine.attribution_gate(&engine.forests[idx], &summary);
        if score > threshold && gate > threshold {
            engine.forests[idx].high_analyzed_rows += 1;
            print_outlier(engine, out, idx, score, 0, None, &summary, "rsdaxCtnohem")?;
        }
    }
    Ok(())
}

/// Per-forest average line printed after an analysis run.
fn print_average_report<W: Write>(
    engine: &mut Engine,
    out: &mut W,
    format: &str,
    lines: usize,
) -> Result<()> {
    for idx in 0..engine.forests.len() {
        let f = &engine.forests[idx];
        if f.filter || f.analyzed_rows == 0 {
            continue;
        }
        engine.forests[idx].test_average_score /= engine.forests[idx].analyzed_rows as f64;

        let score = engine.forest_score(&engine.forests[idx]);
        let printer = Printer {
            settings: &engine.settings,
            dims: &engine.dims,
        };
        let view = RecordView {
            score,
            line_no: lines,
            forest: Some(&engine.forests[idx]),
            values: None,
            dimension: None,
        };
        printer.print_line(out, &view, format, "sraxCthSno", &mut || None)?;
    }
    Ok(())
}

/// Categorize a stream: every record is scored against every scorable
/// forest in scaled mode and assigned to the lowest-scoring one. With the
/// score limit on, records whose best score still exceeds the winning
/// forest's threshold are suppressed.
pub fn categorize<R: BufRead, W: Write>(
    engine: &mut Engine,
    input_stream: R,
    score_limit: bool,
    out: &mut W,
) -> Result<()> {
    let saved_mode = engine.settings.score_mode;
    engine.settings.score_mode = ScoreMode::Scaled;

    tracing::debug!("starting categorizing");

    for idx in 0..engine.forests.len() {
        engine.ensure_score_range(idx);
    }

    let mut lines = 0usize;
    let mut first = true;

    for line in input_stream.lines() {
        let line = line?;
        lines += 1;
        if engine.settings.header && lines == 1 {
            continue;
        }
        let mut values = input::split_record(&line, engine.settings.input_separator);
        if values.is_empty() {
            continue;
        }
        engine.formulas.rewrite(&mut values)?;
        if first {
            engine.dims.init_from_record(values.len());
            first = false;
        }
        let dimension = engine.dims.parse_values(&values, false);

        if engine.settings.aggregate {
            let key = engine
                .dims
                .category_key(&values, engine.settings.category_separator);
            if let Some(idx) = engine.find_forest(&key) {
                accumulate_summary(engine, idx, &dimension);
                engine.forests[idx].total_rows += 1;
            }
            continue;
        }

        let best = best_forest(engine, &dimension);
        if let Some((idx, score)) = best {
            engine.forests[idx].total_rows += 1;
            if !score_limit || score <= engine.forest_score(&engine.forests[idx]) {
                print_outlier(
                    engine,
                    out,
                    idx,
                    score,
                    lines,
                    Some(&values),
                    &dimension,
                    "rscldavxCtnem",
                )?;
            }
        }
    }

    if engine.settings.aggregate {
        for i in 0..engine.forests.len() {
            let Some(summary) = engine.forests[i].summary.clone() else {
                continue;
            };
            if let Some((idx, score)) = best_forest(engine, &summary) {
                if !score_limit || score <= engine.forest_score(&engine.forests[idx]) {
                    print_outlier(engine, out, idx, score, 0, None, &summary, "sdaxCtnem")?;
                }
            }
        }
    }

    engine.settings.score_mode = saved_mode;
    Ok(())
}

/// The non-filtered forest with the lowest score for a point. Ties go to
/// the later forest.
fn best_forest(engine: &Engine, dimension: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, forest) in engine.forests.iter().enumerate() {
        if forest.filter {
            continue;
        }
        let score = engine.calculate_score(forest, dimension);
        if best.map_or(true, |(_, min)| score <= min) {
            best = Some((idx, score));
        }
    }
    best
}

/// Print the unfiltered forests that saw no analyzed rows, normally used
/// to spot expected categories missing from the analyzed data.
pub fn print_missing_categories<W: Write>(
    engine: &Engine,
    out: &mut W,
    format: &str,
) -> Result<()> {
    for forest in &engine.forests {
        if forest.filter || forest.analyzed {
            continue;
        }
        let printer = Printer {
            settings: &engine.settings,
            dims: &engine.dims,
        };
        let view = RecordView {
            score: 0.0,
            line_no: 0,
            forest: Some(forest),
            values: None,
            dimension: None,
        };
        printer.print_line(out, &view, format, "Catm", &mut || None)?;
    }
    Ok(())
}

/// Walk a lattice over each forest's (factor-extended) sample box and
/// print the points scoring at or above the forest threshold, followed by
/// up to `TEST_SAMPLES` training samples echoed with score zero.
pub fn test_grid<W: Write>(
    engine: &mut Engine,
    out: &mut W,
    extension_factor: f64,
    interval: usize,
) -> Result<()> {
    let interval = interval.max(1);
    for idx in 0..engine.forests.len() {
        if !engine.forests[idx].filter {
            engine.ensure_forest_score(idx);
        }
    }

    let dimensions = engine.dims.dimensions;
    if dimensions == 0 {
        return Ok(());
    }
    for idx in 0..engine.forests.len() {
        if engine.forests[idx].filter {
            continue;
        }
        let threshold = engine.forest_score(&engine.forests[idx]);

        let (len, base): (Vec<f64>, Vec<f64>) = {
            let f = &engine.forests[idx];
            let len: Vec<f64> = (0..dimensions)
                .map(|i| {
                    let range = f.max[i] - f.min[i];
                    if range == 0.0 {
                        1.0
                    } else {
                        range
                    }
                })
                .collect();
            let base = (0..dimensions)
                .map(|i| f.min[i] - extension_factor * len[i] / 2.0)
                .collect();
            (len, base)
        };

        let mut counters = vec![0usize; dimensions];
        let mut previous: Option<Vec<f64>> = None;
        while counters[0] <= interval {
            let point: Vec<f64> = (0..dimensions)
                .map(|i| {
                    (1.0 + extension_factor) * (counters[i] as f64 / interval as f64) * len[i]
                        + base[i]
                })
                .collect();

            if previous.as_deref() != Some(point.as_slice()) {
                let score = engine.calculate_score(&engine.forests[idx], &point);
                if score >= threshold {
                    print_outlier(engine, out, idx, score, 0, None, &point, "sdaxC")?;
                }
                previous = Some(point);
            }

            for i in (0..dimensions).rev() {
                if i > 0 && counters[i] == interval {
                    counters[i] = 0;
                    counters[i - 1] += 1;
                } else if i == dimensions - 1 {
                    counters[i] += 1;
                }
            }
        }

        let count = engine.forests[idx].samples.len();
        for s in 0..count.min(TEST_SAMPLES) {
            let pick = if count <= TEST_SAMPLES {
                s
            } else {
                engine.rng.below(count)
            };
            let values = engine.forests[idx].samples[pick].values.clone();
            print_outlier(engine, out, idx, 0.0, 0, None, &values, "sdaxC")?;
        }
    }
    Ok(())
}

/// Reservoir check for analyzed rows: with a configured sampling count
/// `K`, a row is accepted with probability `K / total_rows` once more than
/// `K` rows have been seen.
fn take_this_row(engine: &mut Engine, idx: usize) -> bool {
    let k = engine.settings.analyze_sampling;
    if k == 0 {
        return true;
    }
    let total = engine.forests[idx].total_rows;
    if total <= k {
        return true;
    }
    engine.rng.below(total) + 1 <= k
}

fn accumulate_summary(engine: &mut Engine, idx: usize, dimension: &[f64]) {
    let forest = &mut engine.forests[idx];
    match &mut forest.summary {
        Some(summary) => {
            for (d, v) in dimension.iter().enumerate() {
                summary[d] += v;
            }
        }
        None => forest.summary = Some(dimension.to_vec()),
    }
}

/// Render one outlier line through the template printer, wiring up the
/// lazy per-dimension attribution scores.
#[allow(clippy::too_many_arguments)]
fn print_outlier<W: Write>(
    engine: &Engine,
    out: &mut W,
    idx: usize,
    score: f64,
    line_no: usize,
    values: Option<&[String]>,
    dimension: &[f64],
    allowed: &str,
) -> Result<()> {
    let forest = &engine.forests[idx];
    let printer = Printer {
        settings: &engine.settings,
        dims: &engine.dims,
    };
    let view = RecordView {
        score,
        line_no,
        forest: Some(forest),
        values,
        dimension: Some(dimension),
    };
    let mut dim_scores = || {
        if forest.filter || engine.settings.cluster_relative_size <= 0.0 {
            return None;
        }
        Some(engine.dimension_scores(forest, dimension))
    };
    printer.print_line(
        out,
        &view,
        &engine.settings.template,
        allowed,
        &mut dim_scores,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn two_category_engine() -> Engine {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        settings.trees = 10;
        settings.samples_per_tree = 32;
        settings.seed = Some(321);
        let mut engine = Engine::new(settings).unwrap();

        let mut rows = Vec::new();
        for i in 0..50 {
            let jitter = (i % 10) as f64 * 0.02;
            rows.push(format!("A,{:.3},{:.3}", 1.0 + jitter, 1.0 - jitter));
            rows.push(format!("B,{:.3},{:.3}", 10.0 + jitter, 10.0 - jitter));
        }
        let data = rows.join("\n");
        engine
            .train(Some(std::io::Cursor::new(data)), true, true)
            .unwrap();
        engine
    }

    #[test]
    fn test_analyze_flags_outlier_rows() {
        let mut engine = two_category_engine();
        engine.settings.template = "%r %c".to_string();

        let mut out = Vec::new();
        let input = "A,1.02,0.99\nA,500,-500\nB,10.01,9.98\n";
        analyze(
            &mut engine,
            std::io::Cursor::new(input),
            &mut out,
            &ReportFormats::default(),
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("2 A"), "outlier row missing: {:?}", text);
        assert!(!text.contains("1 A"));
        assert!(!text.contains("3 B"));

        let a = engine.find_forest("A").unwrap();
        assert_eq!(engine.forests[a].total_rows, 2);
        assert_eq!(engine.forests[a].high_analyzed_rows, 1);
    }

    #[test]
    fn test_analyze_not_found_format() {
        let mut engine = two_category_engine();
        engine.settings.template = "%s".to_string();

        let mut out = Vec::new();
        let formats = ReportFormats {
            not_found: Some("new: %v"),
            average: None,
        };
        analyze(
            &mut engine,
            std::io::Cursor::new("Z,5,5\n"),
            &mut out,
            &formats,
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "new: Z,5,5\n");
    }

    #[test]
    fn test_categorize_assigns_nearest_forest() {
        let mut engine = two_category_engine();
        engine.settings.template = "%C".to_string();

        let mut out = Vec::new();
        let input = "?,1.1,1.0\n?,9.0,11.0\n";
        categorize(&mut engine, std::io::Cursor::new(input), false, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["A", "B"]);
    }

    #[test]
    fn test_missing_categories_report() {
        let mut engine = two_category_engine();
        engine.settings.template = "%s".to_string();

        let mut out = Vec::new();
        analyze(
            &mut engine,
            std::io::Cursor::new("A,1.0,1.0\n"),
            &mut out,
            &ReportFormats::default(),
        )
        .unwrap();

        let mut out = Vec::new();
        print_missing_categories(&engine, &mut out, "%C").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "B\n");
    }

    #[test]
    fn test_aggregate_analyze_sums_rows() {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        settings.trees = 10;
        settings.samples_per_tree = 16;
        settings.seed = Some(8);
        settings.aggregate = true;
        let mut engine = Engine::new(settings).unwrap();

        // aggregate training: each row accumulates into one summary sample,
        // so build enough distinct categories-by-stream to keep it simple
        // by training non-aggregated first
        engine.settings.aggregate = false;
        let rows: Vec<String> = (0..40)
            .map(|i| format!("X,{},{}", (i % 5) as f64, (i % 3) as f64))
            .collect();
        let data = rows.join("\n");
        engine
            .train(Some(std::io::Cursor::new(data)), true, true)
            .unwrap();
        engine.settings.aggregate = true;

        let mut out = Vec::new();
        analyze(
            &mut engine,
            std::io::Cursor::new("X,1,2\nX,3,4\nX,5,6\n"),
            &mut out,
            &ReportFormats::default(),
        )
        .unwrap();

        let x = engine.find_forest("X").unwrap();
        assert_eq!(engine.forests[x].summary, Some(vec![9.0, 12.0]));
        assert_eq!(engine.forests[x].analyzed_rows, 1);
        assert_eq!(engine.forests[x].total_rows, 3);
    }

    #[test]
    fn test_analyze_sampling_reservoir() {
        let mut engine = two_category_engine();
        engine.settings.template = String::new();
        engine.settings.analyze_sampling = 10;

        let rows: Vec<String> = (0..200).map(|_| "A,1.0,1.0".to_string()).collect();
        let data = rows.join("\n");
        let mut out = Vec::new();
        analyze(
            &mut engine,
            std::io::Cursor::new(data),
            &mut out,
            &ReportFormats::default(),
        )
        .unwrap();

        let a = engine.find_forest("A").unwrap();
        assert_eq!(engine.forests[a].total_rows, 200);
        // roughly 10 of 200 rows pass the reservoir check
        assert!(engine.forests[a].analyzed_rows < 60);
        assert!(engine.forests[a].analyzed_rows >= 1);
    }
}
