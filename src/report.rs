// # Reports
//
// Human-readable inspection commands over the trained state: the forest
// info listing, the ASCII sample-density map, the per-sample score list
// and the dimension-pair correlation table.

use crate::config::ScoreMode;
use crate::engine::Engine;
use crate::error::Result;
use chrono::{Local, TimeZone};
use std::io::Write;

/// Buckets per row in the density map.
const DENSITY_MAX: usize = 100;

fn on_off(b: bool) -> &'static str {
    if b {
        "On"
    } else {
        "Off"
    }
}

fn dim_list(out: &mut dyn Write, name: &str, dims: &[usize]) -> std::io::Result<()> {
    let list: Vec<String> = dims.iter().map(|d| (d + 1).to_string()).collect();
    writeln!(out, "  {}{}", name, list.join(","))
}

/// Print the global settings and a per-forest summary: constants, score
/// ranges, the dimension statistics table and the cluster centers.
pub fn print_forest_info<W: Write>(engine: &mut Engine, out: &mut W) -> Result<()> {
    let s = engine.settings.clone();
    let dimensions = engine.dims.dimensions;
    let width = s.dimension_print_width;

    writeln!(out, "Global setting:")?;
    writeln!(out, "  Number of forests: {}", engine.forests.len())?;
    writeln!(out, "  Number of analyzed dimensions: {}", dimensions)?;
    writeln!(out, "  Number of samples/tree: {}", s.samples_per_tree)?;
    writeln!(out, "  Number of trees: {}", s.trees)?;
    writeln!(out, "  Number of decimals: {}", s.decimals)?;

    match s.score_mode {
        ScoreMode::Percentile => writeln!(
            out,
            "  Outlier score is the score under which there are {:.2} percent of sample scores",
            s.outlier_score
        )?,
        ScoreMode::Scaled => writeln!(
            out,
            "  Outlier score: {:.6}, scores are scaled to 0..1 using forest sample minimum and maximum score",
            s.outlier_score
        )?,
        ScoreMode::Raw => writeln!(out, "  Outlier score: {:.6}", s.outlier_score)?,
    }

    writeln!(out, "  Relative cluster size: {:.6}", s.cluster_relative_size)?;
    writeln!(out, "  Input separator: {}", s.input_separator as char)?;
    writeln!(out, "  Output separator: {}", s.list_separator as char)?;
    writeln!(out, "  Header is {}", on_off(s.header))?;
    writeln!(out, "  Automatic data value scaling is {}", on_off(s.auto_scale))?;
    writeln!(out, "  Aggregate is {}", on_off(s.aggregate))?;
    writeln!(out, "  Unique samples is {}", on_off(s.unique_samples > 0))?;
    writeln!(out, "  Nearest distance analysis is {}", on_off(s.nearest))?;
    writeln!(out, "  Print string: \"{}\"", s.template)?;
    writeln!(out)?;

    dim_list(out, "Dimensions used in analysis: ", &engine.dims.dim_idx)?;
    dim_list(out, "User ignored dimensions: ", &engine.dims.ignore_idx)?;
    dim_list(out, "User included dimensions: ", &engine.dims.include_idx)?;
    dim_list(out, "Category dimensions: ", &engine.dims.category_idx)?;
    dim_list(out, "Label dimensions: ", &engine.dims.label_idx)?;
    dim_list(out, "Dimensions treated as text: ", &engine.dims.text_idx)?;
    writeln!(out)?;
    writeln!(out, "  Density is sample max - min range divided by sample count")?;
    writeln!(
        out,
        "  Cluster coverage is ratio between 0 - 1, where 1 = clusters cover all samples"
    )?;

    if !engine.forests.is_empty() {
        writeln!(out, "\nForest data:")?;
    }

    for idx in 0..engine.forests.len() {
        if !engine.forests[idx].filter {
            engine.ensure_forest_score(idx);
            if s.cluster_relative_size > 0.0 {
                engine.ensure_clusters(idx);
            }
        }
        let f = &engine.forests[idx];

        writeln!(out, "\n  Forest category string: '{}'", f.category)?;
        writeln!(out, "    Filter is {}", on_off(f.filter))?;
        writeln!(out, "    Number of samples: {}", f.samples.len())?;

        if !f.filter {
            writeln!(out, "    Average path length (c): {:.6}", f.c)?;
            writeln!(out, "    Max. tree height: {}", f.height_limit)?;
            match s.score_mode {
                ScoreMode::Scaled => writeln!(
                    out,
                    "    Forest score range is between {:.6} and {:.6}, this is used to scale data scores to 0..1 range",
                    f.min_score, f.max_score
                )?,
                ScoreMode::Percentile => writeln!(
                    out,
                    "    Percentage based score: {:.6}, {:.2}% of samples have lower score",
                    f.percentage_score, s.outlier_score
                )?,
                ScoreMode::Raw => {}
            }
        }

        if s.nearest {
            writeln!(
                out,
                "    Average{}sample point distance for a single tree: {:.6}",
                if s.auto_scale { " scaled " } else { " " },
                f.avg_sample_dist
            )?;
        }

        if let Some(stamp) = Local.timestamp_opt(f.last_updated, 0).single() {
            writeln!(out, "    Last updated: {}", stamp.format("%c"))?;
        }

        if f.samples.is_empty() {
            continue;
        }

        writeln!(out)?;
        writeln!(out, "    Dimension sample value summary:")?;
        write!(out, "    {:>15}", "")?;
        for i in 0..dimensions {
            write!(out, "{:>width$}", i + 1, width = width)?;
        }
        writeln!(out)?;

        let rows: [(&str, &[f64]); 4] = [
            ("Maximum value", &f.max),
            ("Minimum value", &f.min),
            ("Average value", &f.avg),
            ("Density", &f.density),
        ];
        for (name, values) in rows {
            write!(out, "    {:>15}", name)?;
            for i in 0..dimensions {
                let v = values.get(i).copied().unwrap_or(0.0);
                write!(out, "{:>width$.prec$}", v, width = width, prec = s.decimals)?;
            }
            writeln!(out)?;
        }

        if !f.filter && s.cluster_relative_size > 0.0 {
            writeln!(out)?;
            writeln!(
                out,
                "    Forest cluster centers, cluster radius: {:.6}, cluster coverage: {:.6}",
                f.cluster_radius, f.cluster_coverage
            )?;
            writeln!(out, "    {:>15}", "Cluster number")?;
            for (i, &center) in f.cluster_centers.iter().enumerate() {
                write!(out, "    {:>15}", i + 1)?;
                for d in 0..dimensions {
                    write!(
                        out,
                        "{:>width$.prec$}",
                        f.samples[center].values[d],
                        width = width,
                        prec = s.decimals
                    )?;
                }
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

/// ASCII density map: each dimension row shows 100 buckets between the
/// smallest and largest value, the digit giving tenths of samples in the
/// bucket.
pub fn print_sample_density<W: Write>(
    engine: &Engine,
    out: &mut W,
    common_scale: bool,
) -> Result<()> {
    const DIGITS: &[u8] = b"0123456789#";
    let dimensions = engine.dims.dimensions;

    writeln!(out, "Sample value density map")?;
    writeln!(
        out,
        "Each dimension is divided into {} buckets, the digit under a bucket means number of 1/10 of samples in that bucket, # means all samples belong to one bucket",
        DENSITY_MAX
    )?;
    writeln!(out, "Empty means no samples\n")?;

    if engine.forests.is_empty() || dimensions == 0 {
        return Ok(());
    }

    let global_bounds = || -> Option<(f64, f64)> {
        let mut bounds: Option<(f64, f64)> = None;
        for f in &engine.forests {
            for sample in &f.samples {
                for &v in &sample.values {
                    bounds = Some(match bounds {
                        Some((lo, hi)) => (lo.min(v), hi.max(v)),
                        None => (v, v),
                    });
                }
            }
        }
        bounds
    };

    writeln!(out, "\n### Density by forest ###")?;
    for f in &engine.forests {
        if f.samples.is_empty() {
            continue;
        }

        let (min, max) = if common_scale {
            match global_bounds() {
                Some(b) => b,
                None => return Ok(()),
            }
        } else {
            let mut lo = f.samples[0].values[0];
            let mut hi = lo;
            for sample in &f.samples {
                for &v in &sample.values {
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
            (lo, hi)
        };
        let bucket_size = (max - min) / DENSITY_MAX as f64;
        if bucket_size == 0.0 {
            continue;
        }

        writeln!(
            out,
            "\nForest category string: {}, bucket size {:.*}\n",
            f.category, engine.settings.decimals, bucket_size
        )?;
        writeln!(
            out,
            "  {:>10}{:15.prec$} {} {:15.prec$}",
            "Min...Max",
            min,
            "-".repeat(DENSITY_MAX),
            max,
            prec = engine.settings.decimals
        )?;

        for d in 0..dimensions {
            let mut density = [0usize; DENSITY_MAX];
            for sample in &f.samples {
                let mut bucket = ((sample.values[d] - min) / bucket_size) as usize;
                if bucket >= DENSITY_MAX {
                    bucket = DENSITY_MAX - 1;
                }
                density[bucket] += 1;
            }
            write!(out, "  {:>10}{:>15} ", "Dimension", d + 1)?;
            for count in density {
                let tenth = (count as f64 / f.samples.len() as f64) * 10.0;
                if tenth > 0.0 {
                    write!(out, "{}", DIGITS[tenth as usize] as char)?;
                } else {
                    write!(out, " ")?;
                }
            }
            writeln!(out)?;
        }
    }

    writeln!(out, "\n### Density by dimension ###")?;
    for d in 0..dimensions {
        let (min, max) = if common_scale {
            match global_bounds() {
                Some(b) => b,
                None => return Ok(()),
            }
        } else {
            let mut bounds: Option<(f64, f64)> = None;
            for f in &engine.forests {
                for sample in &f.samples {
                    let v = sample.values[d];
                    bounds = Some(match bounds {
                        Some((lo, hi)) => (lo.min(v), hi.max(v)),
                        None => (v, v),
                    });
                }
            }
            match bounds {
                Some(b) => b,
                None => continue,
            }
        };
        let bucket_size = (max - min) / DENSITY_MAX as f64;
        if bucket_size == 0.0 {
            continue;
        }

        writeln!(
            out,
            "\nDimension {}, bucket size {:.*}\n",
            d + 1,
            engine.settings.decimals,
            bucket_size
        )?;
        for f in &engine.forests {
            if f.samples.is_empty() {
                continue;
            }
            let mut density = [0usize; DENSITY_MAX];
            for sample in &f.samples {
                let mut bucket = ((sample.values[d] - min) / bucket_size) as usize;
                if bucket >= DENSITY_MAX {
                    bucket = DENSITY_MAX - 1;
                }
                density[bucket] += 1;
            }
            write!(out, "  {:>10}{:>35} ", "Category:", f.category)?;
            for count in density {
                let tenth = (count as f64 / f.samples.len() as f64) * 10.0;
                if tenth > 0.0 {
                    write!(out, "{}", DIGITS[tenth as usize] as char)?;
                } else {
                    write!(out, " ")?;
                }
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Every sample of every scorable forest with its score.
pub fn print_sample_scores<W: Write>(engine: &mut Engine, out: &mut W) -> Result<()> {
    let dimensions = engine.dims.dimensions;
    let width = engine.settings.dimension_print_width;
    let decimals = engine.settings.decimals;

    writeln!(out, "Sample score list")?;
    for idx in 0..engine.forests.len() {
        if engine.forests[idx].filter {
            continue;
        }
        engine.ensure_forest_score(idx);

        let f = &engine.forests[idx];
        writeln!(out, "\nForest category string: {}", f.category)?;
        write!(out, "  {:>10}", "Score")?;
        for d in 0..dimensions {
            write!(out, "{:>width$}", d + 1, width = width)?;
        }
        writeln!(out)?;

        for sample in &f.samples {
            let score = engine.sample_score_scaled(f, sample);
            write!(out, "  {:>10.6}", score)?;
            for d in 0..dimensions {
                write!(
                    out,
                    "{:>width$.prec$}",
                    sample.values[d],
                    width = width,
                    prec = decimals
                )?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Pearson correlation coefficient with regression slope and y-intercept
/// for every dimension pair of every scorable forest.
pub fn print_correlation<W: Write>(engine: &Engine, out: &mut W) -> Result<()> {
    let dimensions = engine.dims.dimensions;
    if dimensions < 2 {
        return Ok(());
    }

    writeln!(
        out,
        "Correlation coefficient with regression line slope and y-intercept for every dimension attribute pair."
    )?;
    writeln!(
        out,
        "Correlation coefficient has a value between +1 and -1. A value of +1 is total positive linear correlation, 0 is no linear correlation, and -1 is total negative linear correlation."
    )?;
    writeln!(
        out,
        "Value 0 is also returned in case the correlation coefficient is undefined."
    )?;

    for f in &engine.forests {
        if f.filter || f.samples.len() < 2 {
            continue;
        }
        writeln!(
            out,
            "\nForest category string: {}, number of samples: {}",
            f.category,
            f.samples.len()
        )?;
        writeln!(
            out,
            "  {:>12} {:>15} {:>15}{:>15}{:>15}",
            "Coefficient", "Slope", "y-intercept", "Dimension x", "Dimension y"
        )?;

        let n = f.samples.len() as f64;
        let stddev: Vec<f64> = (0..dimensions)
            .map(|d| {
                let ss: f64 = f
                    .samples
                    .iter()
                    .map(|s| (s.values[d] - f.avg[d]).powi(2))
                    .sum();
                (ss / (n - 1.0)).sqrt()
            })
            .collect();

        for a in 0..dimensions {
            for b in (a + 1)..dimensions {
                let (cc, slope) = if stddev[a] > 0.0 && stddev[b] > 0.0 {
                    let psum: f64 = f
                        .samples
                        .iter()
                        .map(|s| s.values[a] * s.values[b])
                        .sum();
                    let cc = (psum - n * f.avg[a] * f.avg[b]) / ((n - 1.0) * stddev[a] * stddev[b]);
                    (cc, cc * (stddev[b] / stddev[a]))
                } else {
                    (0.0, 0.0)
                };
                writeln!(
                    out,
                    "  {:>12.6} {:>15.6} {:>15.6}{:>15}{:>15}",
                    cc,
                    slope,
                    f.avg[b] - slope * f.avg[a],
                    a + 1,
                    b + 1
                )?;
            }
        }
    }
    Ok(())
}
